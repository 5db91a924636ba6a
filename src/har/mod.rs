//! HTTP Archive capture: the HAR 1.2 data model and the shared recorder.

pub mod model;
pub mod recorder;

pub use model::{
    format_started, HarCache, HarContent, HarCookie, HarEntry, HarNameValuePair, HarPostData,
    HarRequest, HarResponse, HarTimings,
};
pub use recorder::HarRecorder;
