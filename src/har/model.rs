//! HAR 1.2 data model (softwareishard.com/blog/har-12-spec).
//!
//! Serialised with the exact field casing HAR viewers expect. Only the
//! canonical `serverIPAddress` key is emitted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct Har<'a> {
    pub log: &'a HarLog,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub pages: Vec<HarPage>,
    pub entries: Vec<HarEntry>,
}

impl HarLog {
    pub fn new(creator_name: &str, creator_version: &str) -> Self {
        Self {
            version: "1.2".to_string(),
            creator: HarCreator {
                name: creator_name.to_string(),
                version: creator_version.to_string(),
            },
            pages: Vec::new(),
            entries: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

/// Pages are always empty for a proxy capture; the type exists so the
/// `pages` array serialises with the right shape.
#[derive(Clone, Debug, Serialize)]
pub struct HarPage {}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    /// Total round-trip time in milliseconds.
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: HarCache,
    pub timings: HarTimings,
    #[serde(rename = "serverIPAddress")]
    pub server_ip_address: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<HarCookie>,
    pub headers: Vec<HarNameValuePair>,
    pub query_string: Vec<HarNameValuePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    pub body_size: i64,
    pub headers_size: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<HarCookie>,
    pub headers: Vec<HarNameValuePair>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub body_size: i64,
    pub headers_size: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub http_only: bool,
    pub secure: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarNameValuePair {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub params: Vec<HarNameValuePair>,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarCache {}

#[derive(Clone, Debug, Serialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

/// ISO-8601 with millisecond precision and timezone, as HAR viewers expect.
pub fn format_started(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
