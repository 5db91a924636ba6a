//! Connection multiplexing: peek-based classification of one listening
//! socket into plaintext and TLS streams, with blind forwarding for
//! transparently redirected connections the proxy cannot terminate.

pub mod classify;
pub mod conn;
pub mod error;
pub mod origdst;
pub mod peek;
pub mod split;

pub use classify::{ChannelListener, ConnInjector, Middleware};
pub use conn::{ClientConn, OriginalDst, SessionIo};
pub use error::MuxError;
pub use peek::PeekStream;
pub use split::{split, SplitOptions, TlsSplit};
