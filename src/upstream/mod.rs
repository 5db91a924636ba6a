//! Upstream connection management: the environment-aware outbound dialer and
//! the pooled, single-flight RPC channel map.

pub mod dialer;
pub mod error;
pub mod pool;

pub use dialer::{
    ensure_port, server_name, split_authority, tls_client_config, tls_client_config_h2, Dialed,
    OutboundDialer, UpstreamIo,
};
pub use error::UpstreamError;
pub use pool::{ChannelPool, PoolKey};
