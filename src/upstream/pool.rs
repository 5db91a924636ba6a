//! Pooled upstream RPC channels.
//!
//! One long-lived HTTP/2 channel per `(authority, tls)` pair, established
//! lazily through the outbound dialer. Misses are single-flight per key so a
//! thundering herd of first calls produces exactly one upstream connection
//! and no half-open leftovers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hyper_util::rt::TokioIo;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use super::dialer::{
    server_name, split_authority, tls_client_config_h2, OutboundDialer, UpstreamIo,
};
use super::error::UpstreamError;

/// Identity of one pooled upstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub authority: String,
    pub tls: bool,
}

/// Keyed map of long-lived upstream channels.
pub struct ChannelPool {
    dialer: Arc<OutboundDialer>,
    entries: Mutex<HashMap<PoolKey, Arc<OnceCell<Channel>>>>,
}

impl ChannelPool {
    pub fn new(dialer: Arc<OutboundDialer>) -> Self {
        Self {
            dialer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the channel for `(authority, tls)`, dialling on first use.
    ///
    /// Concurrent calls for the same key share one in-flight dial; clones of
    /// the stored channel multiplex the same underlying connection. A failed
    /// dial leaves the slot empty so the next call retries.
    pub async fn get(&self, authority: &str, tls: bool) -> Result<Channel, UpstreamError> {
        let key = PoolKey {
            authority: authority.to_string(),
            tls,
        };
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.entry(key.clone()).or_default().clone()
        };
        let channel = cell.get_or_try_init(|| self.connect(key)).await?;
        Ok(channel.clone())
    }

    async fn connect(&self, key: PoolKey) -> Result<Channel, UpstreamError> {
        debug!(authority = %key.authority, tls = key.tls, "dialling upstream channel");

        let endpoint = Endpoint::from_shared(format!("http://{}", key.authority))?;

        let dialer = self.dialer.clone();
        let authority = key.authority.clone();
        let tls = key.tls;
        let connector = tower::service_fn(move |_uri: Uri| {
            let dialer = dialer.clone();
            let authority = authority.clone();
            async move {
                let dialed = dialer.dial(&authority).await?;
                let io = if tls {
                    let (host, _) = split_authority(&authority);
                    let name = server_name(host)?;
                    let connector = TlsConnector::from(tls_client_config_h2());
                    let stream = connector
                        .connect(name, dialed.stream)
                        .await
                        .map_err(|e| UpstreamError::Tls(e.to_string()))?;
                    UpstreamIo::Tls(Box::new(stream))
                } else {
                    UpstreamIo::Plain(dialed.stream)
                };
                Ok::<_, UpstreamError>(TokioIo::new(io))
            }
        });

        let channel = endpoint.connect_with_connector(connector).await?;
        Ok(channel)
    }

    /// Number of keys with an entry (established or in flight).
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pooled channel. Existing clones finish their in-flight
    /// calls; new calls dial afresh.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let drained = entries.len();
        entries.clear();
        debug!(channels = drained, "upstream pool shut down");
    }
}
