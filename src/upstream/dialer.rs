//! Outbound connection establishment.
//!
//! All upstream legs go through `OutboundDialer`, which honours the
//! environment's outer HTTP proxy settings (`HTTPS_PROXY`/`HTTP_PROXY`/
//! `NO_PROXY`) by tunnelling through a CONNECT request when configured.
//! TLS client configuration (native roots) is shared process-wide.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::UpstreamError;

/// Upper bound on the outer proxy's CONNECT response head.
const MAX_CONNECT_RESPONSE: usize = 8192;

/// A TCP leg to (or towards) an upstream.
pub struct Dialed {
    pub stream: TcpStream,
    /// Peer we actually connected to (the outer proxy when `via_proxy`).
    pub peer: SocketAddr,
    pub via_proxy: bool,
}

/// Environment-aware outbound dialer.
#[derive(Clone, Debug, Default)]
pub struct OutboundDialer {
    proxy: Option<String>,
    no_proxy: Vec<String>,
}

impl OutboundDialer {
    /// Dialer honouring `HTTPS_PROXY`/`HTTP_PROXY`/`ALL_PROXY` and `NO_PROXY`.
    pub fn from_env() -> Self {
        let proxy = ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]
            .iter()
            .find_map(|key| std::env::var(key).ok())
            .and_then(|value| parse_proxy_authority(&value));

        let no_proxy = ["NO_PROXY", "no_proxy"]
            .iter()
            .find_map(|key| std::env::var(key).ok())
            .map(|value| {
                value
                    .split(',')
                    .map(|entry| entry.trim().to_string())
                    .filter(|entry| !entry.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self { proxy, no_proxy }
    }

    /// Dialer that always connects directly.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Connect a TCP leg towards `authority` (`host:port`).
    ///
    /// When an outer proxy applies, the returned stream is already tunnelled
    /// through a successful CONNECT.
    pub async fn dial(&self, authority: &str) -> Result<Dialed, UpstreamError> {
        let (host, _) = split_authority(authority);

        if let Some(proxy) = self.proxy.as_deref().filter(|_| !self.bypasses(host)) {
            let stream = TcpStream::connect(proxy)
                .await
                .map_err(|source| UpstreamError::Dial {
                    authority: proxy.to_string(),
                    source,
                })?;
            let peer = stream.peer_addr()?;
            let stream = connect_through_proxy(stream, authority).await?;
            return Ok(Dialed {
                stream,
                peer,
                via_proxy: true,
            });
        }

        let stream = TcpStream::connect(authority)
            .await
            .map_err(|source| UpstreamError::Dial {
                authority: authority.to_string(),
                source,
            })?;
        let peer = stream.peer_addr()?;
        Ok(Dialed {
            stream,
            peer,
            via_proxy: false,
        })
    }

    fn bypasses(&self, host: &str) -> bool {
        self.no_proxy.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            let suffix = entry.trim_start_matches('.');
            host == suffix || host.ends_with(&format!(".{suffix}"))
        })
    }
}

/// Issue a CONNECT for `authority` over `stream` and wait for the 200.
async fn connect_through_proxy(
    mut stream: TcpStream,
    authority: &str,
) -> Result<TcpStream, UpstreamError> {
    debug!(authority, "tunnelling through outer HTTP proxy");

    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        if head.len() > MAX_CONNECT_RESPONSE {
            return Err(UpstreamError::ProxyConnect {
                authority: authority.to_string(),
                status: "oversized response head".into(),
            });
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(UpstreamError::ProxyConnect {
                authority: authority.to_string(),
                status: "connection closed before response".into(),
            });
        }
        head.extend_from_slice(&chunk[..read]);
    }

    let status_line = head
        .split(|&byte| byte == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    let code = status_line.split_whitespace().nth(1).unwrap_or("");
    if code != "200" {
        return Err(UpstreamError::ProxyConnect {
            authority: authority.to_string(),
            status: status_line,
        });
    }

    Ok(stream)
}

/// Reduce a proxy URL (`http://host:port/`) to its authority.
fn parse_proxy_authority(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let authority = without_scheme.trim_end_matches('/');
    if authority.is_empty() {
        return None;
    }
    if split_authority(authority).1.is_some() {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:80"))
    }
}

/// Append the scheme-default port when `authority` has none.
pub fn ensure_port(authority: &str, tls: bool) -> String {
    match split_authority(authority) {
        (_, Some(_)) => authority.to_string(),
        (host, None) => {
            let port = if tls { 443 } else { 80 };
            format!("{host}:{port}")
        }
    }
}

/// Split `host:port` into host and optional port. Brackets on IPv6 literals
/// are stripped from the host part.
pub fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, rest)) = rest.split_once(']') {
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            let mut store = RootCertStore::empty();
            let loaded = rustls_native_certs::load_native_certs();
            for error in loaded.errors {
                debug!(error = %error, "skipping unloadable native root certificate");
            }
            for cert in loaded.certs {
                if let Err(error) = store.add(cert) {
                    debug!(error = %error, "skipping unusable native root certificate");
                }
            }
            debug!(roots = store.len(), "loaded native root certificates");
            Arc::new(store)
        })
        .clone()
}

/// Upstream TLS client configuration verifying against native roots.
pub fn tls_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let config = ClientConfig::builder()
                .with_root_certificates(native_roots())
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// As [`tls_client_config`], additionally offering `h2` via ALPN for
/// HTTP/2-only upstream legs (gRPC).
pub fn tls_client_config_h2() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut config = ClientConfig::builder()
                .with_root_certificates(native_roots())
                .with_no_client_auth();
            config.alpn_protocols = vec![b"h2".to_vec()];
            Arc::new(config)
        })
        .clone()
}

/// Convert a host string into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, UpstreamError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| UpstreamError::ServerName(host.to_string()))
}

/// One upstream leg, plaintext or TLS.
pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_authority_variants() {
        assert_eq!(split_authority("api.test:443"), ("api.test", Some(443)));
        assert_eq!(split_authority("api.test"), ("api.test", None));
        assert_eq!(split_authority("[::1]:8080"), ("::1", Some(8080)));
        assert_eq!(split_authority("api.test:notaport"), ("api.test:notaport", None));
    }

    #[test]
    fn proxy_authority_parsing() {
        assert_eq!(
            parse_proxy_authority("http://proxy.corp:3128"),
            Some("proxy.corp:3128".into())
        );
        assert_eq!(
            parse_proxy_authority("http://proxy.corp/"),
            Some("proxy.corp:80".into())
        );
        assert_eq!(
            parse_proxy_authority("proxy.corp:8080"),
            Some("proxy.corp:8080".into())
        );
        assert_eq!(parse_proxy_authority(""), None);
    }

    #[test]
    fn no_proxy_bypass_rules() {
        let dialer = OutboundDialer {
            proxy: Some("proxy.corp:3128".into()),
            no_proxy: vec!["internal.test".into(), ".corp.example".into()],
        };
        assert!(dialer.bypasses("internal.test"));
        assert!(dialer.bypasses("svc.corp.example"));
        assert!(dialer.bypasses("corp.example"));
        assert!(!dialer.bypasses("external.example"));
    }

    #[tokio::test]
    async fn direct_dial_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = OutboundDialer::direct();
        let dialed = dialer.dial(&addr.to_string()).await.unwrap();
        assert!(!dialed.via_proxy);
        assert_eq!(dialed.peer, addr);
    }

    #[tokio::test]
    async fn connect_is_tunnelled_through_configured_proxy() {
        // A fake outer proxy that accepts any CONNECT.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let read = sock.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..read]).into_owned();
            assert!(head.starts_with("CONNECT upstream.test:443 HTTP/1.1\r\n"));
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = OutboundDialer {
            proxy: Some(proxy_addr.to_string()),
            no_proxy: Vec::new(),
        };
        let dialed = dialer.dial("upstream.test:443").await.unwrap();
        assert!(dialed.via_proxy);
        assert_eq!(dialed.peer, proxy_addr);
    }

    #[tokio::test]
    async fn proxy_refusal_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let dialer = OutboundDialer {
            proxy: Some(proxy_addr.to_string()),
            no_proxy: Vec::new(),
        };
        let result = dialer.dial("blocked.test:443").await;
        assert!(matches!(result, Err(UpstreamError::ProxyConnect { .. })));
    }
}
