//! End-to-end HTTP scenarios: plaintext forwarding with HAR capture, CSP
//! rewriting, synthetic 502s, CONNECT tunnelling, and TLS interception.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use grpcsnoop::proxy::ProxyServer;

/// A plain HTTP/1.1 upstream answering per-path canned responses.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let response = match req.uri().path() {
                        "/hello" => Response::builder()
                            .status(StatusCode::OK)
                            .header(CONTENT_TYPE, "text/plain")
                            .body(Full::new(Bytes::from_static(b"hi")))
                            .unwrap(),
                        "/csp" => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Security-Policy", "default-src 'self'")
                            .body(Full::new(Bytes::from_static(b"<html></html>")))
                            .unwrap(),
                        "/gzip" => {
                            use std::io::Write as _;
                            let mut encoder = flate2::write::GzEncoder::new(
                                Vec::new(),
                                flate2::Compression::default(),
                            );
                            encoder.write_all(b"decoded payload").unwrap();
                            let compressed = encoder.finish().unwrap();
                            Response::builder()
                                .status(StatusCode::OK)
                                .header(CONTENT_ENCODING, "gzip")
                                .body(Full::new(Bytes::from(compressed)))
                                .unwrap()
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    };
                    Ok::<_, Infallible>(response)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn spawn_proxy(har_path: Option<&Path>) -> SocketAddr {
    let bound = ProxyServer::builder()
        .interface("127.0.0.1")
        .port(0)
        .har_path(har_path.map(Path::to_path_buf))
        .build()
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    tokio::spawn(bound.serve());
    addr
}

/// Send one origin-form request through the proxy via a fresh client conn.
async fn request_via_proxy(
    proxy: SocketAddr,
    host: &str,
    path: &str,
) -> (StatusCode, http::HeaderMap, Bytes) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri(path)
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}

fn read_har(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn plaintext_get_is_forwarded_and_recorded() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let har_path = dir.path().join("session.har");
    let proxy = spawn_proxy(Some(&har_path)).await;

    let (status, _headers, body) =
        request_via_proxy(proxy, &upstream.to_string(), "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hi");

    let har = read_har(&har_path);
    let entries = har["log"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["request"]["method"], "GET");
    assert_eq!(
        entry["request"]["url"],
        format!("http://{upstream}/hello")
    );
    assert_eq!(entry["response"]["status"], 200);
    assert_eq!(entry["response"]["content"]["text"], "hi");
    assert_eq!(entry["serverIPAddress"], "127.0.0.1");
}

#[tokio::test]
async fn csp_headers_are_replaced() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let har_path = dir.path().join("session.har");
    let proxy = spawn_proxy(Some(&har_path)).await;

    let (status, headers, _body) =
        request_via_proxy(proxy, &upstream.to_string(), "/csp").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get("content-security-policy")
            .and_then(|v| v.to_str().ok()),
        Some("default-src * blob: data: 'unsafe-inline' 'unsafe-eval';")
    );
    assert!(headers.get("x-content-security-policy").is_some());

    let har = read_har(&har_path);
    // The HAR records what the upstream actually sent.
    let recorded = har["log"]["entries"][0]["response"]["headers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|pair| pair["name"] == "content-security-policy")
        .cloned()
        .unwrap();
    assert_eq!(recorded["value"], "default-src 'self'");
}

#[tokio::test]
async fn gzip_responses_reach_client_raw_but_record_decoded() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let har_path = dir.path().join("session.har");
    let proxy = spawn_proxy(Some(&har_path)).await;

    let (status, headers, body) =
        request_via_proxy(proxy, &upstream.to_string(), "/gzip").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    // Client sees the wire form.
    assert!(body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b);

    let har = read_har(&har_path);
    assert_eq!(
        har["log"]["entries"][0]["response"]["content"]["text"],
        "decoded payload"
    );
}

#[tokio::test]
async fn upstream_refusal_becomes_recorded_502() {
    // Reserve a port and close it again so nothing is listening there.
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let har_path = dir.path().join("session.har");
    let proxy = spawn_proxy(Some(&har_path)).await;

    let (status, headers, _body) =
        request_via_proxy(proxy, &closed.to_string(), "/hello").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error_header = headers
        .get("x-request-error")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(!error_header.is_empty());

    let har = read_har(&har_path);
    let entry = &har["log"]["entries"][0];
    assert_eq!(entry["response"]["status"], 502);
    assert_eq!(entry["response"]["statusText"], "Bad Gateway");
}

#[tokio::test]
async fn connect_tunnel_reaches_plaintext_upstream() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(None).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    // Read the CONNECT response head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    // Inside the tunnel: a plain HTTP request, classified afresh.
    stream
        .write_all(
            format!("GET /hello HTTP/1.1\r\nHost: {upstream}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200"), "unexpected reply: {reply}");
    assert!(reply.ends_with("hi"), "unexpected reply: {reply}");
}

#[tokio::test]
async fn tls_interception_presents_minted_leaf() {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls_pki_types::ServerName;

    // A throwaway CA written to disk for the proxy to sign leaves with.
    let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("interception test CA".to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let ca_cert = params.self_signed(&ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.crt");
    let key_path = dir.path().join("ca.key");
    std::fs::write(&cert_path, ca_cert.pem()).unwrap();
    std::fs::write(&key_path, ca_key.serialize_pem()).unwrap();
    let har_path = dir.path().join("session.har");

    let bound = ProxyServer::builder()
        .interface("127.0.0.1")
        .port(0)
        .ca_material(Some(cert_path), Some(key_path))
        .har_path(Some(har_path.clone()))
        .build()
        .bind()
        .await
        .unwrap();
    let proxy = bound.local_addr();
    tokio::spawn(bound.serve());

    // Client trusting only the throwaway CA.
    let mut roots = rustls::RootCertStore::empty();
    let ca_der = rustls_pemfile::certs(&mut ca_cert.pem().as_bytes())
        .next()
        .unwrap()
        .unwrap();
    roots.add(ca_der).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(proxy).await.unwrap();
    let server_name = ServerName::try_from("intercepted.test").unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();

    // The handshake succeeding proves the minted leaf chains to our CA.
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    // No upstream actually serves this name, so the proxied request comes
    // back as a synthesised 502 recorded under an https URL.
    let request = Request::builder()
        .uri("/x")
        .header(HOST, HeaderValue::from_static("intercepted.test"))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("x-request-error").is_some());

    let har = read_har(&har_path);
    let entry = &har["log"]["entries"][0];
    assert_eq!(entry["request"]["url"], "https://intercepted.test/x");
    assert_eq!(entry["response"]["status"], 502);
}

#[tokio::test]
async fn har_records_exactly_one_entry_per_request() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let har_path = dir.path().join("session.har");
    let proxy = spawn_proxy(Some(&har_path)).await;

    for _ in 0..3 {
        let (status, _, _) = request_via_proxy(proxy, &upstream.to_string(), "/hello").await;
        assert_eq!(status, StatusCode::OK);
    }

    let har = read_har(&har_path);
    assert_eq!(har["log"]["entries"].as_array().unwrap().len(), 3);
    assert_eq!(har["log"]["version"], "1.2");
    assert_eq!(har["log"]["creator"]["name"], "grpcsnoop");
}
