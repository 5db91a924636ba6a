//! Recording reverse proxy for non-gRPC HTTP traffic.
//!
//! Each request is captured, forwarded to its destination over a fresh
//! HTTP/1.1 leg through the outbound dialer, and its response captured into
//! the HAR log before being handed back to the client byte-for-byte (minus
//! the Content-Security-Policy rewrite that keeps intercepted web apps
//! loading). Upstream failures become synthetic 502s carrying the error in
//! `X-Request-Error`; they are recorded like any other response and never
//! propagate as errors.

use std::io::Read as _;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use flate2::read::{DeflateDecoder, GzDecoder};
use http::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, COOKIE, HOST,
    SET_COOKIE,
};
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::har::{
    format_started, HarCache, HarContent, HarCookie, HarEntry, HarNameValuePair, HarPostData,
    HarRecorder, HarRequest, HarResponse, HarTimings,
};
use crate::upstream::{
    ensure_port, server_name, split_authority, tls_client_config, OutboundDialer, UpstreamIo,
};

use super::{empty_body, full_body, ConnContext, ProxyBody};

/// Replacement policy so injected resources keep loading in intercepted apps.
const PERMISSIVE_CSP: &str = "default-src * blob: data: 'unsafe-inline' 'unsafe-eval';";

const CSP_HEADER_NAMES: &[&str] = &[
    "content-security-policy",
    "x-content-security-policy",
    "webkit-csp",
    "x-webkit-csp",
];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward one HTTP request and record the round-trip.
pub async fn handle(
    req: Request<Incoming>,
    ctx: &ConnContext,
    recorder: &HarRecorder,
    dialer: &OutboundDialer,
) -> Response<ProxyBody> {
    let started_at = Utc::now();
    let started = Instant::now();

    let target = resolve_target(&req, ctx);
    let (https, authority) = match &target {
        Some((https, authority)) => (*https, authority.clone()),
        None => (ctx.tls, String::new()),
    };

    let scheme = if https { "https" } else { "http" };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let url = format!("{scheme}://{authority}{path_and_query}");

    let method = req.method().clone();
    let version = req.version();
    let query = req.uri().query().map(str::to_owned);
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed reading request body");
            Bytes::new()
        }
    };

    let har_request = capture_request(
        &method,
        &url,
        version,
        &parts.headers,
        query.as_deref(),
        &body_bytes,
    );

    let outcome = if authority.is_empty() {
        Err("request carries no destination".to_string())
    } else {
        round_trip(
            dialer,
            https,
            &authority,
            &parts.headers,
            &method,
            &path_and_query,
            body_bytes,
        )
        .await
    };
    let send_ms = millis(started.elapsed());

    match outcome {
        Ok((upstream_response, peer, via_proxy)) => {
            let receive_started = Instant::now();
            let (mut resp_parts, resp_body) = upstream_response.into_parts();
            let raw_body = match resp_body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(error = %e, "failed reading upstream response body");
                    Bytes::new()
                }
            };
            let decoded = decode_body(&resp_parts.headers, &raw_body);
            let har_response = capture_response(
                resp_parts.status,
                resp_parts.version,
                &resp_parts.headers,
                &raw_body,
                &decoded,
            );
            let receive_ms = millis(receive_started.elapsed());

            recorder.append(HarEntry {
                started_date_time: format_started(started_at),
                time: millis(started.elapsed()),
                request: har_request,
                response: har_response,
                cache: HarCache {},
                timings: HarTimings {
                    send: send_ms,
                    wait: 0.0,
                    receive: receive_ms,
                },
                server_ip_address: server_ip(&authority, Some(peer), via_proxy).await,
            });

            strip_hop_by_hop(&mut resp_parts.headers);
            rewrite_csp(&mut resp_parts.headers);

            let mut response = Response::new(full_body(raw_body));
            *response.status_mut() = resp_parts.status;
            *response.headers_mut() = resp_parts.headers;
            response
        }
        Err(message) => {
            warn!(url = %url, error = %message, "upstream round trip failed");

            recorder.append(HarEntry {
                started_date_time: format_started(started_at),
                time: millis(started.elapsed()),
                request: har_request,
                response: synthetic_502(&message),
                cache: HarCache {},
                timings: HarTimings {
                    send: send_ms,
                    wait: 0.0,
                    receive: 0.0,
                },
                server_ip_address: if authority.is_empty() {
                    String::new()
                } else {
                    server_ip(&authority, None, true).await
                },
            });

            bad_gateway(&message)
        }
    }
}

/// Target preference: recorded original destination, then the absolute-form
/// request URI, then the `Host` header. The scheme follows the connection
/// (TLS-terminated means an https upstream) unless the URI says otherwise.
fn resolve_target(req: &Request<Incoming>, ctx: &ConnContext) -> Option<(bool, String)> {
    if let Some(dst) = &ctx.original_dst {
        return Some((ctx.tls || dst.tls, dst.authority.clone()));
    }
    if let Some(authority) = req.uri().authority() {
        let https = ctx.tls || req.uri().scheme_str() == Some("https");
        return Some((https, authority.to_string()));
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| (ctx.tls, host.to_string()))
}

async fn round_trip(
    dialer: &OutboundDialer,
    https: bool,
    authority: &str,
    headers: &HeaderMap,
    method: &Method,
    path_and_query: &str,
    body: Bytes,
) -> Result<(Response<Incoming>, IpAddr, bool), String> {
    let authority_port = ensure_port(authority, https);

    let dialed = dialer.dial(&authority_port).await.map_err(|e| e.to_string())?;
    let peer = dialed.peer.ip();
    let via_proxy = dialed.via_proxy;

    let io = if https {
        let (host, _) = split_authority(&authority_port);
        let name = server_name(host).map_err(|e| e.to_string())?;
        let connector = TlsConnector::from(tls_client_config());
        let stream = connector
            .connect(name, dialed.stream)
            .await
            .map_err(|e| format!("upstream TLS handshake failed: {e}"))?;
        UpstreamIo::Tls(Box::new(stream))
    } else {
        UpstreamIo::Plain(dialed.stream)
    };

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "upstream connection ended");
        }
    });

    let mut request = Request::builder()
        .method(method.clone())
        .uri(path_and_query)
        .body(Full::new(body))
        .map_err(|e| e.to_string())?;
    {
        let out = request.headers_mut();
        for (name, value) in headers {
            if name == HOST || HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        out.insert(
            HOST,
            HeaderValue::from_str(authority).map_err(|e| e.to_string())?,
        );
        out.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
    }

    sender
        .send_request(request)
        .await
        .map(|response| (response, peer, via_proxy))
        .map_err(|e| e.to_string())
}

fn capture_request(
    method: &Method,
    url: &str,
    version: Version,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &Bytes,
) -> HarRequest {
    let post_data = (method == Method::POST || method == Method::PUT).then(|| HarPostData {
        mime_type: header_str(headers, CONTENT_TYPE.as_str()),
        params: Vec::new(),
        text: String::from_utf8_lossy(body).into_owned(),
    });

    HarRequest {
        method: method.to_string(),
        url: url.to_string(),
        http_version: format!("{version:?}"),
        cookies: request_cookies(headers),
        headers: header_pairs(headers),
        query_string: query_pairs(query),
        post_data,
        body_size: body.len() as i64,
        headers_size: header_size(headers),
    }
}

fn capture_response(
    status: StatusCode,
    version: Version,
    headers: &HeaderMap,
    raw_body: &Bytes,
    decoded: &str,
) -> HarResponse {
    HarResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        http_version: format!("{version:?}"),
        cookies: response_cookies(headers),
        headers: header_pairs(headers),
        content: HarContent {
            size: decoded.len() as i64,
            mime_type: header_str(headers, CONTENT_TYPE.as_str()),
            text: decoded.to_string(),
        },
        redirect_url: String::new(),
        body_size: raw_body.len() as i64,
        headers_size: header_size(headers),
    }
}

fn synthetic_502(message: &str) -> HarResponse {
    HarResponse {
        status: StatusCode::BAD_GATEWAY.as_u16(),
        status_text: "Bad Gateway".to_string(),
        http_version: "HTTP/1.1".to_string(),
        cookies: Vec::new(),
        headers: vec![HarNameValuePair {
            name: "X-Request-Error".to_string(),
            value: message.to_string(),
        }],
        content: HarContent {
            size: 0,
            mime_type: String::new(),
            text: String::new(),
        },
        redirect_url: String::new(),
        body_size: 0,
        headers_size: -1,
    }
}

/// The client-facing 502: empty body, error text in `X-Request-Error`.
fn bad_gateway(message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    let value = HeaderValue::from_str(message)
        .unwrap_or_else(|_| HeaderValue::from_static("upstream error"));
    response.headers_mut().insert("x-request-error", value);
    response
}

/// Drop every CSP header form and substitute the permissive policy.
fn rewrite_csp(headers: &mut HeaderMap) {
    for name in CSP_HEADER_NAMES {
        headers.remove(*name);
        headers.insert(*name, HeaderValue::from_static(PERMISSIVE_CSP));
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Decode the body for the HAR text per `Content-Encoding`; the wire form is
/// what the client receives.
fn decode_body(headers: &HeaderMap, raw: &[u8]) -> String {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let decoded = match encoding.as_str() {
        "gzip" => {
            let mut out = Vec::new();
            match GzDecoder::new(raw).read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    debug!(error = %e, "failed decoding gzip body");
                    raw.to_vec()
                }
            }
        }
        "deflate" => {
            let mut out = Vec::new();
            match DeflateDecoder::new(raw).read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    debug!(error = %e, "failed decoding deflate body");
                    raw.to_vec()
                }
            }
        }
        _ => raw.to_vec(),
    };

    String::from_utf8_lossy(&decoded).into_owned()
}

async fn server_ip(authority: &str, peer: Option<IpAddr>, via_proxy: bool) -> String {
    let (host, _) = split_authority(authority);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Some(peer) = peer {
        if !via_proxy {
            return peer.to_string();
        }
    }
    match tokio::net::lookup_host((host, 0u16)).await {
        Ok(mut addrs) => addrs
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// One pair per header name, multiple values joined with commas.
fn header_pairs(headers: &HeaderMap) -> Vec<HarNameValuePair> {
    headers
        .keys()
        .map(|name| {
            let value = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join(",");
            HarNameValuePair {
                name: name.to_string(),
                value,
            }
        })
        .collect()
}

fn header_size(headers: &HeaderMap) -> i64 {
    let mut size = 0usize;
    for name in headers.keys() {
        size += name.as_str().len() + 2;
        for value in headers.get_all(name) {
            size += value.as_bytes().len();
        }
    }
    size as i64
}

fn query_pairs(query: Option<&str>) -> Vec<HarNameValuePair> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            HarNameValuePair {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}

fn request_cookies(headers: &HeaderMap) -> Vec<HarCookie> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| HarCookie {
            name: name.to_string(),
            value: value.to_string(),
            path: String::new(),
            domain: String::new(),
            expires: None,
            http_only: false,
            secure: false,
        })
        .collect()
}

fn response_cookies(headers: &HeaderMap) -> Vec<HarCookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

fn parse_set_cookie(value: &str) -> Option<HarCookie> {
    let mut parts = value.split(';');
    let (name, cookie_value) = parts.next()?.trim().split_once('=')?;

    let mut cookie = HarCookie {
        name: name.to_string(),
        value: cookie_value.to_string(),
        path: String::new(),
        domain: String::new(),
        expires: None,
        http_only: false,
        secure: false,
    };

    for attribute in parts {
        let attribute = attribute.trim();
        let (key, attr_value) = attribute
            .split_once('=')
            .map(|(key, value)| (key, Some(value)))
            .unwrap_or((attribute, None));
        match key.to_ascii_lowercase().as_str() {
            "path" => cookie.path = attr_value.unwrap_or("").to_string(),
            "domain" => cookie.domain = attr_value.unwrap_or("").to_string(),
            "expires" => {
                cookie.expires = attr_value
                    .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
                    .map(|value| value.with_timezone(&Utc));
            }
            "httponly" => cookie.http_only = true,
            "secure" => cookie.secure = true,
            _ => {}
        }
    }

    Some(cookie)
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn csp_headers_are_replaced_with_permissive_policy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'"),
        );
        rewrite_csp(&mut headers);

        for name in CSP_HEADER_NAMES {
            assert_eq!(
                headers.get(*name).and_then(|v| v.to_str().ok()),
                Some(PERMISSIVE_CSP),
                "missing permissive policy for {name}"
            );
        }
    }

    #[test]
    fn gzip_bodies_are_decoded_for_capture() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"payload text").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(decode_body(&headers, &compressed), "payload text");
    }

    #[test]
    fn deflate_bodies_are_decoded_for_capture() {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"raw deflate").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
        assert_eq!(decode_body(&headers, &compressed), "raw deflate");
    }

    #[test]
    fn unencoded_bodies_pass_through() {
        let headers = HeaderMap::new();
        assert_eq!(decode_body(&headers, b"plain"), "plain");
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw_bytes() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(decode_body(&headers, b"not gzip"), "not gzip");
    }

    #[test]
    fn query_pairs_split_names_and_values() {
        let pairs = query_pairs(Some("a=1&b=two&flag"));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].name, "a");
        assert_eq!(pairs[0].value, "1");
        assert_eq!(pairs[2].name, "flag");
        assert_eq!(pairs[2].value, "");
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn request_cookie_header_is_split() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session=abc; theme=dark"));
        let cookies = request_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[0].value, "abc");
        assert_eq!(cookies[1].name, "theme");
    }

    #[test]
    fn set_cookie_attributes_are_parsed() {
        let cookie = parse_set_cookie(
            "sid=xyz; Path=/; Domain=api.test; Secure; HttpOnly; Expires=Tue, 01 Jul 2025 10:00:00 GMT",
        )
        .unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "xyz");
        assert_eq!(cookie.path, "/");
        assert_eq!(cookie.domain, "api.test");
        assert!(cookie.secure);
        assert!(cookie.http_only);
        assert!(cookie.expires.is_some());
    }

    #[test]
    fn header_size_counts_names_and_values() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("upstream.test"));
        // "host" (4) + 2 + "upstream.test" (13)
        assert_eq!(header_size(&headers), 19);
    }

    #[test]
    fn post_requests_capture_body_text() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let request = capture_request(
            &Method::POST,
            "http://upstream.test/submit",
            Version::HTTP_11,
            &headers,
            None,
            &Bytes::from_static(b"{\"k\":1}"),
        );
        let post = request.post_data.unwrap();
        assert_eq!(post.mime_type, "application/json");
        assert_eq!(post.text, "{\"k\":1}");
        assert_eq!(request.body_size, 7);
    }

    #[test]
    fn get_requests_have_no_post_data() {
        let request = capture_request(
            &Method::GET,
            "http://upstream.test/",
            Version::HTTP_11,
            &HeaderMap::new(),
            Some("q=1"),
            &Bytes::new(),
        );
        assert!(request.post_data.is_none());
        assert_eq!(request.query_string.len(), 1);
    }

    #[test]
    fn synthetic_502_carries_error_header() {
        let response = synthetic_502("connection refused");
        assert_eq!(response.status, 502);
        assert_eq!(response.headers[0].name, "X-Request-Error");
        assert_eq!(response.headers[0].value, "connection refused");
    }
}
