//! Bidirectional streaming forwarder for unknown RPC methods.
//!
//! The proxy registers no services, so every incoming call lands here. The
//! handler resolves the upstream authority, opens a mirrored client stream
//! through the channel pool, and pumps frames in both directions on their own
//! tasks. End-of-stream, the terminal status, and trailing metadata all flow
//! through from the upstream.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::BoxBody;
use tonic::client::Grpc as ClientGrpc;
use tonic::codec::{CompressionEncoding, EnabledCompressionEncodings};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::server::{Grpc as ServerGrpc, StreamingService};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::debug;

use crate::proxy::ConnContext;
use crate::upstream::{ensure_port, split_authority, ChannelPool};

use super::codec::RawCodec;

/// Generous ceiling so services that upped their own limits still fit.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Per-direction frame buffer between the two halves of a relayed call.
const FORWARD_BUFFER: usize = 16;

/// Headers never forwarded upstream: hop-by-hop and codec-managed.
const HOP_BY_HOP: &[&str] = &[
    "te",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-type",
    "content-length",
    "user-agent",
    "accept-encoding",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// The gRPC relay, shared across connections.
#[derive(Clone)]
pub struct RpcRelay {
    pool: Arc<ChannelPool>,
    destination: Option<String>,
    local_addr: Option<SocketAddr>,
}

impl RpcRelay {
    /// `destination` is the static fallback authority; `local_addr` is our
    /// own listen address, used to ignore `:authority` values that point
    /// back at the proxy itself.
    pub fn new(
        pool: Arc<ChannelPool>,
        destination: Option<String>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            pool,
            destination,
            local_addr,
        }
    }

    /// Upstream authority preference: recorded original destination, then
    /// the request's `:authority` (unless it is the proxy itself), then the
    /// configured static destination.
    fn resolve_upstream(
        &self,
        ctx: &ConnContext,
        authority_hint: Option<&str>,
    ) -> Result<(String, bool), Status> {
        if let Some(dst) = &ctx.original_dst {
            return Ok((dst.authority.clone(), ctx.tls || dst.tls));
        }
        if let Some(authority) = authority_hint.filter(|a| !a.is_empty() && !self.is_self(a)) {
            return Ok((ensure_port(authority, ctx.tls), ctx.tls));
        }
        if let Some(destination) = &self.destination {
            return Ok((ensure_port(destination, ctx.tls), ctx.tls));
        }
        Err(Status::unavailable(
            "unknown upstream: no original destination, authority, or configured destination",
        ))
    }

    fn is_self(&self, authority: &str) -> bool {
        let Some(local) = self.local_addr else {
            return false;
        };
        let (host, port) = split_authority(authority);
        if port != Some(local.port()) {
            return false;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                ip == local.ip()
                    || (ip.is_loopback() && (local.ip().is_loopback() || local.ip().is_unspecified()))
            }
            Err(_) => host == "localhost",
        }
    }

    async fn forward(
        &self,
        path: String,
        authority_hint: Option<String>,
        ctx: ConnContext,
        request: Request<Streaming<Bytes>>,
    ) -> Result<Response<ReceiverStream<Result<Bytes, Status>>>, Status> {
        let (authority, tls) = self.resolve_upstream(&ctx, authority_hint.as_deref())?;
        debug!(%path, %authority, tls, "relaying RPC");

        let channel = self
            .pool
            .get(&authority, tls)
            .await
            .map_err(|e| Status::unavailable(format!("failed reaching upstream '{authority}': {e}")))?;
        let mut client = ClientGrpc::new(channel)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("upstream '{authority}' not ready: {e}")))?;

        let metadata = request.metadata().clone();
        let mut inbound = request.into_inner();

        // Client -> upstream. Dropping the sender half-closes the upstream
        // call so end-of-stream flows through.
        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(FORWARD_BUFFER);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(error = %status, "inbound stream ended with error");
                        break;
                    }
                }
            }
        });

        let mut outbound = Request::new(ReceiverStream::new(frames_rx));
        *outbound.metadata_mut() = forward_metadata(&metadata);

        let path = PathAndQuery::try_from(path)
            .map_err(|_| Status::internal("invalid RPC method path"))?;
        let upstream_response = client.streaming(outbound, path, RawCodec).await?;

        let response_metadata = strip_reserved(upstream_response.metadata().clone());
        let mut upstream = upstream_response.into_inner();

        // Upstream -> client. The upstream terminal status (and trailing
        // metadata) ends this stream; tonic turns it into our trailers.
        let (reply_tx, reply_rx) = mpsc::channel::<Result<Bytes, Status>>(FORWARD_BUFFER);
        tokio::spawn(async move {
            loop {
                match upstream.message().await {
                    Ok(Some(frame)) => {
                        if reply_tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let status = match upstream.trailers().await {
                            Ok(Some(trailers)) => {
                                Status::with_metadata(Code::Ok, "", strip_reserved(trailers))
                            }
                            Ok(None) => Status::new(Code::Ok, ""),
                            Err(status) => status,
                        };
                        let _ = reply_tx.send(Err(status)).await;
                        return;
                    }
                    Err(status) => {
                        let _ = reply_tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        let mut response = Response::new(ReceiverStream::new(reply_rx));
        *response.metadata_mut() = response_metadata;
        Ok(response)
    }
}

impl tower::Service<http::Request<BoxBody>> for RpcRelay {
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
        let relay = self.clone();
        Box::pin(async move {
            let path = req.uri().path().to_owned();
            let authority_hint = req
                .uri()
                .authority()
                .map(|a| a.to_string())
                .or_else(|| {
                    req.headers()
                        .get(http::header::HOST)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                });
            let ctx = req
                .extensions()
                .get::<ConnContext>()
                .cloned()
                .unwrap_or_default();

            let mut accept = EnabledCompressionEncodings::default();
            accept.enable(CompressionEncoding::Gzip);
            let mut grpc = ServerGrpc::new(RawCodec)
                .apply_compression_config(accept, EnabledCompressionEncodings::default())
                .apply_max_message_size_config(Some(MAX_MESSAGE_SIZE), Some(MAX_MESSAGE_SIZE));

            let call = RelayCall {
                relay,
                path,
                authority_hint,
                ctx,
            };
            Ok(grpc.streaming(call, req).await)
        })
    }
}

/// One invocation of the relay, carrying request-level routing context into
/// the streaming dispatch.
struct RelayCall {
    relay: RpcRelay,
    path: String,
    authority_hint: Option<String>,
    ctx: ConnContext,
}

impl StreamingService<Bytes> for RelayCall {
    type Response = Bytes;
    type ResponseStream = ReceiverStream<Result<Bytes, Status>>;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let relay = self.relay.clone();
        let path = self.path.clone();
        let authority_hint = self.authority_hint.clone();
        let ctx = self.ctx.clone();
        Box::pin(async move { relay.forward(path, authority_hint, ctx, request).await })
    }
}

/// Copy metadata for the upstream call, dropping hop-by-hop and
/// codec-managed entries. Binary metadata passes through untouched.
fn forward_metadata(metadata: &MetadataMap) -> MetadataMap {
    let mut forwarded = MetadataMap::new();
    for entry in metadata.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if !HOP_BY_HOP.contains(&key.as_str()) {
                    forwarded.append(key.clone(), value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) => {
                forwarded.append_bin(key.clone(), value.clone());
            }
        }
    }
    forwarded
}

/// Remove entries the server half re-emits itself.
fn strip_reserved(mut metadata: MetadataMap) -> MetadataMap {
    for name in ["grpc-status", "grpc-message", "content-type", "grpc-encoding", "grpc-accept-encoding"] {
        metadata.remove(name);
    }
    metadata.remove_bin("grpc-status-details-bin");
    metadata
}
