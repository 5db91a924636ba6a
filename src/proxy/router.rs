//! Per-request dispatch for both served listeners.
//!
//! Three outcomes: CONNECT requests become re-injected tunnels carrying
//! their target as an original destination; `application/grpc*` content
//! (native and gRPC-Web) goes to the relay; everything else goes to the
//! recording reverse proxy.

use std::convert::Infallible;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::har::HarRecorder;
use crate::mux::{ClientConn, ConnInjector, OriginalDst};
use crate::relay::RpcRelay;
use crate::upstream::{ensure_port, split_authority, OutboundDialer};

use super::{empty_body, reverse, BoxError, ConnContext, ProxyBody};

/// Shared request router for all served connections.
pub struct Router {
    grpc: tonic_web::CorsGrpcWeb<RpcRelay>,
    recorder: Arc<HarRecorder>,
    dialer: Arc<OutboundDialer>,
    injector: ConnInjector,
}

impl Router {
    pub fn new(
        relay: RpcRelay,
        recorder: Arc<HarRecorder>,
        dialer: Arc<OutboundDialer>,
        injector: ConnInjector,
    ) -> Self {
        Self {
            grpc: tonic_web::enable(relay),
            recorder,
            dialer,
            injector,
        }
    }

    pub async fn route(
        &self,
        mut req: Request<Incoming>,
        ctx: ConnContext,
    ) -> Result<Response<ProxyBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req).await);
        }

        req.extensions_mut().insert(ctx.clone());

        if is_grpc(req.headers()) {
            let grpc = self.grpc.clone();
            let response = match grpc.oneshot(req.map(tonic::body::boxed)).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            return Ok(response.map(|body| {
                body.map_err(|status| Box::new(status) as BoxError)
                    .boxed_unsync()
            }));
        }

        Ok(reverse::handle(req, &ctx, &self.recorder, &self.dialer).await)
    }

    /// Answer `200 OK`, then hand the upgraded byte stream back to the
    /// classifier with the CONNECT target recorded as its original
    /// destination. The follow-up bytes are then classified exactly like a
    /// fresh connection.
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            warn!("CONNECT request without authority");
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        };

        let authority = ensure_port(&authority, true);
        let tls = split_authority(&authority).1 == Some(443);
        debug!(%authority, tls, "CONNECT tunnel requested");

        let injector = self.injector.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let conn = ClientConn::new(
                        Box::new(TokioIo::new(upgraded)),
                        None,
                        Some(OriginalDst {
                            tls,
                            authority: authority.clone(),
                        }),
                    );
                    if let Err(e) = injector.inject(conn).await {
                        debug!(%authority, error = %e, "failed re-injecting CONNECT tunnel");
                    }
                }
                Err(e) => {
                    warn!(%authority, error = %e, "CONNECT upgrade failed");
                }
            }
        });

        Response::new(empty_body())
    }
}

fn is_grpc(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .map(|value| value.as_bytes().starts_with(b"application/grpc"))
        .unwrap_or(false)
}
