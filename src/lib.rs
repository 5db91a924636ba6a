//! grpcsnoop: an intercepting forward proxy for HTTP and gRPC traffic.
//!
//! One listening socket serves plaintext HTTP, HTTP/2 cleartext, and TLS
//! clients. TLS is terminated with per-SNI leaf certificates minted on
//! demand from a configured CA; connections the proxy cannot terminate are
//! blind-forwarded to their original destination. Inside a connection, gRPC
//! (and gRPC-Web) calls are relayed to their upstream as opaque
//! binary-framed streams, while ordinary HTTP is reverse-proxied and
//! recorded into a HAR 1.2 log.
//!
//! # Architecture
//!
//! - **mux**: peek-based connection classification and the TLS/plaintext
//!   split, including transparent-redirect recovery and blind forwarding
//! - **tls**: the CA-backed certificate minter and the terminating acceptor
//! - **upstream**: the environment-aware outbound dialer and the pooled,
//!   single-flight upstream channel map
//! - **relay**: the schema-less gRPC forwarder built on an identity codec
//! - **har**: the HAR data model and rewrite-on-append recorder
//! - **proxy**: request routing, the recording reverse proxy, and the
//!   server bootstrap

#![warn(clippy::all)]

pub mod cli;
pub mod har;
pub mod mux;
pub mod proxy;
pub mod relay;
pub mod tls;
pub mod upstream;
