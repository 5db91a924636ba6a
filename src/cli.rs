//! Command-line interface definitions.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Intercepting HTTP/gRPC forward proxy with HAR capture.
///
/// grpcsnoop listens on one port, classifies each inbound connection as
/// plaintext HTTP or TLS, terminates TLS with dynamically minted
/// certificates when CA material is available, passes gRPC calls through
/// untouched, and records all other HTTP traffic into a HAR log.
#[derive(Parser, Debug)]
#[command(name = "grpcsnoop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Interface to listen on.
    #[arg(long, default_value = "localhost")]
    pub interface: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Fallback upstream `host[:port]` for requests that carry no routable
    /// destination of their own.
    #[arg(short, long)]
    pub destination: Option<String>,

    /// CA certificate PEM used to sign interception leaves (a plain server
    /// certificate pins that single certificate instead).
    ///
    /// When neither --cert nor --key is given, ./cert.pem + ./key.pem and
    /// ~/.config/grpcsnoop/ are probed; without any material, TLS traffic
    /// is forwarded without interception.
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// Private key PEM matching --cert.
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Write a HAR 1.2 log of all HTTP traffic to this file.
    ///
    /// The file is rewritten after every recorded request.
    #[arg(long)]
    pub har: Option<PathBuf>,

    /// Write NSS-format TLS key log lines here (for Wireshark).
    #[arg(long)]
    pub key_log: Option<PathBuf>,

    /// Register the listener as the OS system proxy while running.
    #[arg(long)]
    pub system_proxy: bool,

    /// Log filter (e.g. info, debug, grpcsnoop=trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
