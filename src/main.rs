//! grpcsnoop binary entry point: argument parsing, logging initialisation,
//! and server bootstrap.

use anyhow::{Context, Result};
use clap::Parser;
use grpcsnoop::cli::Cli;
use grpcsnoop::proxy::ProxyServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level).context("failed to initialise logging")?;

    let server = ProxyServer::builder()
        .interface(cli.interface)
        .port(cli.port)
        .destination(cli.destination)
        .ca_material(cli.cert, cli.key)
        .har_path(cli.har)
        .key_log_path(cli.key_log)
        .system_proxy(cli.system_proxy)
        .build();

    server.run().await.context("proxy server failed")?;
    Ok(())
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log filter '{filter}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
