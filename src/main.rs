//! `wirebroker` binary: serve the broker on a TCP address until Ctrl+C.

mod cli;

use std::time::Duration;

use clap::Parser;
use wirebroker::{config::BrokerConfig, server::BrokerServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    if let Some(addr) = cli.metrics_listen {
        install_metrics_exporter(addr)?;
    }

    let config = BrokerConfig::default()
        .channel_max(cli.channel_max)
        .frame_max(cli.frame_max)
        .heartbeat(Duration::from_secs(u64::from(cli.heartbeat)))
        .outbound_capacity(cli.outbound_capacity)
        .queue_capacity(cli.queue_capacity)
        .max_message_size(cli.max_message_size);
    let mut server = BrokerServer::new(config);
    if let Some(workers) = cli.workers {
        server = server.workers(workers);
    }
    server.bind(cli.bind)?.run().await?;
    Ok(())
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics exporter listening: addr={addr}");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!("metrics support not compiled in; ignoring --metrics-listen {addr}");
    Ok(())
}
