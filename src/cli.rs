//! Command line interface for the `wirebroker` binary.
//!
//! Kept free of crate imports so the build script can include it to render
//! the manual page.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `wirebroker` binary.
#[derive(Debug, Parser)]
#[command(name = "wirebroker", version, about = "AMQP 0-9-1 routing broker")]
pub struct Cli {
    /// Address to accept AMQP connections on.
    #[arg(short, long, default_value = "127.0.0.1:5672")]
    pub bind: SocketAddr,

    /// Heartbeat interval offered to clients, in seconds. Zero disables
    /// heartbeats.
    #[arg(long, default_value_t = 60)]
    pub heartbeat: u16,

    /// Highest channel number offered to clients.
    #[arg(long, default_value_t = 2047)]
    pub channel_max: u16,

    /// Largest frame offered to clients, in bytes.
    #[arg(long, default_value_t = 131_072)]
    pub frame_max: u32,

    /// Outbound frames buffered per connection.
    #[arg(long, default_value_t = 100)]
    pub outbound_capacity: usize,

    /// Messages a queue holds before further deliveries to it are dropped.
    #[arg(long, default_value_t = 10_000)]
    pub queue_capacity: usize,

    /// Largest message body accepted from publishers, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_message_size: u64,

    /// Number of accept workers. Defaults to the available parallelism.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,
}
