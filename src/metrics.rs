//! Metric helpers for `wirebroker`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper compiles to a no-op.

use std::time::Duration;

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "wirebroker_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "wirebroker_frames_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "wirebroker_errors_total";
/// Name of the counter tracking messages delivered to at least one queue.
pub const MESSAGES_ROUTED: &str = "wirebroker_messages_routed_total";
/// Name of the counter tracking messages that matched no queue.
pub const MESSAGES_UNROUTABLE: &str = "wirebroker_messages_unroutable_total";
/// Name of the histogram timing outbound frame writes.
pub const OUTBOUND_WRITE_SECONDS: &str = "wirebroker_outbound_write_seconds";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Inbound frames received from a client.
    Inbound,
    /// Outbound frames sent to a client.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Category attached to [`ERRORS_TOTAL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A hard close caused by a protocol violation or I/O failure.
    Protocol,
    /// A `connection.close` sent to the peer.
    Connection,
    /// A `channel.close` sent to the peer.
    Channel,
}

impl ErrorKind {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Connection => "connection",
            ErrorKind::Channel => "channel",
        }
    }
}

/// Increment the active connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

/// Decrement the active connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

/// Holds one unit of the active connections gauge for its lifetime.
#[must_use = "dropping the guard decrements the gauge immediately"]
#[derive(Debug)]
pub struct ConnectionGauge(());

impl ConnectionGauge {
    pub fn acquire() -> Self {
        inc_connections();
        Self(())
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) { dec_connections(); }
}

/// Record a processed frame for the given direction.
#[cfg(feature = "metrics")]
pub fn inc_frames(direction: Direction) {
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
}

/// Record an error occurrence.
#[cfg(feature = "metrics")]
pub fn inc_errors(kind: ErrorKind) {
    counter!(ERRORS_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record a message delivered to at least one queue.
#[cfg(feature = "metrics")]
pub fn inc_routed() { counter!(MESSAGES_ROUTED).increment(1); }

/// Record a message that matched no queue.
#[cfg(feature = "metrics")]
pub fn inc_unroutable() { counter!(MESSAGES_UNROUTABLE).increment(1); }

/// Record how long one outbound frame took to write.
#[cfg(feature = "metrics")]
pub fn record_write(elapsed: Duration) {
    histogram!(OUTBOUND_WRITE_SECONDS).record(elapsed.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn inc_frames(_direction: Direction) {}

#[cfg(not(feature = "metrics"))]
pub fn inc_errors(_kind: ErrorKind) {}

#[cfg(not(feature = "metrics"))]
pub fn inc_routed() {}

#[cfg(not(feature = "metrics"))]
pub fn inc_unroutable() {}

#[cfg(not(feature = "metrics"))]
pub fn record_write(_elapsed: Duration) {}
