//! Heartbeat timers.
//!
//! Both timers tick every half interval. The sender emits an empty frame on
//! channel 0; the watchdog hard-closes a peer that has sent nothing for two
//! full intervals.

use std::sync::Arc;

use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use super::ConnectionShared;
use crate::codec::WireFrame;

fn ticker(interval: Duration) -> time::Interval {
    let period = (interval / 2).max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub(super) async fn send_heartbeats(conn: Arc<ConnectionShared>, interval: Duration) {
    let mut ticker = ticker(interval);
    loop {
        tokio::select! {
            biased;
            () = conn.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !conn.send(WireFrame::heartbeat()).await {
                    break;
                }
            }
        }
    }
}

pub(super) async fn watch_receive_timeout(conn: Arc<ConnectionShared>, interval: Duration) {
    let mut ticker = ticker(interval);
    loop {
        tokio::select! {
            biased;
            () = conn.shutdown.cancelled() => break,
            now = ticker.tick() => {
                if conn.ttl_expired(now) {
                    conn.protocol_violation("missed heartbeats");
                    break;
                }
            }
        }
    }
}
