//! Broker configuration.
//!
//! [`BrokerConfig`] carries the limits a connection offers during tuning and
//! the sizes of its internal queues. Values are the server side of the
//! negotiation; the client may lower them.

use std::time::Duration;

use crate::codec::FRAME_MIN_SIZE;

/// Highest channel number offered by default.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;
/// Largest frame offered by default, in bytes.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;
/// Heartbeat interval offered by default.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
/// Outbound frames buffered per connection before producers wait.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 100;
/// Inbound frames buffered per channel before the reader waits.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
/// How long to wait for `connection.close-ok` before dropping the peer.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Messages a queue holds before further deliveries to it are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
/// Largest content body accepted from a publisher, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Server-side connection parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: Duration,
    pub outbound_capacity: usize,
    pub channel_capacity: usize,
    pub close_timeout: Duration,
    pub queue_capacity: usize,
    /// Upper bound on a publish's declared `body_size`.
    pub max_message_size: u64,
    /// Space-separated SASL mechanisms announced in `connection.start`.
    pub mechanisms: String,
    /// Space-separated locales announced in `connection.start`.
    pub locales: String,
    pub product: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: DEFAULT_HEARTBEAT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            mechanisms: "PLAIN AMQPLAIN".to_owned(),
            locales: "en_US".to_owned(),
            product: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Set the offered frame size, raised to the protocol minimum if smaller.
    #[must_use]
    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = frame_max.max(FRAME_MIN_SIZE);
        self
    }

    /// Set the offered heartbeat interval. Zero disables heartbeats.
    ///
    /// The wire carries whole seconds; sub-second parts are dropped.
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Duration::from_secs(heartbeat.as_secs().min(u64::from(u16::MAX)));
        self
    }

    #[must_use]
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn mechanisms(mut self, mechanisms: impl Into<String>) -> Self {
        self.mechanisms = mechanisms.into();
        self
    }

    #[must_use]
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    /// Heartbeat interval in whole seconds as sent in `connection.tune`.
    #[must_use]
    pub fn heartbeat_secs(&self) -> u16 {
        u16::try_from(self.heartbeat.as_secs()).unwrap_or(u16::MAX)
    }

    /// Whether `mechanism` is one of the announced SASL mechanisms.
    #[must_use]
    pub fn accepts_mechanism(&self, mechanism: &str) -> bool {
        self.mechanisms.split_whitespace().any(|m| m == mechanism)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.channel_max, 2047);
        assert_eq!(config.frame_max, 131_072);
        assert_eq!(config.heartbeat_secs(), 60);
        assert_eq!(config.outbound_capacity, 100);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.product, "wirebroker");
    }

    #[test]
    fn builders_clamp_to_protocol_limits() {
        let config = BrokerConfig::default()
            .frame_max(512)
            .outbound_capacity(0)
            .queue_capacity(0)
            .heartbeat(Duration::from_millis(2500));
        assert_eq!(config.frame_max, FRAME_MIN_SIZE);
        assert_eq!(config.outbound_capacity, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.heartbeat, Duration::from_secs(2));
    }

    #[rstest]
    #[case("PLAIN", true)]
    #[case("AMQPLAIN", true)]
    #[case("EXTERNAL", false)]
    #[case("", false)]
    fn mechanism_lookup(#[case] mechanism: &str, #[case] accepted: bool) {
        assert_eq!(BrokerConfig::default().accepts_mechanism(mechanism), accepted);
    }
}
