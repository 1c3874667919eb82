#![doc(html_root_url = "https://docs.rs/wirebroker/latest")]
//! Core of an AMQP 0-9-1 message broker.
//!
//! The crate has two halves. The routing engine ([`routing`], [`broker`])
//! keeps exchanges, bindings and queues and decides which queues receive a
//! published message. The protocol engine ([`connection`], [`codec`],
//! [`protocol`]) drives each client connection through the handshake,
//! demultiplexes frames onto channels, runs heartbeats and applies
//! backpressure to outbound traffic. [`server`] ties them to a TCP listener.

pub mod broker;
mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod preamble;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod session;

pub use broker::{Broker, DEFAULT_EXCHANGE, Message, Queue};
pub use codec::{AmqpCodec, FrameType, WireFrame};
pub use config::BrokerConfig;
pub use connection::{Connection, ConnectionSnapshot, ConnectionState};
pub use error::AmqpError;
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};
pub use protocol::{Method, ReplyCode};
pub use routing::{Binding, Exchange, ExchangeDeclaration, ExchangeType, RoutingError};
pub use server::{BrokerServer, ServerError};
pub use session::{ConnectionId, ConnectionIdGenerator, ConnectionRegistry};
