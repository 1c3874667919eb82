//! Errors raised by [`BrokerServer`](super::BrokerServer) operations.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or registering the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),
}
