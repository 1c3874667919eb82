//! Exchange and binding routing engine.
//!
//! An [`Exchange`] owns an ordered list of [`Binding`]s and decides, for each
//! publish, which queue names receive the message. Exchange types are a
//! closed enum: unknown type names are rejected when the exchange is
//! declared, so routing never encounters a type it cannot handle. Headers
//! exchanges can be named but not routed; they yield
//! [`RoutingError::NotImplemented`].

pub mod binding;
pub mod exchange;

use std::fmt;

use serde::Serialize;

pub use binding::Binding;
pub use exchange::{
    AUTO_DELETE_WINDOW,
    Exchange,
    ExchangeDeclaration,
    ExchangeSnapshot,
    equivalent_exchanges,
};

use crate::error::AmqpError;

/// Routing algorithm of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    /// Map a declared type name to an [`ExchangeType`].
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownExchangeType`] for any name other than
    /// `direct`, `fanout`, `topic` or `headers`.
    pub fn from_name(name: &str) -> Result<Self, RoutingError> {
        match name {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            other => Err(RoutingError::UnknownExchangeType(other.to_owned())),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Failures raised by the routing engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("{0} exchange routing is not implemented")]
    NotImplemented(ExchangeType),
    #[error("unknown exchange type {0:?}")]
    UnknownExchangeType(String),
}

impl From<RoutingError> for AmqpError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NotImplemented(_) => Self::not_implemented(err.to_string()),
            RoutingError::UnknownExchangeType(_) => Self::command_invalid(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::protocol::ReplyCode;

    #[rstest]
    #[case("direct", ExchangeType::Direct)]
    #[case("fanout", ExchangeType::Fanout)]
    #[case("topic", ExchangeType::Topic)]
    #[case("headers", ExchangeType::Headers)]
    fn known_type_names_map(#[case] name: &str, #[case] expected: ExchangeType) {
        assert_eq!(ExchangeType::from_name(name), Ok(expected));
        assert_eq!(expected.name(), name);
    }

    #[rstest]
    #[case("")]
    #[case("Direct")]
    #[case("x-consistent-hash")]
    fn unknown_type_names_are_rejected(#[case] name: &str) {
        let err = ExchangeType::from_name(name).expect_err("type must be rejected");
        assert_eq!(AmqpError::from(err).code, ReplyCode::CommandInvalid);
    }
}
