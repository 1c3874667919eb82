//! Errors reported to peers.
//!
//! [`AmqpError`] is the broker's one user-facing failure: a reply code, a
//! human-readable text and the class/method that triggered it. Whether it
//! closes a channel or the whole connection follows from the reply code.

use crate::protocol::{Close, DecodeError, Method, ReplyCode};

/// A protocol-level failure destined for `channel.close` or `connection.close`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{} {} (class {class_id}, method {method_id}): {text}",
    .code.as_u16(),
    .code.name()
)]
pub struct AmqpError {
    pub code: ReplyCode,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl AmqpError {
    pub fn new(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// Attribute the error to the method that caused it.
    #[must_use]
    pub fn caused_by(mut self, method: &Method) -> Self {
        (self.class_id, self.method_id) = method.ids();
        self
    }

    pub fn not_found(text: impl Into<String>) -> Self { Self::new(ReplyCode::NotFound, text) }

    pub fn precondition_failed(text: impl Into<String>) -> Self {
        Self::new(ReplyCode::PreconditionFailed, text)
    }

    pub fn access_refused(text: impl Into<String>) -> Self {
        Self::new(ReplyCode::AccessRefused, text)
    }

    pub fn command_invalid(text: impl Into<String>) -> Self {
        Self::new(ReplyCode::CommandInvalid, text)
    }

    pub fn unexpected_frame(text: impl Into<String>) -> Self {
        Self::new(ReplyCode::UnexpectedFrame, text)
    }

    pub fn not_implemented(text: impl Into<String>) -> Self {
        Self::new(ReplyCode::NotImplemented, text)
    }

    /// Whether the error closes the connection rather than one channel.
    #[must_use]
    pub fn is_connection_error(&self) -> bool { self.code.is_hard() }

    /// Arguments for the `close` method announcing this error.
    #[must_use]
    pub fn to_close(&self) -> Close {
        Close {
            reply_code: self.code.as_u16(),
            reply_text: format!("{}: {}", self.code.name(), self.text),
            class_id: self.class_id,
            method_id: self.method_id,
        }
    }
}

impl From<DecodeError> for AmqpError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownMethod {
                class_id,
                method_id,
            } => Self {
                code: ReplyCode::NotImplemented,
                text: err.to_string(),
                class_id,
                method_id,
            },
            other => Self::new(ReplyCode::SyntaxError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::protocol::ExchangeDeclare;

    #[rstest]
    #[case(ReplyCode::NotFound, false)]
    #[case(ReplyCode::PreconditionFailed, false)]
    #[case(ReplyCode::CommandInvalid, true)]
    #[case(ReplyCode::NotImplemented, true)]
    #[case(ReplyCode::ConnectionForced, true)]
    fn scope_follows_reply_code(#[case] code: ReplyCode, #[case] hard: bool) {
        assert_eq!(AmqpError::new(code, "x").is_connection_error(), hard);
    }

    #[test]
    fn close_carries_offending_method() {
        let method = Method::ExchangeDeclare(ExchangeDeclare::default());
        let close = AmqpError::precondition_failed("type mismatch")
            .caused_by(&method)
            .to_close();
        assert_eq!(close.reply_code, 406);
        assert_eq!((close.class_id, close.method_id), (40, 10));
        assert_eq!(close.reply_text, "PRECONDITION_FAILED: type mismatch");
    }

    #[test]
    fn unknown_method_maps_to_not_implemented() {
        let err = AmqpError::from(DecodeError::UnknownMethod {
            class_id: 60,
            method_id: 20,
        });
        assert_eq!(err.code, ReplyCode::NotImplemented);
        assert_eq!((err.class_id, err.method_id), (60, 20));
    }
}
