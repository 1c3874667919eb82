//! AMQP 0-9-1 method layer.
//!
//! Frames produced by [`crate::codec`] carry opaque payloads. This module
//! gives those payloads meaning: [`Method`] for method frames,
//! [`ContentHeader`] for header frames, and [`FieldTable`] for the argument
//! tables nested inside both.

pub mod content;
pub mod method;
pub mod table;
mod wire;

pub use content::ContentHeader;
pub use method::{
    BasicPublish,
    BasicReturn,
    Close,
    ConnectionStart,
    ConnectionStartOk,
    ExchangeDeclare,
    ExchangeDelete,
    Method,
    QueueBind,
    QueueDeclare,
    QueueDeclareOk,
    QueueDelete,
    QueueUnbind,
    Tune,
};
pub use table::{FieldTable, FieldValue};

/// Signature a client sends before its first frame.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Protocol version advertised in `connection.start`.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 9;

/// Class identifiers.
pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
}

/// Reply codes carried by `close` and `basic.return`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReplyCode {
    Success = 200,
    NoRoute = 312,
    ConnectionForced = 320,
    AccessRefused = 403,
    NotFound = 404,
    ResourceLocked = 405,
    PreconditionFailed = 406,
    FrameError = 501,
    SyntaxError = 502,
    CommandInvalid = 503,
    ChannelError = 504,
    UnexpectedFrame = 505,
    NotAllowed = 530,
    NotImplemented = 540,
    InternalError = 541,
}

impl ReplyCode {
    #[must_use]
    pub fn as_u16(self) -> u16 { self as u16 }

    /// Hard errors close the whole connection; soft errors close one channel.
    #[must_use]
    pub fn is_hard(self) -> bool { self.as_u16() >= 500 || self == Self::ConnectionForced }

    /// Upper-case name used in reply texts.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "REPLY_SUCCESS",
            Self::NoRoute => "NO_ROUTE",
            Self::ConnectionForced => "CONNECTION_FORCED",
            Self::AccessRefused => "ACCESS_REFUSED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceLocked => "RESOURCE_LOCKED",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::FrameError => "FRAME_ERROR",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::CommandInvalid => "COMMAND_INVALID",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::UnexpectedFrame => "UNEXPECTED_FRAME",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failure to parse a method, content header or field table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },
    #[error("unknown field type {0:#04x}")]
    UnknownFieldType(u8),
    #[error("short string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),
}
