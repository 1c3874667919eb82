//! Content reassembly: method, then header, then body frames.

use bytes::{Bytes, BytesMut};

use crate::{
    error::AmqpError,
    protocol::{BasicPublish, ContentHeader, ReplyCode, class},
};

/// A publish with its complete content.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Published {
    pub publish: BasicPublish,
    pub header: ContentHeader,
    pub body: Bytes,
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Idle,
    AwaitingHeader(BasicPublish),
    AwaitingBody {
        publish: BasicPublish,
        header: ContentHeader,
        body: BytesMut,
    },
}

/// Per-channel reassembly state.
#[derive(Debug)]
pub(crate) struct ContentAssembly {
    stage: Stage,
    max_body: u64,
}

fn unexpected(text: &str) -> AmqpError { AmqpError::unexpected_frame(text) }

impl ContentAssembly {
    /// Assembly refusing bodies declared larger than `max_body` bytes.
    pub(crate) fn new(max_body: u64) -> Self {
        Self {
            stage: Stage::Idle,
            max_body,
        }
    }

    /// Discard any partial content.
    pub(crate) fn reset(&mut self) { self.stage = Stage::Idle; }

    /// Whether a content sequence is in progress.
    pub(crate) fn in_progress(&self) -> bool { !matches!(self.stage, Stage::Idle) }

    pub(crate) fn start(&mut self, publish: BasicPublish) {
        self.stage = Stage::AwaitingHeader(publish);
    }

    /// Accept a header frame. Returns the finished publish when the body is
    /// empty.
    pub(crate) fn header(&mut self, payload: &[u8]) -> Result<Option<Published>, AmqpError> {
        let Stage::AwaitingHeader(publish) = std::mem::take(&mut self.stage) else {
            return Err(unexpected("content header without a preceding method"));
        };
        let header = ContentHeader::decode(payload)?;
        if header.class_id != class::BASIC {
            return Err(AmqpError::command_invalid(format!(
                "content header for class {} on basic.publish",
                header.class_id
            )));
        }
        if header.body_size > self.max_body {
            return Err(AmqpError::precondition_failed(format!(
                "message size {} exceeds the maximum of {} bytes",
                header.body_size, self.max_body
            )));
        }
        if header.body_size == 0 {
            return Ok(Some(Published {
                publish,
                header,
                body: Bytes::new(),
            }));
        }
        let capacity = usize::try_from(header.body_size).unwrap_or(usize::MAX).min(1 << 20);
        self.stage = Stage::AwaitingBody {
            publish,
            header,
            body: BytesMut::with_capacity(capacity),
        };
        Ok(None)
    }

    /// Accept a body frame. Returns the finished publish once the declared
    /// size has arrived.
    pub(crate) fn body(&mut self, payload: &[u8]) -> Result<Option<Published>, AmqpError> {
        let Stage::AwaitingBody {
            publish,
            header,
            mut body,
        } = std::mem::take(&mut self.stage)
        else {
            return Err(unexpected("content body without a content header"));
        };
        body.extend_from_slice(payload);
        let received = u64::try_from(body.len()).unwrap_or(u64::MAX);
        if received > header.body_size {
            return Err(AmqpError::new(
                ReplyCode::FrameError,
                format!(
                    "content body of {received} bytes exceeds declared size {}",
                    header.body_size
                ),
            ));
        }
        if received == header.body_size {
            return Ok(Some(Published {
                publish,
                header,
                body: body.freeze(),
            }));
        }
        self.stage = Stage::AwaitingBody {
            publish,
            header,
            body,
        };
        Ok(None)
    }
}
