//! Frame codec for the AMQP 0-9-1 transport.
//!
//! Every frame on the wire is laid out as a one-byte frame type, a two-byte
//! channel id, a four-byte payload size, the payload itself, and a single
//! frame-end octet (`0xCE`). [`AmqpCodec`] splits a byte stream into
//! [`WireFrame`]s and serialises them back, enforcing the negotiated
//! `frame-max` on input.
//!
//! # Errors
//!
//! Decoding failures surface as [`io::Error`] values of kind
//! [`io::ErrorKind::InvalidData`]. The connection treats every codec error as a
//! protocol violation and hard-closes.

use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Octet terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Bytes of framing around a payload: type, channel, size and frame-end.
pub const FRAME_OVERHEAD: usize = 8;

const HEADER_SIZE: usize = 7;

/// Smallest `frame-max` a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Frame types understood by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Carries one protocol method.
    Method,
    /// Carries a content header following a content-bearing method.
    Header,
    /// Carries a slice of message body.
    Body,
    /// Liveness signal with an empty payload on channel 0.
    Heartbeat,
}

impl FrameType {
    /// Return the on-wire type octet.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Method => 1,
            Self::Header => 2,
            Self::Body => 3,
            Self::Heartbeat => 8,
        }
    }

    /// Map a type octet to a [`FrameType`], if it is one the broker knows.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Method),
            2 => Some(Self::Header),
            3 => Some(Self::Body),
            8 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Method => "method",
            Self::Header => "header",
            Self::Body => "body",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// A single decoded frame: type, channel and opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    pub kind: FrameType,
    pub channel: u16,
    pub payload: Bytes,
}

impl WireFrame {
    #[must_use]
    pub fn new(kind: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            kind,
            channel,
            payload,
        }
    }

    /// Heartbeat frame: channel 0, empty payload.
    #[must_use]
    pub fn heartbeat() -> Self { Self::new(FrameType::Heartbeat, 0, Bytes::new()) }

    /// Total number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize { self.payload.len() + FRAME_OVERHEAD }
}

/// Tokio codec translating between bytes and [`WireFrame`]s.
#[derive(Clone, Debug)]
pub struct AmqpCodec {
    max_frame_size: usize,
}

impl AmqpCodec {
    /// Construct a codec rejecting inbound frames larger than `max_frame_size`
    /// bytes (framing included). Values below [`FRAME_MIN_SIZE`] are raised to it.
    #[must_use]
    pub fn new(max_frame_size: u32) -> Self {
        let max = max_frame_size.max(FRAME_MIN_SIZE);
        Self {
            max_frame_size: usize::try_from(max).unwrap_or(usize::MAX),
        }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize { self.max_frame_size }
}

impl Default for AmqpCodec {
    fn default() -> Self { Self::new(crate::config::DEFAULT_FRAME_MAX) }
}

fn invalid(msg: String) -> io::Error { io::Error::new(io::ErrorKind::InvalidData, msg) }

impl Decoder for AmqpCodec {
    type Item = WireFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &src[..HEADER_SIZE];
        let type_octet = header.get_u8();
        let channel = header.get_u16();
        let size = usize::try_from(header.get_u32()).unwrap_or(usize::MAX);

        let Some(kind) = FrameType::from_u8(type_octet) else {
            return Err(invalid(format!("unknown frame type {type_octet}")));
        };
        let total = size.saturating_add(FRAME_OVERHEAD);
        if total > self.max_frame_size {
            return Err(invalid(format!(
                "frame of {total} bytes exceeds frame-max {}",
                self.max_frame_size
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(size).freeze();
        let end = src.get_u8();
        if end != FRAME_END {
            return Err(invalid(format!("bad frame-end octet {end:#04x}")));
        }
        Ok(Some(WireFrame::new(kind, channel, payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed mid-frame with {} bytes buffered", src.len()),
            )),
        }
    }
}

impl Encoder<WireFrame> for AmqpCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = u32::try_from(frame.payload.len())
            .map_err(|_| invalid(format!("payload of {} bytes", frame.payload.len())))?;
        dst.reserve(frame.encoded_len());
        dst.put_u8(frame.kind.as_u8());
        dst.put_u16(frame.channel);
        dst.put_u32(size);
        dst.extend_from_slice(&frame.payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn raw(kind: u8, channel: u16, payload: &[u8], end: u8) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(kind);
        buf.put_u16(channel);
        buf.put_u32(u32::try_from(payload.len()).expect("payload fits"));
        buf.extend_from_slice(payload);
        buf.put_u8(end);
        buf
    }

    #[test]
    fn decodes_complete_frame() {
        let mut buf = raw(1, 3, b"abc", FRAME_END);
        let frame = AmqpCodec::default()
            .decode(&mut buf)
            .expect("decode")
            .expect("frame");
        assert_eq!(frame.kind, FrameType::Method);
        assert_eq!(frame.channel, 3);
        assert_eq!(&frame.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let full = raw(3, 1, b"hello", FRAME_END);
        let mut buf = BytesMut::from(&full[..9]);
        let mut codec = AmqpCodec::default();
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(&full[9..]);
        assert!(codec.decode(&mut buf).expect("decode").is_some());
    }

    #[rstest]
    #[case::bad_end(raw(1, 0, b"x", 0x00))]
    #[case::unknown_type(raw(9, 0, b"", FRAME_END))]
    fn rejects_malformed_frames(#[case] mut buf: BytesMut) {
        let err = AmqpCodec::default()
            .decode(&mut buf)
            .expect_err("malformed frame must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_frames_over_frame_max() {
        let payload = vec![0_u8; 5000];
        let mut buf = raw(3, 1, &payload, FRAME_END);
        let err = AmqpCodec::new(FRAME_MIN_SIZE)
            .decode(&mut buf)
            .expect_err("oversized frame must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encodes_heartbeat() {
        let mut buf = BytesMut::new();
        AmqpCodec::default()
            .encode(WireFrame::heartbeat(), &mut buf)
            .expect("encode");
        assert_eq!(&buf[..], &[8, 0, 0, 0, 0, 0, 0, FRAME_END]);
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let full = raw(1, 0, b"abcdef", FRAME_END);
        let mut buf = BytesMut::from(&full[..10]);
        let err = AmqpCodec::default()
            .decode_eof(&mut buf)
            .expect_err("truncated frame");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
