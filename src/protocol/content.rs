//! Content header frames.

use bytes::{BufMut, Bytes, BytesMut};

use super::{DecodeError, wire::WireReader};

/// Payload of a header frame announcing the size of the body that follows.
///
/// Message properties are kept as raw bytes (flags plus property list): the
/// broker never interprets them, only forwards them on `basic.return`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub weight: u16,
    pub body_size: u64,
    pub properties: Bytes,
}

impl ContentHeader {
    /// Header with no properties set.
    #[must_use]
    pub fn new(class_id: u16, body_size: u64) -> Self {
        Self {
            class_id,
            weight: 0,
            body_size,
            properties: Bytes::from_static(&[0, 0]),
        }
    }

    /// Parse a header frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if the fixed fields are incomplete.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(payload);
        let class_id = reader.u16()?;
        let weight = reader.u16()?;
        let body_size = reader.u64()?;
        let properties = Bytes::copy_from_slice(reader.rest());
        Ok(Self {
            class_id,
            weight,
            body_size,
            properties,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.properties.len());
        buf.put_u16(self.class_id);
        buf.put_u16(self.weight);
        buf.put_u64(self.body_size);
        buf.extend_from_slice(&self.properties);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_properties_opaque() {
        let header = ContentHeader {
            class_id: 60,
            weight: 0,
            body_size: 11,
            properties: Bytes::from_static(&[0x10, 0x00, 2]),
        };
        assert_eq!(ContentHeader::decode(&header.encode()), Ok(header));
    }

    #[test]
    fn short_header_is_truncated() {
        assert!(matches!(
            ContentHeader::decode(&[0, 60, 0, 0, 0]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
