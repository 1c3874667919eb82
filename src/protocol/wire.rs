//! Primitive readers and writers for method arguments.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::DecodeError;

/// Cursor over a method or header payload that reports truncation instead of
/// panicking.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

macro_rules! read_number {
    ($($name:ident => $ty:ty, $get:ident;)*) => {
        $(
            pub(crate) fn $name(&mut self) -> Result<$ty, DecodeError> {
                self.need(size_of::<$ty>())?;
                Ok(self.buf.$get())
            }
        )*
    };
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self { Self { buf } }

    fn need(&self, len: usize) -> Result<(), DecodeError> {
        if self.buf.len() < len {
            return Err(DecodeError::Truncated {
                needed: len - self.buf.len(),
            });
        }
        Ok(())
    }

    read_number! {
        u8 => u8, get_u8;
        i8 => i8, get_i8;
        u16 => u16, get_u16;
        i16 => i16, get_i16;
        u32 => u32, get_u32;
        i32 => i32, get_i32;
        u64 => u64, get_u64;
        i64 => i64, get_i64;
        f32 => f32, get_f32;
        f64 => f64, get_f64;
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn short_str(&mut self) -> Result<String, DecodeError> {
        let len = usize::from(self.u8()?);
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub(crate) fn long_bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = usize::try_from(self.u32()?).unwrap_or(usize::MAX);
        Ok(Bytes::copy_from_slice(self.bytes(len)?))
    }

    /// Long string interpreted as UTF-8, replacing invalid sequences.
    pub(crate) fn long_str(&mut self) -> Result<String, DecodeError> {
        let raw = self.long_bytes()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub(crate) fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub(crate) fn rest(&mut self) -> &'a [u8] { std::mem::take(&mut self.buf) }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Write a short string, truncating at 255 bytes on a character boundary.
pub(crate) fn put_short_str(dst: &mut BytesMut, value: &str) {
    let mut end = value.len().min(usize::from(u8::MAX));
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    dst.put_u8(u8::try_from(end).unwrap_or(u8::MAX));
    dst.extend_from_slice(&value.as_bytes()[..end]);
}

pub(crate) fn put_long_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(u32::try_from(value.len()).unwrap_or(u32::MAX));
    dst.extend_from_slice(value);
}

/// Pack up to eight flags into one octet, first flag in the lowest bit.
pub(crate) fn pack_bits(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &set)| if set { acc | (1 << i) } else { acc })
}

pub(crate) fn bit(octet: u8, index: u8) -> bool { octet & (1 << index) != 0 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_truncation() {
        let mut reader = WireReader::new(&[0x00]);
        assert_eq!(reader.u16(), Err(DecodeError::Truncated { needed: 1 }));
    }

    #[test]
    fn short_string_is_truncated_on_char_boundary() {
        let long = "é".repeat(200);
        let mut buf = BytesMut::new();
        put_short_str(&mut buf, &long);
        assert_eq!(buf[0], 254);
        let decoded = WireReader::new(&buf).short_str().expect("valid utf-8");
        assert_eq!(decoded.chars().count(), 127);
    }

    #[test]
    fn bits_pack_low_first() {
        let packed = pack_bits(&[true, false, true]);
        assert_eq!(packed, 0b101);
        assert!(bit(packed, 2));
        assert!(!bit(packed, 1));
    }
}
