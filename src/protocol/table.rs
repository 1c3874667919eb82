//! Field tables: the typed key/value maps carried by methods and headers.
//!
//! Tables are stored in a [`BTreeMap`] so two tables holding the same entries
//! compare equal regardless of the order a client encoded them in. Binding
//! and exchange equivalence both rely on this.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer, ser::SerializeSeq};

use super::{
    DecodeError,
    wire::{WireReader, put_long_bytes, put_short_str},
};

/// A single typed value in a [`FieldTable`] or field array.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: u32 },
    LongString(Bytes),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    ByteArray(Bytes),
}

impl FieldValue {
    fn type_octet(&self) -> u8 {
        match self {
            Self::Bool(_) => b't',
            Self::I8(_) => b'b',
            Self::U8(_) => b'B',
            Self::I16(_) => b's',
            Self::U16(_) => b'u',
            Self::I32(_) => b'I',
            Self::U32(_) => b'i',
            Self::I64(_) => b'l',
            Self::F32(_) => b'f',
            Self::F64(_) => b'd',
            Self::Decimal { .. } => b'D',
            Self::LongString(_) => b'S',
            Self::Array(_) => b'A',
            Self::Timestamp(_) => b'T',
            Self::Table(_) => b'F',
            Self::Void => b'V',
            Self::ByteArray(_) => b'x',
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.type_octet());
        match self {
            Self::Bool(v) => dst.put_u8(u8::from(*v)),
            Self::I8(v) => dst.put_i8(*v),
            Self::U8(v) => dst.put_u8(*v),
            Self::I16(v) => dst.put_i16(*v),
            Self::U16(v) => dst.put_u16(*v),
            Self::I32(v) => dst.put_i32(*v),
            Self::U32(v) => dst.put_u32(*v),
            Self::I64(v) => dst.put_i64(*v),
            Self::F32(v) => dst.put_f32(*v),
            Self::F64(v) => dst.put_f64(*v),
            Self::Decimal { scale, value } => {
                dst.put_u8(*scale);
                dst.put_u32(*value);
            }
            Self::LongString(v) | Self::ByteArray(v) => put_long_bytes(dst, v),
            Self::Array(items) => {
                let mut body = BytesMut::new();
                for item in items {
                    item.encode(&mut body);
                }
                put_long_bytes(dst, &body);
            }
            Self::Timestamp(v) => dst.put_u64(*v),
            Self::Table(table) => table.encode(dst),
            Self::Void => {}
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let value = match reader.u8()? {
            b't' => Self::Bool(reader.u8()? != 0),
            b'b' => Self::I8(reader.i8()?),
            b'B' => Self::U8(reader.u8()?),
            b's' => Self::I16(reader.i16()?),
            b'u' => Self::U16(reader.u16()?),
            b'I' => Self::I32(reader.i32()?),
            b'i' => Self::U32(reader.u32()?),
            b'l' => Self::I64(reader.i64()?),
            b'f' => Self::F32(reader.f32()?),
            b'd' => Self::F64(reader.f64()?),
            b'D' => Self::Decimal {
                scale: reader.u8()?,
                value: reader.u32()?,
            },
            b'S' => Self::LongString(reader.long_bytes()?),
            b'A' => {
                let raw = reader.long_bytes()?;
                let mut inner = WireReader::new(&raw);
                let mut items = Vec::new();
                while !inner.is_empty() {
                    items.push(Self::decode(&mut inner)?);
                }
                Self::Array(items)
            }
            b'T' => Self::Timestamp(reader.u64()?),
            b'F' => Self::Table(FieldTable::decode(reader)?),
            b'V' => Self::Void,
            b'x' => Self::ByteArray(reader.long_bytes()?),
            other => return Err(DecodeError::UnknownFieldType(other)),
        };
        Ok(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self { Self::LongString(Bytes::copy_from_slice(value.as_bytes())) }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self { Self::Bool(value) }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self { Self::Table(value) }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::I8(v) => serializer.serialize_i8(*v),
            Self::U8(v) => serializer.serialize_u8(*v),
            Self::I16(v) => serializer.serialize_i16(*v),
            Self::U16(v) => serializer.serialize_u16(*v),
            Self::I32(v) => serializer.serialize_i32(*v),
            Self::U32(v) => serializer.serialize_u32(*v),
            Self::I64(v) => serializer.serialize_i64(*v),
            Self::F32(v) => serializer.serialize_f32(*v),
            Self::F64(v) => serializer.serialize_f64(*v),
            Self::Decimal { scale, value } => {
                serializer.serialize_str(&format!("{value}e-{scale}"))
            }
            Self::LongString(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Timestamp(v) => serializer.serialize_u64(*v),
            Self::Table(table) => table.serialize(serializer),
            Self::Void => serializer.serialize_unit(),
            Self::ByteArray(v) => serializer.serialize_bytes(v),
        }
    }
}

/// Ordered map of field names to [`FieldValue`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldTable(BTreeMap<String, FieldValue>);

impl FieldTable {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> { self.0.get(key) }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> { self.0.iter() }

    /// Append the table, length-prefixed, to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut body = BytesMut::new();
        for (key, value) in &self.0 {
            put_short_str(&mut body, key);
            value.encode(&mut body);
        }
        put_long_bytes(dst, &body);
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let raw = reader.long_bytes()?;
        let mut inner = WireReader::new(&raw);
        let mut table = BTreeMap::new();
        while !inner.is_empty() {
            let key = inner.short_str()?;
            let value = FieldValue::decode(&mut inner)?;
            table.insert(key, value);
        }
        Ok(Self(table))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
