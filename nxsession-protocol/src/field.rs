//! Typed field values carried in a frame.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Field type tags as they appear on the wire.
pub const TYPE_INT32: u8 = 0;
pub const TYPE_STRING: u8 = 1;
pub const TYPE_INT64: u8 = 2;
pub const TYPE_INT16: u8 = 3;
pub const TYPE_BINARY: u8 = 4;
pub const TYPE_FLOAT: u8 = 5;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int16(u16),
    Int32(u32),
    Int64(u64),
    Float(f64),
    String(String),
    Binary(Bytes),
}

impl FieldValue {
    /// Returns the wire type tag.
    pub fn type_tag(&self) -> u8 {
        match self {
            FieldValue::Int16(_) => TYPE_INT16,
            FieldValue::Int32(_) => TYPE_INT32,
            FieldValue::Int64(_) => TYPE_INT64,
            FieldValue::Float(_) => TYPE_FLOAT,
            FieldValue::String(_) => TYPE_STRING,
            FieldValue::Binary(_) => TYPE_BINARY,
        }
    }

    /// Widens any integer variant to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Int16(v) => Some(*v as u64),
            FieldValue::Int32(v) => Some(*v as u64),
            FieldValue::Int64(v) => Some(*v),
            FieldValue::Float(v) => Some(*v as u64),
            FieldValue::String(s) => s.trim().parse().ok(),
            FieldValue::Binary(_) => None,
        }
    }

    /// Returns the string content, converting numbers to text.
    pub fn as_string(&self) -> Option<String> {
        match self {
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Int16(v) => Some(v.to_string()),
            FieldValue::Int32(v) => Some(v.to_string()),
            FieldValue::Int64(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(v.to_string()),
            FieldValue::Binary(_) => None,
        }
    }

    /// Number of bytes this value occupies on the wire (excluding id and tag).
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            FieldValue::Int16(_) => 2,
            FieldValue::Int32(_) => 4,
            FieldValue::Int64(_) | FieldValue::Float(_) => 8,
            FieldValue::String(s) => 4 + s.len(),
            FieldValue::Binary(b) => 4 + b.len(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        match self {
            FieldValue::Int16(v) => buf.put_u16(*v),
            FieldValue::Int32(v) => buf.put_u32(*v),
            FieldValue::Int64(v) => buf.put_u64(*v),
            FieldValue::Float(v) => buf.put_f64(*v),
            FieldValue::String(s) => {
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            FieldValue::Binary(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    pub(crate) fn decode(tag: u8, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let need = |buf: &Bytes, n: usize| {
            if buf.remaining() < n {
                Err(ProtocolError::Truncated)
            } else {
                Ok(())
            }
        };
        match tag {
            TYPE_INT16 => {
                need(buf, 2)?;
                Ok(FieldValue::Int16(buf.get_u16()))
            }
            TYPE_INT32 => {
                need(buf, 4)?;
                Ok(FieldValue::Int32(buf.get_u32()))
            }
            TYPE_INT64 => {
                need(buf, 8)?;
                Ok(FieldValue::Int64(buf.get_u64()))
            }
            TYPE_FLOAT => {
                need(buf, 8)?;
                Ok(FieldValue::Float(buf.get_f64()))
            }
            TYPE_STRING => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                let raw = buf.split_to(len);
                let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(FieldValue::String(s.to_string()))
            }
            TYPE_BINARY => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                Ok(FieldValue::Binary(buf.split_to(len)))
            }
            other => Err(ProtocolError::UnknownFieldType(other)),
        }
    }
}
