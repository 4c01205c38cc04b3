//! Binary frame format.
//!
//! Frame layout (20 bytes header + body):
//!
//! ```text
//! +---------+--------+--------+---------+-------------+---------+
//! |  size   |  code  | flags  |   id    | field_count | crc32c  |
//! | 4 bytes |2 bytes |2 bytes | 4 bytes |   4 bytes   | 4 bytes |
//! +---------+--------+--------+---------+-------------+---------+
//! | body (size - 20 bytes)                                      |
//! +-------------------------------------------------------------+
//! ```
//!
//! `size` covers the whole frame including the header. For binary frames
//! (`BINARY` flag) `field_count` holds the payload length and the body is the
//! raw payload. Otherwise the body is `field_count` entries of
//! `[field id u32][type u8][value]`. When `COMPRESSED` is set the body is
//! `[uncompressed length u32][zlib stream]`.

use crate::compress;
use crate::error::ProtocolError;
use crate::field::FieldValue;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Size of the fixed frame header in bytes (4+2+2+4+4+4 = 20).
pub const FRAME_HEADER_SIZE: usize = 20;

/// Bodies shorter than this are never compressed.
const COMPRESS_THRESHOLD: usize = 256;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// Body is a raw binary payload instead of fields.
    pub const BINARY: u16 = 1 << 0;
    /// Last chunk of a file transfer.
    pub const END_OF_FILE: u16 = 1 << 1;
    /// Never encrypt this frame (handshake traffic).
    pub const DONT_ENCRYPT: u16 = 1 << 2;
    /// Last frame of a multi-frame reply.
    pub const END_OF_SEQUENCE: u16 = 1 << 3;
    /// Records in a batch are in reverse order.
    pub const REVERSE_ORDER: u16 = 1 << 4;
    /// Control frame.
    pub const CONTROL: u16 = 1 << 5;
    /// Body is zlib-compressed.
    pub const COMPRESSED: u16 = 1 << 6;
    /// Binary payload carries independently compressed stream chunks.
    pub const STREAM: u16 = 1 << 7;

    const VALID_MASK: u16 = 0x00FF;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, bit: u16) -> Self {
        self.0 |= bit;
        self
    }

    pub fn set(&mut self, bit: u16, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A protocol frame: message code, correlation id and either typed fields or
/// a raw binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Message code.
    pub code: u16,
    /// Session-scoped id used for correlation (channel id for proxy data).
    pub id: u32,
    /// Frame flags.
    pub flags: FrameFlags,
    fields: BTreeMap<u32, FieldValue>,
    binary: Bytes,
}

impl Frame {
    /// Creates an empty field frame without an id.
    pub fn new(code: u16) -> Self {
        Self::with_id(code, 0)
    }

    /// Creates an empty field frame with the given id.
    pub fn with_id(code: u16, id: u32) -> Self {
        Self {
            code,
            id,
            flags: FrameFlags::new(),
            fields: BTreeMap::new(),
            binary: Bytes::new(),
        }
    }

    /// Creates a binary frame carrying `data`.
    pub fn binary(code: u16, id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            id,
            flags: FrameFlags::new().with(FrameFlags::BINARY),
            fields: BTreeMap::new(),
            binary: data.into(),
        }
    }

    pub fn is_binary(&self) -> bool {
        self.flags.contains(FrameFlags::BINARY)
    }

    pub fn is_end_of_file(&self) -> bool {
        self.flags.contains(FrameFlags::END_OF_FILE)
    }

    pub fn is_end_of_sequence(&self) -> bool {
        self.flags.contains(FrameFlags::END_OF_SEQUENCE)
    }

    pub fn is_encryption_disabled(&self) -> bool {
        self.flags.contains(FrameFlags::DONT_ENCRYPT)
    }

    /// Raw payload of a binary frame.
    pub fn binary_data(&self) -> &Bytes {
        &self.binary
    }

    pub fn set_binary_data(&mut self, data: impl Into<Bytes>) {
        self.flags.set(FrameFlags::BINARY, true);
        self.binary = data.into();
    }

    // ---------------------------------------------------------------------
    // Field setters
    // ---------------------------------------------------------------------

    pub fn set(&mut self, field: u32, value: impl Into<FieldValue>) {
        self.fields.insert(field, value.into());
    }

    /// Builder-style variant of [`Frame::set`].
    pub fn with_field(mut self, field: u32, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set_u32_list(&mut self, field: u32, values: &[u32]) {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.put_u32(*v);
        }
        self.fields.insert(field, FieldValue::Binary(buf.freeze()));
    }

    pub fn set_json<T: serde::Serialize>(
        &mut self,
        field: u32,
        value: &T,
    ) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(value)?;
        self.fields.insert(field, FieldValue::String(text));
        Ok(())
    }

    pub fn remove(&mut self, field: u32) -> Option<FieldValue> {
        self.fields.remove(&field)
    }

    // ---------------------------------------------------------------------
    // Field getters
    // ---------------------------------------------------------------------

    pub fn get(&self, field: u32) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: u32) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&u32, &FieldValue)> {
        self.fields.iter()
    }

    pub fn get_u64(&self, field: u32) -> Option<u64> {
        self.get(field).and_then(FieldValue::as_u64)
    }

    pub fn get_u32(&self, field: u32) -> Option<u32> {
        self.get_u64(field).map(|v| v as u32)
    }

    pub fn get_u16(&self, field: u32) -> Option<u16> {
        self.get_u64(field).map(|v| v as u16)
    }

    /// Boolean fields are integers; absent means `false`.
    pub fn get_bool(&self, field: u32) -> bool {
        self.get_u64(field).map(|v| v != 0).unwrap_or(false)
    }

    pub fn get_str(&self, field: u32) -> Option<String> {
        self.get(field).and_then(FieldValue::as_string)
    }

    pub fn get_bytes(&self, field: u32) -> Option<Bytes> {
        match self.get(field)? {
            FieldValue::Binary(b) => Some(b.clone()),
            FieldValue::String(s) => Some(Bytes::from(s.clone().into_bytes())),
            _ => None,
        }
    }

    pub fn get_uuid(&self, field: u32) -> Option<Uuid> {
        match self.get(field)? {
            FieldValue::Binary(b) => Uuid::from_slice(b).ok(),
            FieldValue::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn get_u32_list(&self, field: u32) -> Option<Vec<u32>> {
        match self.get(field)? {
            FieldValue::Binary(b) => {
                let mut raw = b.clone();
                let mut out = Vec::with_capacity(raw.len() / 4);
                while raw.remaining() >= 4 {
                    out.push(raw.get_u32());
                }
                Some(out)
            }
            other => other.as_u64().map(|v| vec![v as u32]),
        }
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        field: u32,
    ) -> Result<Option<T>, ProtocolError> {
        match self.get_str(field) {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Returns the field value or a `MissingField` error.
    pub fn require_u32(&self, field: u32) -> Result<u32, ProtocolError> {
        self.get_u32(field).ok_or(ProtocolError::MissingField(field))
    }

    // ---------------------------------------------------------------------
    // Wire encoding
    // ---------------------------------------------------------------------

    fn encode_body(&self) -> (BytesMut, u32) {
        if self.is_binary() {
            let mut body = BytesMut::with_capacity(self.binary.len());
            body.put_slice(&self.binary);
            return (body, self.binary.len() as u32);
        }
        let len: usize = self.fields.values().map(|v| 5 + v.encoded_len()).sum();
        let mut body = BytesMut::with_capacity(len);
        for (id, value) in &self.fields {
            body.put_u32(*id);
            body.put_u8(value.type_tag());
            value.encode(&mut body);
        }
        (body, self.fields.len() as u32)
    }

    /// Encodes the frame into bytes, compressing the body when allowed and
    /// worthwhile.
    pub fn encode(&self, allow_compression: bool) -> Result<BytesMut, ProtocolError> {
        let (body, count) = self.encode_body();
        let mut flags = self.flags;
        flags.set(FrameFlags::COMPRESSED, false);

        let body = if allow_compression && body.len() >= COMPRESS_THRESHOLD {
            let packed = compress::deflate(&body);
            if packed.len() + 4 < body.len() {
                flags.set(FrameFlags::COMPRESSED, true);
                let mut out = BytesMut::with_capacity(packed.len() + 4);
                out.put_u32(body.len() as u32);
                out.put_slice(&packed);
                out
            } else {
                body
            }
        } else {
            body
        };

        let total = FRAME_HEADER_SIZE + body.len();
        if total > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: total as u32,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u16(self.code);
        buf.put_u16(flags.bits());
        buf.put_u32(self.id);
        buf.put_u32(count);
        buf.put_u32(crc32c::crc32c(&body));
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Returns the message code of the next complete frame in `buf`, if any.
    pub fn peek_code(buf: &[u8]) -> Option<u16> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(u16::from_be_bytes([buf[4], buf[5]]))
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors. A
    /// complete but invalid frame is consumed before the error is returned so
    /// the stream stays aligned on frame boundaries.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooSmall(size));
        }
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        if buf.len() < size as usize {
            return Ok(None);
        }

        let mut frame_bytes = buf.split_to(size as usize).freeze();
        frame_bytes.advance(4);
        let code = frame_bytes.get_u16();
        let flags_bits = frame_bytes.get_u16();
        let id = frame_bytes.get_u32();
        let count = frame_bytes.get_u32();
        let crc_expected = frame_bytes.get_u32();
        let body = frame_bytes;

        let crc_actual = crc32c::crc32c(&body);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        let mut flags = FrameFlags::from_bits(flags_bits)?;

        let mut body = if flags.contains(FrameFlags::COMPRESSED) {
            let mut packed = body;
            if packed.remaining() < 4 {
                return Err(ProtocolError::Truncated);
            }
            let original_len = packed.get_u32() as usize;
            let raw = compress::inflate(&packed, original_len)?;
            flags.set(FrameFlags::COMPRESSED, false);
            Bytes::from(raw)
        } else {
            body
        };

        let mut frame = Frame {
            code,
            id,
            flags,
            fields: BTreeMap::new(),
            binary: Bytes::new(),
        };

        if flags.contains(FrameFlags::BINARY) {
            if body.len() < count as usize {
                return Err(ProtocolError::Truncated);
            }
            frame.binary = body.split_to(count as usize);
        } else {
            for _ in 0..count {
                if body.remaining() < 5 {
                    return Err(ProtocolError::Truncated);
                }
                let field_id = body.get_u32();
                let tag = body.get_u8();
                let value = FieldValue::decode(tag, &mut body)?;
                frame.fields.insert(field_id, value);
            }
        }

        Ok(Some(frame))
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::Int16(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int32(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Int16(v as u16)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Bytes> for FieldValue {
    fn from(v: Bytes) -> Self {
        FieldValue::Binary(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Binary(Bytes::from(v))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        FieldValue::Binary(Bytes::copy_from_slice(v))
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Binary(Bytes::copy_from_slice(v.as_bytes()))
    }
}
