//! Encoder and decoder for session frames.
//!
//! Both sides carry the optional session encryption context. Once it is
//! installed, outgoing frames are sealed into `CMD_ENCRYPTED_MESSAGE`
//! envelopes and incoming envelopes are opened transparently.

use crate::codes::CMD_ENCRYPTED_MESSAGE;
use crate::crypto::EncryptionContext;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFlags};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Encodes frames for the wire.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    encryption: Option<Arc<EncryptionContext>>,
    compression: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables body compression for frames that benefit from it.
    pub fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    pub fn set_encryption(&mut self, ctx: Option<Arc<EncryptionContext>>) {
        self.encryption = ctx;
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Encodes a frame, sealing it in an envelope when encryption is active.
    pub fn encode(&self, frame: &Frame) -> Result<BytesMut, ProtocolError> {
        let compress = self.compression && !frame.flags.contains(FrameFlags::STREAM);
        let plain = frame.encode(compress)?;

        match &self.encryption {
            Some(ctx) if !frame.is_encryption_disabled() => {
                let sealed = ctx.encrypt(&plain)?;
                Frame::binary(CMD_ENCRYPTED_MESSAGE, frame.id, sealed).encode(false)
            }
            _ => Ok(plain),
        }
    }
}

/// Accumulates bytes from the transport and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
    encryption: Option<Arc<EncryptionContext>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            encryption: None,
        }
    }

    pub fn set_encryption(&mut self, ctx: Option<Arc<EncryptionContext>>) {
        self.encryption = ctx;
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Mutable access for transports that read directly into the buffer.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to decode the next frame from the buffer, opening encrypted
    /// envelopes.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let frame = match Frame::decode(&mut self.buffer)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if frame.code != CMD_ENCRYPTED_MESSAGE {
            return Ok(Some(frame));
        }

        let ctx = self
            .encryption
            .as_ref()
            .ok_or(ProtocolError::NoEncryptionContext)?;
        let plaintext = ctx.decrypt(frame.binary_data())?;
        let mut inner = BytesMut::from(&plaintext[..]);
        match Frame::decode(&mut inner) {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(ProtocolError::Encryption(
                "envelope does not contain a complete frame".into(),
            )),
            Err(e) => Err(ProtocolError::Encryption(format!("bad inner frame: {}", e))),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
