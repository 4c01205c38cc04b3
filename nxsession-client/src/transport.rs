//! Write side of the connection.
//!
//! All outbound frames go through one writer guarded by an async mutex, so
//! frames from concurrent callers never interleave on the wire.

use crate::error::SessionError;
use crate::stream::SessionStream;
use nxsession_protocol::codes::message_code_name;
use nxsession_protocol::{EncryptionContext, Encoder, Frame};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

struct FrameWriter {
    half: WriteHalf<SessionStream>,
    encoder: Encoder,
}

/// Shared frame writer; empty while disconnected.
pub struct Transport {
    writer: Mutex<Option<FrameWriter>>,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    /// Installs the write half of a fresh connection, replacing any old one.
    pub async fn install(&self, half: WriteHalf<SessionStream>, compression: bool) {
        let mut encoder = Encoder::new();
        encoder.set_compression(compression);
        let old = self.writer.lock().await.replace(FrameWriter { half, encoder });
        if let Some(mut old) = old {
            let _ = old.half.shutdown().await;
        }
    }

    /// Encodes and writes one frame.
    pub async fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        write(writer, frame).await
    }

    /// Writes the session key reply in clear text, then switches the
    /// encoder to encrypted mode. Nothing can be written in between.
    pub async fn send_and_encrypt(
        &self,
        reply: &Frame,
        ctx: Arc<EncryptionContext>,
    ) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        write(writer, reply).await?;
        writer.encoder.set_encryption(Some(ctx));
        Ok(())
    }

    pub async fn is_encrypted(&self) -> bool {
        self.writer
            .lock()
            .await
            .as_ref()
            .map(|w| w.encoder.is_encrypted())
            .unwrap_or(false)
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Shuts down and drops the writer. Later sends fail with `NotConnected`.
    pub async fn close(&self) {
        let old = self.writer.lock().await.take();
        if let Some(mut old) = old {
            let _ = old.half.shutdown().await;
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

async fn write(writer: &mut FrameWriter, frame: &Frame) -> Result<(), SessionError> {
    let bytes = writer.encoder.encode(frame)?;
    tracing::debug!(
        "-> {} id={} ({} bytes)",
        message_code_name(frame.code),
        frame.id,
        bytes.len()
    );
    writer.half.write_all(&bytes).await?;
    writer.half.flush().await?;
    Ok(())
}
