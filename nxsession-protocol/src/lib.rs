//! # nxsession-protocol
//!
//! Wire protocol implementation for nxsession (NXCP-style management protocol).
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Typed field maps and raw binary frames
//! - Optional per-frame DEFLATE compression and ChaCha20-Poly1305 encryption
//! - Message codes, field identifiers and result codes
//! - Per-chunk compression used by file transfers

pub mod codec;
pub mod codes;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod field;
pub mod frame;

pub use codec::{Decoder, Encoder};
pub use crypto::{EncryptionContext, PeerKeyPair};
pub use error::{ProtocolError, ResultCode};
pub use field::FieldValue;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 5;

/// Default port for management servers.
pub const DEFAULT_PORT: u16 = 4701;

/// Maximum encoded frame size (32 MiB).
pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;
