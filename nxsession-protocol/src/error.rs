//! Protocol error types and request completion codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame too small: {0} bytes")]
    FrameTooSmall(u32),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("truncated frame body")]
    Truncated,

    #[error("unknown field type: {0}")]
    UnknownFieldType(u8),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(u32),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u8),

    #[error("encrypted frame received but no encryption context is established")]
    NoEncryptionContext,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiver failed while handling a frame.
    #[error("frame dispatch failed: {0}")]
    Dispatch(String),
}

impl ProtocolError {
    /// Returns whether this error means the stream can no longer be trusted.
    ///
    /// Encryption failures desynchronize both peers; everything else is a
    /// single bad frame that the reader may skip.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::NoEncryptionContext
                | ProtocolError::Encryption(_)
                | ProtocolError::Io(_)
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::FrameTooSmall(_)
                | ProtocolError::Dispatch(_)
        )
    }
}

/// Request completion codes carried in `VID_RCC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    AccessDenied,
    InvalidObjectId,
    Timeout,
    InternalError,
    ComponentLocked,
    EncryptionError,
    NoCiphers,
    InvalidArgument,
    FileIoError,
    NeedSecondFactor,
    FailedSecondFactor,
    AuthFailed,
    ResourceNotAvailable,
    SessionClosed,
    BadProtocol,
    Other(u32),
}

impl ResultCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ResultCode::Success,
            1 => ResultCode::AccessDenied,
            2 => ResultCode::InvalidObjectId,
            3 => ResultCode::Timeout,
            4 => ResultCode::InternalError,
            5 => ResultCode::ComponentLocked,
            6 => ResultCode::EncryptionError,
            7 => ResultCode::NoCiphers,
            8 => ResultCode::InvalidArgument,
            9 => ResultCode::FileIoError,
            10 => ResultCode::NeedSecondFactor,
            11 => ResultCode::FailedSecondFactor,
            12 => ResultCode::AuthFailed,
            13 => ResultCode::ResourceNotAvailable,
            14 => ResultCode::SessionClosed,
            15 => ResultCode::BadProtocol,
            other => ResultCode::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::AccessDenied => 1,
            ResultCode::InvalidObjectId => 2,
            ResultCode::Timeout => 3,
            ResultCode::InternalError => 4,
            ResultCode::ComponentLocked => 5,
            ResultCode::EncryptionError => 6,
            ResultCode::NoCiphers => 7,
            ResultCode::InvalidArgument => 8,
            ResultCode::FileIoError => 9,
            ResultCode::NeedSecondFactor => 10,
            ResultCode::FailedSecondFactor => 11,
            ResultCode::AuthFailed => 12,
            ResultCode::ResourceNotAvailable => 13,
            ResultCode::SessionClosed => 14,
            ResultCode::BadProtocol => 15,
            ResultCode::Other(v) => *v,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }

    /// Returns whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResultCode::Timeout | ResultCode::ComponentLocked | ResultCode::ResourceNotAvailable
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Success => write!(f, "SUCCESS"),
            ResultCode::AccessDenied => write!(f, "ACCESS_DENIED"),
            ResultCode::InvalidObjectId => write!(f, "INVALID_OBJECT_ID"),
            ResultCode::Timeout => write!(f, "TIMEOUT"),
            ResultCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ResultCode::ComponentLocked => write!(f, "COMPONENT_LOCKED"),
            ResultCode::EncryptionError => write!(f, "ENCRYPTION_ERROR"),
            ResultCode::NoCiphers => write!(f, "NO_CIPHERS"),
            ResultCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ResultCode::FileIoError => write!(f, "FILE_IO_ERROR"),
            ResultCode::NeedSecondFactor => write!(f, "NEED_SECOND_FACTOR"),
            ResultCode::FailedSecondFactor => write!(f, "FAILED_SECOND_FACTOR"),
            ResultCode::AuthFailed => write!(f, "AUTH_FAILED"),
            ResultCode::ResourceNotAvailable => write!(f, "RESOURCE_NOT_AVAILABLE"),
            ResultCode::SessionClosed => write!(f, "SESSION_CLOSED"),
            ResultCode::BadProtocol => write!(f, "BAD_PROTOCOL"),
            ResultCode::Other(v) => write!(f, "RCC_{}", v),
        }
    }
}
