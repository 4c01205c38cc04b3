//! Session error types.

use nxsession_protocol::ResultCode;
use std::sync::Arc;
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] nxsession_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("session closed")]
    SessionClosed,

    /// The connection broke; every waiter and channel shares the cause.
    #[error("connection broken: {0}")]
    ConnectionBroken(Arc<SessionError>),

    #[error("request timeout")]
    Timeout,

    #[error("request failed: {code}{}", message.as_deref().map(|m| format!(" ({})", m)).unwrap_or_default())]
    Request {
        code: ResultCode,
        message: Option<String>,
        related_ids: Vec<u32>,
    },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("message subscription expired")]
    SubscriptionExpired,

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("file transfer error: {0}")]
    FileTransfer(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("request id space exhausted")]
    RequestIdsExhausted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Builds a request failure from a completion code.
    pub fn request(code: ResultCode) -> Self {
        SessionError::Request {
            code,
            message: None,
            related_ids: Vec::new(),
        }
    }

    /// Returns the completion code for request failures.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            SessionError::Request { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Io(_) => true,
            SessionError::Timeout => true,
            SessionError::ConnectionBroken(_) => true,
            SessionError::Request { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Io(_)
            | SessionError::SessionClosed
            | SessionError::ConnectionBroken(_)
            | SessionError::Encryption(_)
            | SessionError::TlsHandshake(_) => true,
            SessionError::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Produces an owned copy suitable for handing to another waiter.
    ///
    /// `std::io::Error` and the protocol error are not `Clone`, so
    /// non-cloneable variants are wrapped into a shared `ConnectionBroken`.
    pub fn share(self: &Arc<Self>) -> SessionError {
        match self.as_ref() {
            SessionError::SessionClosed => SessionError::SessionClosed,
            SessionError::Timeout => SessionError::Timeout,
            SessionError::NotConnected => SessionError::NotConnected,
            SessionError::ConnectionBroken(inner) => SessionError::ConnectionBroken(inner.clone()),
            _ => SessionError::ConnectionBroken(self.clone()),
        }
    }
}
