//! # nxsession-client
//!
//! Client session engine for the nxsession protocol.
//!
//! This crate provides:
//! - A session over TCP or TLS with request/reply correlation
//! - Login, two-factor authentication and automatic reconnection
//! - Push notifications, message and topic subscriptions
//! - Entity caches kept current by server updates
//! - TCP proxy channels and file uploads, downloads and monitors

pub mod auth;
pub mod cache;
pub mod config;
pub mod correlation;
mod dispatch;
pub mod error;
pub mod filetransfer;
pub mod housekeeping;
pub mod notification;
pub mod proxy;
mod reconnect;
pub mod session;
pub mod stream;
pub mod subscription;
pub mod sync;
pub mod tls;
mod transport;

pub use auth::{Credentials, TwoFactorChallenge, TwoFactorHandler};
pub use cache::{CachedEntity, EntityCache, EntityClass, EntityRegistry};
pub use config::{Config, SessionConfig, TimeoutCategory, TlsClientConfig};
pub use dispatch::{unpack_records, MAX_CONSECUTIVE_ERRORS};
pub use error::SessionError;
pub use filetransfer::{DownloadedFile, FileFollower, ProgressListener, UploadOptions, UploadSummary};
pub use notification::{ListenerId, Notification, NotificationPayload, Record, SessionListener};
pub use proxy::{ChannelState, ProxyChannel, ProxyTarget};
pub use session::{ConnectionState, LoginInfo, ServerCapabilities, ServerInfo, Session};
pub use subscription::{MessageHandler, SubscriptionHandle};
