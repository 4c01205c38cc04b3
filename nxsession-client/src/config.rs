//! Session configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NXSESSION_CONFIG)
//! 3. Environment variables (`NXSESSION_*`)
//!
//! [`Config`] is the file/environment view. [`SessionConfig`] is the
//! resolved runtime view handed to [`crate::Session::connect`]; it can also
//! be built directly with its `with_*` methods.

use nxsession_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default file transfer chunk size (128 KiB).
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 128 * 1024;

/// Client configuration as read from YAML and the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection configuration.
    pub connection: ConnectionSection,
    /// Timeout configuration.
    pub timeouts: TimeoutSection,
    /// Automatic reconnection.
    pub reconnect: ReconnectSection,
    /// Notification delivery.
    pub notifications: NotificationSection,
    /// File transfers.
    pub files: FileSection,
    /// Housekeeping and background workers.
    pub housekeeping: HousekeepingSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("NXSESSION_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.connection.apply_env_overrides();
        self.timeouts.apply_env_overrides();
        self.reconnect.apply_env_overrides();
        self.notifications.apply_env_overrides();
        self.files.apply_env_overrides();
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.is_empty() {
            return Err(ConfigError::ValidationError("connection.host is empty".into()));
        }
        if self.notifications.queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "notifications.queue_size must be positive".into(),
            ));
        }
        if self.files.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "files.chunk_size must be positive".into(),
            ));
        }
        if self.timeouts.bulk_multiplier == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts.bulk_multiplier must be positive".into(),
            ));
        }
        self.connection.tls.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Resolves the runtime session configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.connection.host.clone(),
            port: self.connection.port,
            encryption: self.connection.encryption,
            compression: self.connection.compression,
            tls: if self.connection.tls.enabled {
                Some(self.connection.tls.clone())
            } else {
                None
            },
            client_info: self.connection.client_info.clone(),
            client_type: self.connection.client_type,
            ignore_protocol_version: self.connection.ignore_protocol_version,
            read_buffer_size: self
                .connection
                .read_buffer_size
                .clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE),
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            command_timeout: Duration::from_millis(self.timeouts.command_ms),
            bulk_timeout_multiplier: self.timeouts.bulk_multiplier,
            reconnect_enabled: self.reconnect.enabled,
            reconnect_max_attempts: self.reconnect.max_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect.delay_ms),
            notification_queue_size: self.notifications.queue_size,
            file_chunk_size: self.files.chunk_size,
            file_compression: self.files.compression,
            receipt_ttl: Duration::from_secs(self.files.receipt_ttl_secs),
            housekeeping_interval: Duration::from_millis(self.housekeeping.interval_ms),
            unmatched_frame_ttl: Duration::from_millis(self.housekeeping.unmatched_frame_ttl_ms),
            orphan_data_ttl: Duration::from_millis(self.housekeeping.orphan_data_ttl_ms),
            sync_debounce: Duration::from_millis(self.housekeeping.sync_debounce_ms),
        }
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Request protocol-level encryption after connecting.
    pub encryption: bool,
    /// Compress outgoing frame bodies.
    pub compression: bool,
    /// Free-form client description sent at login.
    pub client_info: String,
    /// Client type code sent at login.
    pub client_type: u16,
    /// Accept servers speaking a different protocol version.
    pub ignore_protocol_version: bool,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Transport-level TLS.
    pub tls: TlsClientConfig,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            encryption: true,
            compression: false,
            client_info: format!("nxsession/{}", env!("CARGO_PKG_VERSION")),
            client_type: 0,
            ignore_protocol_version: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: TlsClientConfig::default(),
        }
    }
}

impl ConnectionSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NXSESSION_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = std::env::var("NXSESSION_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Ok(enc) = std::env::var("NXSESSION_ENCRYPTION") {
            self.encryption = env_flag(&enc);
        }
        if let Ok(c) = std::env::var("NXSESSION_COMPRESSION") {
            self.compression = env_flag(&c);
        }
        self.tls.apply_env_overrides();
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// TCP connect (and TLS handshake) timeout in milliseconds.
    pub connect_ms: u64,
    /// Default command timeout in milliseconds.
    pub command_ms: u64,
    /// Bulk retrievals wait `command_ms * bulk_multiplier`.
    pub bulk_multiplier: u32,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            command_ms: 30_000,
            bulk_multiplier: 10,
        }
    }
}

impl TimeoutSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NXSESSION_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.connect_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("NXSESSION_COMMAND_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.command_ms = ms;
            }
        }
    }
}

/// Automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            delay_ms: 10_000,
        }
    }
}

impl ReconnectSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NXSESSION_RECONNECT") {
            self.enabled = env_flag(&v);
        }
        if let Ok(v) = std::env::var("NXSESSION_RECONNECT_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("NXSESSION_RECONNECT_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                self.delay_ms = ms;
            }
        }
    }
}

/// Notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    /// Capacity of the notification queue.
    pub queue_size: usize,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self { queue_size: 8192 }
    }
}

impl NotificationSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NXSESSION_NOTIFICATION_QUEUE_SIZE") {
            if let Ok(n) = v.parse() {
                self.queue_size = n;
            }
        }
    }
}

/// File transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSection {
    /// Upload chunk size in bytes.
    pub chunk_size: usize,
    /// Compress upload chunks.
    pub compression: bool,
    /// Received files idle longer than this are discarded.
    pub receipt_ttl_secs: u64,
}

impl Default for FileSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_FILE_CHUNK_SIZE,
            compression: true,
            receipt_ttl_secs: 300,
        }
    }
}

impl FileSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NXSESSION_FILE_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("NXSESSION_FILE_COMPRESSION") {
            self.compression = env_flag(&v);
        }
    }
}

/// Housekeeping and background workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingSection {
    pub interval_ms: u64,
    /// Replies nobody waits for are kept this long.
    pub unmatched_frame_ttl_ms: u64,
    /// Proxy data for channels not yet registered is kept this long.
    pub orphan_data_ttl_ms: u64,
    /// Object sync requests are batched over this window.
    pub sync_debounce_ms: u64,
}

impl Default for HousekeepingSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            unmatched_frame_ttl_ms: 60_000,
            orphan_data_ttl_ms: 5_000,
            sync_debounce_ms: 50,
        }
    }
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, bundled web roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the configured host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NXSESSION_TLS_ENABLED") {
            self.enabled = env_flag(&v);
        }
        if let Ok(path) = std::env::var("NXSESSION_TLS_CA") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("NXSESSION_TLS_CERT") {
            self.client_cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("NXSESSION_TLS_KEY") {
            self.client_key_path = Some(PathBuf::from(path));
        }
        if let Ok(v) = std::env::var("NXSESSION_TLS_INSECURE") {
            self.insecure = env_flag(&v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "TLS client_cert_path and client_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timeout category of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCategory {
    /// Connection establishment and handshake steps.
    Connect,
    /// Ordinary commands.
    Command,
    /// Large retrievals (tables, routing tables, log batches).
    Bulk,
}

/// Resolved runtime configuration of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub encryption: bool,
    pub compression: bool,
    pub tls: Option<TlsClientConfig>,
    pub client_info: String,
    pub client_type: u16,
    pub ignore_protocol_version: bool,
    pub read_buffer_size: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub bulk_timeout_multiplier: u32,
    pub reconnect_enabled: bool,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay: Duration,
    pub notification_queue_size: usize,
    pub file_chunk_size: usize,
    pub file_compression: bool,
    pub receipt_ttl: Duration,
    pub housekeeping_interval: Duration,
    pub unmatched_frame_ttl: Duration,
    pub orphan_data_ttl: Duration,
    pub sync_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Config::default().session_config()
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Returns the timeout for a call category.
    pub fn timeout_for(&self, category: TimeoutCategory) -> Duration {
        match category {
            TimeoutCategory::Connect => self.connect_timeout,
            TimeoutCategory::Command => self.command_timeout,
            TimeoutCategory::Bulk => self.command_timeout * self.bulk_timeout_multiplier,
        }
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_client_info(mut self, info: impl Into<String>) -> Self {
        self.client_info = info.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.reconnect_enabled = true;
        self.reconnect_max_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_notification_queue_size(mut self, size: usize) -> Self {
        self.notification_queue_size = size.max(1);
        self
    }

    pub fn with_file_chunk_size(mut self, size: usize) -> Self {
        self.file_chunk_size = size.max(1);
        self
    }

    pub fn with_file_compression(mut self, enabled: bool) -> Self {
        self.file_compression = enabled;
        self
    }

    pub fn with_receipt_ttl(mut self, ttl: Duration) -> Self {
        self.receipt_ttl = ttl;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_ignore_protocol_version(mut self, ignore: bool) -> Self {
        self.ignore_protocol_version = ignore;
        self
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::SessionError {
    fn from(e: ConfigError) -> Self {
        crate::error::SessionError::Config(e.to_string())
    }
}
