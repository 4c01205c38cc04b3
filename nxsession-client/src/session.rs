//! The client session.
//!
//! A [`Session`] owns one logical connection to the server and everything
//! bound to it: the request id counter, the correlation engine, caches,
//! subscriptions, proxy channels and file transfers. The reader, the
//! notification consumer, the housekeeping timer and the sync worker run as
//! separate tasks that share the session state through `Arc<SessionInner>`.

use crate::auth::{self, Credentials, TwoFactorHandler};
use crate::cache::{Caches, EntityCache, EntityRegistry};
use crate::config::{SessionConfig, TimeoutCategory};
use crate::correlation::{check_completion, RequestIds, WaitQueue};
use crate::dispatch;
use crate::error::SessionError;
use crate::filetransfer::{
    self, DownloadedFile, FileFollower, FileReceiver, UploadOptions, UploadSummary,
};
use crate::housekeeping;
use crate::notification::{
    self as notify, ListenerId, Notification, NotificationConsumer, NotificationHub,
    NotificationPayload, SessionListener,
};
use crate::proxy::{self, ProxyChannel, ProxyMultiplexer, ProxyTarget};
use crate::stream::SessionStream;
use crate::subscription::{MessageHandler, MessageSubscriptions, SubscriptionHandle, TopicSubscriptions};
use crate::sync::{self, ObjectSync};
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, ResultCode, PROTOCOL_VERSION};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Lifecycle of the connection behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Optional server features, negotiated at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities(u64);

impl ServerCapabilities {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn two_phase_proxy(&self) -> bool {
        self.0 & CAP_TWO_PHASE_TCP_PROXY != 0
    }

    pub fn peer_assigned_proxy_ids(&self) -> bool {
        self.0 & CAP_PEER_ASSIGNED_PROXY_ID != 0
    }

    pub fn file_resume(&self) -> bool {
        self.0 & CAP_FILE_RESUME != 0
    }

    pub fn compression(&self) -> bool {
        self.0 & CAP_COMPRESSION != 0
    }
}

/// What the server reported about itself.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub protocol_version: u32,
    pub server_version: String,
    pub server_id: u64,
    pub timezone: String,
    pub capabilities: ServerCapabilities,
    /// Nonce signed by certificate logins.
    pub challenge: Option<Bytes>,
}

impl ServerInfo {
    fn from_frame(frame: &Frame) -> Self {
        Self {
            protocol_version: frame.get_u32(VID_PROTOCOL_VERSION).unwrap_or(0),
            server_version: frame.get_str(VID_SERVER_VERSION).unwrap_or_default(),
            server_id: frame.get_u64(VID_SERVER_ID).unwrap_or(0),
            timezone: frame.get_str(VID_TIMEZONE).unwrap_or_default(),
            capabilities: ServerCapabilities(frame.get_u64(VID_SERVER_CAPABILITIES).unwrap_or(0)),
            challenge: frame.get_bytes(VID_CHALLENGE),
        }
    }
}

/// Identity established by login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginInfo {
    pub user_id: u32,
    pub session_id: u32,
    pub system_rights: u64,
}

impl LoginInfo {
    pub(crate) fn from_frame(frame: &Frame) -> Self {
        Self {
            user_id: frame.get_u32(VID_USER_ID).unwrap_or(0),
            session_id: frame.get_u32(VID_SESSION_ID).unwrap_or(0),
            system_rights: frame.get_u64(VID_USER_SYS_RIGHTS).unwrap_or(0),
        }
    }
}

/// Server clock estimate: last heartbeat timestamp plus the local time
/// elapsed since it was received.
#[derive(Debug, Default)]
pub struct ServerClock {
    last: Mutex<Option<(i64, Instant)>>,
}

impl ServerClock {
    pub fn update(&self, server_secs: u64) {
        let millis = i64::try_from(server_secs).unwrap_or(i64::MAX / 1000) * 1000;
        *self.last.lock() = Some((millis, Instant::now()));
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        let (millis, received) = (*self.last.lock())?;
        let elapsed = i64::try_from(received.elapsed().as_millis()).ok()?;
        Utc.timestamp_millis_opt(millis.checked_add(elapsed)?).single()
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) ids: RequestIds,
    pub(crate) waits: WaitQueue,
    pub(crate) transport: Transport,
    pub(crate) notifications: Arc<NotificationHub>,
    pub(crate) messages: MessageSubscriptions,
    pub(crate) topics: TopicSubscriptions,
    pub(crate) caches: Caches,
    pub(crate) proxy: ProxyMultiplexer,
    pub(crate) files: FileReceiver,
    pub(crate) clock: ServerClock,
    pub(crate) sync: ObjectSync,
    pub(crate) server: RwLock<ServerInfo>,
    pub(crate) login: RwLock<Option<LoginInfo>>,
    pub(crate) auth_token: Mutex<Option<String>>,
    pub(crate) generation: AtomicU64,
    pub(crate) reader: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ConnectionState>,
    /// Reader generation that stopped while a reconnect was in progress.
    lost_during_reconnect: Mutex<Option<u64>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn new(config: SessionConfig) -> (Arc<Self>, NotificationConsumer, UnboundedReceiver<u32>) {
        let (notifications, consumer) = NotificationHub::new(config.notification_queue_size);
        let (sync, sync_rx) = ObjectSync::new();
        let inner = Arc::new(Self {
            ids: RequestIds::new(),
            waits: WaitQueue::new(config.unmatched_frame_ttl),
            transport: Transport::new(),
            notifications,
            messages: MessageSubscriptions::new(),
            topics: TopicSubscriptions::new(),
            caches: Caches::new(),
            proxy: ProxyMultiplexer::new(config.orphan_data_ttl),
            files: FileReceiver::new(config.receipt_ttl),
            clock: ServerClock::default(),
            sync,
            server: RwLock::new(ServerInfo::default()),
            login: RwLock::new(None),
            auth_token: Mutex::new(None),
            generation: AtomicU64::new(0),
            reader: Mutex::new(None),
            state: Mutex::new(ConnectionState::Connecting),
            lost_during_reconnect: Mutex::new(None),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });
        (inner, consumer, sync_rx)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Records that reader `generation` stopped while the reconnect
    /// controller is running. Returns `false` when no reconnect is in
    /// progress and the caller must handle the loss itself.
    pub(crate) fn defer_loss(&self, generation: u64) -> bool {
        let state = self.state.lock();
        if *state != ConnectionState::Reconnecting {
            return false;
        }
        *self.lost_during_reconnect.lock() = Some(generation);
        true
    }

    /// Moves from `Reconnecting` to `Connected` unless the current reader
    /// already stopped.
    pub(crate) fn finish_reconnect(&self) -> bool {
        let mut state = self.state.lock();
        let current = self.generation.load(Ordering::SeqCst);
        if *self.lost_during_reconnect.lock() == Some(current) {
            return false;
        }
        *state = ConnectionState::Connected;
        true
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.server.read().clone()
    }

    pub(crate) fn capabilities(&self) -> ServerCapabilities {
        self.server.read().capabilities
    }

    pub(crate) fn publish(&self, notification: Notification) -> bool {
        self.notifications.publish(notification)
    }

    /// Connection lifecycle events are never dropped by a full queue.
    pub(crate) fn publish_lifecycle(&self, notification: Notification) -> bool {
        self.notifications.publish_lifecycle(notification)
    }

    /// Writes `frame`, assigning the next request id if it has none.
    pub(crate) async fn send(&self, mut frame: Frame) -> Result<u32, SessionError> {
        if frame.id == 0 {
            frame.id = self.ids.next()?;
        }
        self.transport.send(&frame).await?;
        Ok(frame.id)
    }

    /// Sends `frame` and waits for `(reply_code, frame.id)`.
    pub(crate) async fn request(
        &self,
        mut frame: Frame,
        reply_code: u16,
        category: TimeoutCategory,
    ) -> Result<Frame, SessionError> {
        if frame.id == 0 {
            frame.id = self.ids.next()?;
        }
        let id = frame.id;
        let slot = self.waits.register(reply_code, id)?;
        if let Err(e) = self.transport.send(&frame).await {
            self.waits.cancel(reply_code, id);
            return Err(e);
        }
        self.waits
            .wait_on(slot, reply_code, id, self.config.timeout_for(category))
            .await
    }

    /// Sends `frame` and waits for a successful `CMD_REQUEST_COMPLETED`.
    pub(crate) async fn request_completion(
        &self,
        frame: Frame,
        category: TimeoutCategory,
    ) -> Result<Frame, SessionError> {
        self.request(frame, CMD_REQUEST_COMPLETED, category)
            .await
            .and_then(check_completion)
    }

    pub(crate) async fn change_subscription(&self, topic: String, on: bool) -> Result<(), SessionError> {
        let frame = Frame::new(CMD_CHANGE_SUBSCRIPTION)
            .with_field(VID_TOPIC, topic)
            .with_field(VID_OPERATION, on);
        self.request_completion(frame, TimeoutCategory::Command)
            .await
            .map(|_| ())
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Final teardown; runs at most once. `broken` raises the
    /// `ConnectionBroken` notification with `cause`.
    pub(crate) async fn teardown(&self, cause: Arc<SessionError>, broken: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.transport.close().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        self.waits.shutdown(cause.clone());
        self.messages.fail_all(&cause);
        self.proxy.abort_all(cause.clone());
        self.files.fail_all("session closed");

        if broken {
            tracing::error!("connection broken: {}", cause);
            self.publish_lifecycle(
                Notification::new(notify::CONNECTION_BROKEN)
                    .with_payload(NotificationPayload::Error(cause)),
            );
        } else {
            tracing::info!("session closed");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.notifications.stop();
    }
}

/// Connects, reads server info and sets up encryption when configured.
pub(crate) async fn open_connection(inner: &Arc<SessionInner>) -> Result<(), SessionError> {
    let stream = SessionStream::connect(&inner.config).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    inner.transport.install(write_half, inner.config.compression).await;
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let reader = dispatch::spawn_reader(inner.clone(), read_half, generation);
    if let Some(old) = inner.reader.lock().replace(reader) {
        old.abort();
    }

    let reply = inner
        .request_completion(Frame::new(CMD_GET_SERVER_INFO), TimeoutCategory::Connect)
        .await?;
    let info = ServerInfo::from_frame(&reply);
    if info.protocol_version != u32::from(PROTOCOL_VERSION) && !inner.config.ignore_protocol_version {
        return Err(SessionError::Request {
            code: ResultCode::BadProtocol,
            message: Some(format!(
                "server speaks protocol version {}, client {}",
                info.protocol_version, PROTOCOL_VERSION
            )),
            related_ids: Vec::new(),
        });
    }
    if let Some(secs) = reply.get_u64(VID_TIMESTAMP) {
        inner.clock.update(secs);
    }
    tracing::info!(
        "connected to server {} (protocol {}, id {:x})",
        info.server_version,
        info.protocol_version,
        info.server_id
    );
    *inner.server.write() = info;

    if inner.config.encryption {
        inner
            .request_completion(Frame::new(CMD_REQUEST_ENCRYPTION), TimeoutCategory::Connect)
            .await?;
        if !inner.transport.is_encrypted().await {
            return Err(SessionError::Encryption(
                "server completed the request without negotiating a key".into(),
            ));
        }
    }
    Ok(())
}

/// Handle to a client session. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects and logs in.
    pub async fn connect(config: SessionConfig, credentials: Credentials) -> Result<Self, SessionError> {
        Self::connect_with(config, credentials, None).await
    }

    /// Connects and logs in, using `two_factor` if the server asks for a
    /// second factor.
    pub async fn connect_with(
        config: SessionConfig,
        credentials: Credentials,
        two_factor: Option<Arc<dyn TwoFactorHandler>>,
    ) -> Result<Self, SessionError> {
        let debounce = config.sync_debounce;
        let interval = config.housekeeping_interval;
        let (inner, consumer, sync_rx) = SessionInner::new(config);
        // Not tracked in `tasks`: the consumer exits on its own after
        // delivering what teardown queued.
        tokio::spawn(consumer.run());
        inner.spawn_task(sync::run(Arc::downgrade(&inner), sync_rx, debounce));
        inner.spawn_task(housekeeping::run(Arc::downgrade(&inner), interval));

        let session = Session { inner };
        if let Err(e) = session.establish(&credentials, two_factor.as_deref()).await {
            tracing::warn!("connect failed: {}", e);
            session.inner.teardown(Arc::new(SessionError::SessionClosed), false).await;
            return Err(e);
        }
        Ok(session)
    }

    async fn establish(
        &self,
        credentials: &Credentials,
        two_factor: Option<&dyn TwoFactorHandler>,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        open_connection(inner).await?;
        let info = auth::login(inner, credentials, two_factor).await?;
        *inner.login.write() = Some(info);

        if inner.config.reconnect_enabled {
            let token = match credentials {
                Credentials::Token(token) => Some(token.clone()),
                _ => match auth::request_auth_token(inner).await {
                    Ok(token) => Some(token),
                    Err(e) => {
                        tracing::warn!("no auth token, reconnection disabled: {}", e);
                        None
                    }
                },
            };
            *inner.auth_token.lock() = token;
        }
        inner.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Closes the session. Pending calls fail with `SessionClosed`; the
    /// session cannot be used afterwards. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.inner
            .teardown(Arc::new(SessionError::SessionClosed), false)
            .await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server_info()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.inner.capabilities()
    }

    pub fn login_info(&self) -> Option<LoginInfo> {
        *self.inner.login.read()
    }

    pub async fn is_encrypted(&self) -> bool {
        self.inner.transport.is_encrypted().await
    }

    /// Current server time estimated from the last heartbeat.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        self.inner.clock.now()
    }

    /// Sends a frame without waiting for a reply. A frame without an id gets
    /// the next request id, which is returned.
    pub async fn send(&self, frame: Frame) -> Result<u32, SessionError> {
        self.inner.send(frame).await
    }

    /// Waits for the frame with `code` and `id`.
    pub async fn wait_for_message(
        &self,
        code: u16,
        id: u32,
        timeout: Duration,
    ) -> Result<Frame, SessionError> {
        self.inner.waits.wait(code, id, timeout).await
    }

    /// Sends `frame` and waits for the `reply_code` frame with the same id.
    pub async fn request(
        &self,
        frame: Frame,
        reply_code: u16,
        category: TimeoutCategory,
    ) -> Result<Frame, SessionError> {
        self.inner.request(frame, reply_code, category).await
    }

    /// Sends `frame` and waits for its completion; a failure result code
    /// becomes [`SessionError::Request`].
    pub async fn request_completion(&self, frame: Frame) -> Result<Frame, SessionError> {
        self.inner
            .request_completion(frame, TimeoutCategory::Command)
            .await
    }

    pub async fn request_completion_with(
        &self,
        frame: Frame,
        category: TimeoutCategory,
    ) -> Result<Frame, SessionError> {
        self.inner.request_completion(frame, category).await
    }

    /// Collects `(code, id)` frames until one carries `END_OF_SEQUENCE`.
    /// The timeout applies to each frame.
    pub async fn receive_sequence(
        &self,
        code: u16,
        id: u32,
        timeout: Duration,
    ) -> Result<Vec<Frame>, SessionError> {
        let mut frames = Vec::new();
        loop {
            let frame = self.inner.waits.wait(code, id, timeout).await?;
            let last = frame.is_end_of_sequence();
            frames.push(frame);
            if last {
                return Ok(frames);
            }
        }
    }

    /// Asks the server to stop long-running operation `id` (a script or a
    /// table tool, depending on `stop_code`).
    pub async fn stop_operation(&self, stop_code: u16, id: u32) -> Result<(), SessionError> {
        let frame = Frame::new(stop_code).with_field(VID_REQUEST_ID, id);
        self.inner.send(frame).await.map(|_| ())
    }

    /// Routes frames `(code, id)` to `handler` on the reader task until it
    /// reports completion or no frame arrives within `timeout`.
    pub fn subscribe_messages(
        &self,
        code: u16,
        id: u32,
        handler: Arc<dyn MessageHandler>,
        timeout: Duration,
    ) -> SubscriptionHandle {
        self.inner.messages.add(code, id, handler, timeout)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        self.inner.notifications.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.notifications.remove_listener(id)
    }

    /// Notifications dropped because the queue was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.inner.notifications.dropped_count()
    }

    /// Joins a server topic. Returns the new reference count.
    pub async fn subscribe(&self, topic: &str) -> Result<u32, SessionError> {
        let inner = &self.inner;
        inner
            .topics
            .subscribe(topic, move |t, on| inner.change_subscription(t, on))
            .await
    }

    /// Leaves a server topic. Returns the remaining reference count.
    pub async fn unsubscribe(&self, topic: &str) -> Result<u32, SessionError> {
        let inner = &self.inner;
        inner
            .topics
            .unsubscribe(topic, move |t, on| inner.change_subscription(t, on))
            .await
    }

    pub async fn topic_count(&self, topic: &str) -> u32 {
        self.inner.topics.count(topic).await
    }

    pub async fn open_proxy(&self, target: ProxyTarget) -> Result<ProxyChannel, SessionError> {
        proxy::open(&self.inner, target).await
    }

    pub fn open_proxy_count(&self) -> usize {
        self.inner.proxy.len()
    }

    pub async fn upload_file(
        &self,
        local: impl AsRef<Path>,
        remote_name: &str,
        options: UploadOptions,
    ) -> Result<UploadSummary, SessionError> {
        filetransfer::upload(&self.inner, local.as_ref(), remote_name, options).await
    }

    pub async fn download_file(&self, remote_name: &str) -> Result<DownloadedFile, SessionError> {
        filetransfer::download(&self.inner, remote_name).await
    }

    /// Downloads `remote_name` and keeps receiving text appended to it.
    pub async fn follow_file(
        &self,
        remote_name: &str,
    ) -> Result<(DownloadedFile, FileFollower), SessionError> {
        filetransfer::follow(&self.inner, remote_name).await
    }

    /// Waits for an inbound transfer started by some other request.
    pub async fn wait_for_file(&self, id: u32, timeout: Duration) -> Result<DownloadedFile, SessionError> {
        self.inner.files.wait(id, timeout).await
    }

    pub fn objects(&self) -> &EntityCache {
        &self.inner.caches.objects
    }

    pub fn users(&self) -> &EntityCache {
        &self.inner.caches.users
    }

    pub fn event_templates(&self) -> &EntityCache {
        &self.inner.caches.event_templates
    }

    pub fn entity_registry(&self) -> &EntityRegistry {
        &self.inner.caches.registry
    }

    /// Loads all objects and waits until the initial sync completes.
    pub async fn sync_objects(&self) -> Result<(), SessionError> {
        let bulk = self.inner.config.timeout_for(TimeoutCategory::Bulk);
        self.inner
            .request_completion(Frame::new(CMD_GET_OBJECTS), TimeoutCategory::Bulk)
            .await?;
        tokio::time::timeout(bulk, self.inner.caches.wait_object_sync())
            .await
            .map_err(|_| SessionError::Timeout)
    }

    /// Loads the user database and waits until the server marks it
    /// complete.
    pub async fn sync_users(&self) -> Result<(), SessionError> {
        let bulk = self.inner.config.timeout_for(TimeoutCategory::Bulk);
        self.inner
            .request_completion(Frame::new(CMD_LOAD_USER_DB), TimeoutCategory::Bulk)
            .await?;
        tokio::time::timeout(bulk, self.inner.caches.wait_user_sync())
            .await
            .map_err(|_| SessionError::Timeout)
    }

    /// Queues a background fetch for an object missing from the cache.
    pub fn request_object_sync(&self, id: u32) {
        if !self.inner.caches.objects.contains(id) {
            self.inner.sync.request(id);
        }
    }

    /// Runs one housekeeping sweep now.
    pub fn run_housekeeping(&self) -> housekeeping::SweepReport {
        housekeeping::sweep(&self.inner, Instant::now())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_bits() {
        let caps = ServerCapabilities::from_bits(CAP_TWO_PHASE_TCP_PROXY | CAP_FILE_RESUME);
        assert!(caps.two_phase_proxy());
        assert!(caps.file_resume());
        assert!(!caps.peer_assigned_proxy_ids());
        assert!(!caps.compression());
    }

    #[test]
    fn test_server_clock_advances() {
        let clock = ServerClock::default();
        assert!(clock.now().is_none());
        clock.update(1_700_000_000);
        let now = clock.now().unwrap();
        assert!(now.timestamp() >= 1_700_000_000);
        assert!(now.timestamp() < 1_700_000_005);
    }

    #[test]
    fn test_server_info_from_frame() {
        let frame = Frame::new(CMD_REQUEST_COMPLETED)
            .with_field(VID_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .with_field(VID_SERVER_VERSION, "5.1.0")
            .with_field(VID_SERVER_ID, 0xABCDu64)
            .with_field(VID_SERVER_CAPABILITIES, CAP_COMPRESSION)
            .with_field(VID_CHALLENGE, vec![1u8, 2, 3]);
        let info = ServerInfo::from_frame(&frame);
        assert_eq!(info.server_version, "5.1.0");
        assert_eq!(info.server_id, 0xABCD);
        assert!(info.capabilities.compression());
        assert_eq!(info.challenge.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
