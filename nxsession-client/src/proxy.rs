//! TCP proxy channels multiplexed over the session connection.
//!
//! Each channel is a byte stream identified by a channel id. Inbound data
//! frames are routed by the reader to the channel's bounded buffer; data
//! for ids that are not registered yet is parked in the orphan buffer until
//! the channel claims it or housekeeping expires it.

use crate::config::TimeoutCategory;
use crate::correlation::check_completion;
use crate::error::SessionError;
use crate::session::SessionInner;
use bytes::Bytes;
use dashmap::DashMap;
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, ResultCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Largest payload sent in one proxy data frame.
pub const MAX_PROXY_CHUNK: usize = 64 * 1024;

/// Inbound chunks buffered per channel before it is aborted.
pub const CHANNEL_BUFFER_CHUNKS: usize = 1024;

/// Where the server should connect the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    /// A literal address reachable from the server.
    Address { address: IpAddr, port: u16 },
    /// A port on a managed node; the server picks the route.
    Node { node_id: u32, port: u16 },
}

impl ProxyTarget {
    fn apply(&self, frame: &mut Frame) {
        match self {
            ProxyTarget::Address { address, port } => {
                frame.set(VID_IP_ADDRESS, address.to_string());
                frame.set(VID_PORT, *port);
            }
            ProxyTarget::Node { node_id, port } => {
                frame.set(VID_NODE_ID, *node_id);
                frame.set(VID_PORT, *port);
            }
        }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyTarget::Address { address, port } => write!(f, "{}:{}", address, port),
            ProxyTarget::Node { node_id, port } => write!(f, "node {} port {}", node_id, port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
    Aborted,
}

/// State shared between a channel handle and the multiplexer.
#[derive(Debug)]
pub struct ChannelShared {
    id: u32,
    state: Mutex<(ChannelState, Option<Arc<SessionError>>)>,
}

impl ChannelShared {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new((ChannelState::Opening, None)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state.lock().0
    }

    fn transition(&self, to: ChannelState) {
        let mut state = self.state.lock();
        if !matches!(state.0, ChannelState::Closed | ChannelState::Aborted) {
            state.0 = to;
        }
    }

    fn abort(&self, cause: Arc<SessionError>) {
        let mut state = self.state.lock();
        if !matches!(state.0, ChannelState::Closed | ChannelState::Aborted) {
            *state = (ChannelState::Aborted, Some(cause));
        }
    }

    fn error(&self) -> SessionError {
        let state = self.state.lock();
        match &state.1 {
            Some(cause) => cause.share(),
            None => SessionError::Proxy(format!("channel {} is {:?}", self.id, state.0)),
        }
    }
}

struct Slot {
    shared: Arc<ChannelShared>,
    tx: mpsc::Sender<Bytes>,
}

struct Orphan {
    chunks: Vec<Bytes>,
    first_seen: Instant,
}

/// What the reader should do after routing a data frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    Parked,
    /// The channel's buffer overflowed and it was aborted; the peer must be
    /// told to close it.
    Overflow(u32),
}

/// Registry of open channels plus the orphan buffer.
pub struct ProxyMultiplexer {
    channels: DashMap<u32, Slot>,
    orphans: Mutex<HashMap<u32, Orphan>>,
    next_id: AtomicU32,
    orphan_ttl: Duration,
}

impl ProxyMultiplexer {
    pub fn new(orphan_ttl: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            orphans: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            orphan_ttl,
        }
    }

    /// Next locally assigned channel id not used by an open channel.
    pub fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers channel `id` in `Opening` state and hands it any parked
    /// data for that id.
    pub fn register(
        &self,
        id: u32,
    ) -> Result<(Arc<ChannelShared>, mpsc::Receiver<Bytes>), SessionError> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_CHUNKS);
        let shared = Arc::new(ChannelShared::new(id));

        let mut orphans = self.orphans.lock();
        match self.channels.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SessionError::Proxy(format!("channel id {} already in use", id)));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                if let Some(orphan) = orphans.remove(&id) {
                    tracing::debug!(
                        "channel {} claimed {} parked chunk(s)",
                        id,
                        orphan.chunks.len()
                    );
                    for chunk in orphan.chunks {
                        if tx.try_send(chunk).is_err() {
                            return Err(SessionError::Proxy(format!(
                                "too much data parked for channel {}",
                                id
                            )));
                        }
                    }
                }
                v.insert(Slot {
                    shared: shared.clone(),
                    tx,
                });
            }
        }
        Ok((shared, rx))
    }

    /// Routes an inbound `CMD_TCP_PROXY_DATA` frame by its id.
    pub fn on_data(&self, frame: &Frame) -> Routed {
        let id = frame.id;
        let data = frame.binary_data().clone();

        let mut orphans = self.orphans.lock();
        let routed = self.channels.get(&id).map(|slot| {
            let sent = slot.tx.try_send(data.clone());
            (sent, slot.shared.clone())
        });
        match routed {
            Some((Ok(()), _)) | Some((Err(mpsc::error::TrySendError::Closed(_)), _)) => {
                return Routed::Delivered;
            }
            Some((Err(mpsc::error::TrySendError::Full(_)), shared)) => {
                tracing::warn!("proxy channel {} receive buffer overflow", id);
                shared.abort(Arc::new(SessionError::Proxy(format!(
                    "channel {} receive buffer overflow",
                    id
                ))));
                self.channels.remove(&id);
                return Routed::Overflow(id);
            }
            None => {}
        }

        let orphan = orphans.entry(id).or_insert_with(|| Orphan {
            chunks: Vec::new(),
            first_seen: Instant::now(),
        });
        if orphan.chunks.len() < CHANNEL_BUFFER_CHUNKS {
            orphan.chunks.push(data);
        }
        tracing::debug!("parked data for unknown proxy channel {}", id);
        Routed::Parked
    }

    /// Handles `CMD_CLOSE_TCP_PROXY` from the peer. A non-success result
    /// code aborts the channel.
    pub fn on_close(&self, frame: &Frame) {
        let id = frame.get_u32(VID_CHANNEL_ID).unwrap_or(frame.id);
        let rcc = ResultCode::from_u32(frame.get_u32(VID_RCC).unwrap_or(0));
        self.orphans.lock().remove(&id);

        match self.channels.remove(&id) {
            Some((_, slot)) if rcc.is_success() => {
                tracing::debug!("proxy channel {} closed by peer", id);
                slot.shared.transition(ChannelState::Closed);
            }
            Some((_, slot)) => {
                tracing::debug!("proxy channel {} aborted by peer: {}", id, rcc);
                slot.shared.abort(Arc::new(SessionError::Proxy(format!(
                    "channel {} aborted by peer: {}",
                    id, rcc
                ))));
            }
            None => tracing::debug!("close for unknown proxy channel {}", id),
        }
    }

    /// Removes a channel that was closed or failed locally.
    pub fn finish(&self, id: u32, state: ChannelState) {
        if let Some((_, slot)) = self.channels.remove(&id) {
            slot.shared.transition(state);
        }
    }

    /// Aborts every channel with one shared cause.
    pub fn abort_all(&self, cause: Arc<SessionError>) -> usize {
        let ids: Vec<u32> = self.channels.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, slot)) = self.channels.remove(&id) {
                slot.shared.abort(cause.clone());
                aborted += 1;
            }
        }
        self.orphans.lock().clear();
        if aborted > 0 {
            tracing::info!("aborted {} proxy channel(s): {}", aborted, cause);
        }
        aborted
    }

    /// Drops parked data older than the orphan TTL.
    pub fn expire_orphans(&self, now: Instant) -> usize {
        let ttl = self.orphan_ttl;
        let mut orphans = self.orphans.lock();
        let before = orphans.len();
        orphans.retain(|_, o| now.saturating_duration_since(o.first_seen) < ttl);
        before - orphans.len()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }
}

/// Opens a channel to `target`.
///
/// With client-assigned ids the channel is registered before the setup
/// request goes out. With peer-assigned ids it is registered as soon as the
/// first confirmation names the id. Two-phase setup then waits for the
/// second confirmation before the channel turns `Open`.
pub(crate) async fn open(
    inner: &Arc<SessionInner>,
    target: ProxyTarget,
) -> Result<ProxyChannel, SessionError> {
    let caps = inner.capabilities();
    let request_id = inner.ids.next()?;
    let timeout = inner.config.timeout_for(TimeoutCategory::Command);
    let mut request = Frame::with_id(CMD_SETUP_TCP_PROXY, request_id);
    target.apply(&mut request);

    let (shared, rx) = if caps.peer_assigned_proxy_ids() {
        let reply = inner.request_completion(request, TimeoutCategory::Command).await?;
        let id = reply.require_u32(VID_CHANNEL_ID)?;
        inner.proxy.register(id)?
    } else {
        let id = inner.proxy.allocate_id();
        request.set(VID_CHANNEL_ID, id);
        let registered = inner.proxy.register(id)?;
        if let Err(e) = inner.request_completion(request, TimeoutCategory::Command).await {
            inner.proxy.finish(id, ChannelState::Aborted);
            return Err(e);
        }
        registered
    };

    if caps.two_phase_proxy() {
        let confirmed = inner
            .waits
            .wait(CMD_REQUEST_COMPLETED, request_id, timeout)
            .await
            .and_then(check_completion);
        if let Err(e) = confirmed {
            inner.proxy.finish(shared.id(), ChannelState::Aborted);
            return Err(e);
        }
    }

    shared.transition(ChannelState::Open);
    tracing::info!("proxy channel {} open to {}", shared.id(), target);
    Ok(ProxyChannel {
        shared,
        rx,
        pending: Bytes::new(),
        session: inner.clone(),
    })
}

/// A tunneled byte stream.
pub struct ProxyChannel {
    shared: Arc<ChannelShared>,
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    session: Arc<SessionInner>,
}

impl ProxyChannel {
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Receives the next inbound chunk; `None` at a clean end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        match self.rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None if self.shared.state() == ChannelState::Aborted => Err(self.shared.error()),
            None => Ok(None),
        }
    }

    /// Reads into `buf`; `Ok(0)` at a clean end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut chunk = loop {
            match self.read_chunk().await? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => break chunk,
                None => return Ok(0),
            }
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.pending = chunk.split_off(n);
        Ok(n)
    }

    /// Sends `data`, split into frames of at most [`MAX_PROXY_CHUNK`].
    pub async fn write_all(&self, data: &[u8]) -> Result<(), SessionError> {
        for chunk in data.chunks(MAX_PROXY_CHUNK) {
            if self.shared.state() != ChannelState::Open {
                return Err(self.shared.error());
            }
            let frame = Frame::binary(CMD_TCP_PROXY_DATA, self.id(), Bytes::copy_from_slice(chunk));
            self.session.transport.send(&frame).await?;
        }
        Ok(())
    }

    /// Closes the channel locally and tells the peer.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let id = self.id();
        match self.shared.state() {
            ChannelState::Open | ChannelState::Opening => {}
            _ => return Ok(()),
        }
        self.shared.transition(ChannelState::Closing);
        let frame = Frame::new(CMD_CLOSE_TCP_PROXY).with_field(VID_CHANNEL_ID, id);
        let sent = self.session.send(frame).await.map(|_| ());
        self.session.proxy.finish(id, ChannelState::Closed);
        self.rx.close();
        tracing::debug!("proxy channel {} closed", id);
        sent
    }
}

impl Drop for ProxyChannel {
    fn drop(&mut self) {
        if !matches!(self.shared.state(), ChannelState::Open | ChannelState::Opening) {
            return;
        }
        let id = self.id();
        self.session.proxy.finish(id, ChannelState::Closed);
        let session = self.session.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let frame = Frame::new(CMD_CLOSE_TCP_PROXY).with_field(VID_CHANNEL_ID, id);
                let _ = session.send(frame).await;
            });
        }
    }
}

impl fmt::Debug for ProxyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyChannel")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
