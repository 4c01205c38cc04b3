//! Chunked file transfer.
//!
//! Uploads stream a local file as `CMD_FILE_DATA` frames with an optional
//! per-chunk compression header. Downloads accumulate inbound chunks keyed
//! by request id into a temporary file tracked by a receipt.

use crate::config::TimeoutCategory;
use crate::correlation::check_completion;
use crate::error::SessionError;
use crate::notification::{self, Notification, NotificationPayload};
use crate::session::SessionInner;
use bytes::Bytes;
use nxsession_protocol::codes::*;
use nxsession_protocol::compress::{compress_chunk, decompress_chunk};
use nxsession_protocol::{Frame, FrameFlags};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Notify};

/// Text lines buffered per follower before new data is dropped.
const FOLLOWER_QUEUE: usize = 256;

/// Receives upload progress.
pub trait ProgressListener: Send + Sync {
    fn set_total(&self, total: u64);
    fn mark_progress(&self, done: u64);
}

#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Try to continue a partial upload from the server's copy.
    pub resume: bool,
    /// Overrides the configured chunk compression.
    pub compress: Option<bool>,
    pub progress: Option<Arc<dyn ProgressListener>>,
}

impl UploadOptions {
    pub fn resumable() -> Self {
        Self {
            resume: true,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    /// Offset the upload continued from.
    pub offset: u64,
    /// Bytes actually sent.
    pub sent: u64,
    pub total: u64,
}

/// SHA-256 of the first `len` bytes of `path`, or `None` if the file is
/// shorter than that.
pub async fn prefix_hash(path: &Path, len: u64) -> Result<Option<Vec<u8>>, SessionError> {
    let mut file = tokio::fs::File::open(path).await?;
    if file.metadata().await?.len() < len {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    let mut remaining = len;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(None);
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(Some(hasher.finalize().to_vec()))
}

/// Asks the server how much of `remote_name` it already has and returns
/// the offset to continue from.
async fn resume_offset(
    inner: &Arc<SessionInner>,
    local: &Path,
    remote_name: &str,
) -> Result<u64, SessionError> {
    let query = Frame::new(CMD_GET_FILE_FINGERPRINT).with_field(VID_FILE_NAME, remote_name);
    let reply = match inner.request_completion(query, TimeoutCategory::Command).await {
        Ok(reply) => reply,
        Err(SessionError::Request { code, .. }) => {
            tracing::debug!("no partial copy of {} on server ({})", remote_name, code);
            return Ok(0);
        }
        Err(e) => return Err(e),
    };
    let size = reply.get_u64(VID_FILE_SIZE).unwrap_or(0);
    let remote_hash = reply.get_bytes(VID_HASH).unwrap_or_default();
    if size == 0 {
        return Ok(0);
    }

    match prefix_hash(local, size).await? {
        Some(local_hash) if local_hash[..] == remote_hash[..] => {
            tracing::info!(
                "resuming upload of {} at offset {} (sha256 {})",
                remote_name,
                size,
                hex::encode(&local_hash)
            );
            Ok(size)
        }
        Some(local_hash) => {
            tracing::info!(
                "partial copy of {} differs (local {}, remote {}), restarting",
                remote_name,
                hex::encode(&local_hash),
                hex::encode(&remote_hash)
            );
            Ok(0)
        }
        None => Ok(0),
    }
}

/// Uploads `local` to the server as `remote_name`.
pub(crate) async fn upload(
    inner: &Arc<SessionInner>,
    local: &Path,
    remote_name: &str,
    options: UploadOptions,
) -> Result<UploadSummary, SessionError> {
    let total = tokio::fs::metadata(local).await?.len();
    let caps = inner.capabilities();
    let offset = if options.resume && caps.file_resume() {
        resume_offset(inner, local, remote_name).await?
    } else {
        0
    };
    let compress = options
        .compress
        .unwrap_or(inner.config.file_compression)
        && caps.compression();

    // Open the source before the server commits to the transfer.
    let mut file = tokio::fs::File::open(local).await?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }

    let request_id = inner.ids.next()?;
    let request = Frame::with_id(CMD_UPLOAD_FILE, request_id)
        .with_field(VID_FILE_NAME, remote_name)
        .with_field(VID_FILE_SIZE, total)
        .with_field(VID_FILE_OFFSET, offset)
        .with_field(VID_ENABLE_COMPRESSION, compress);
    inner
        .request_completion(request, TimeoutCategory::Command)
        .await?;

    if let Some(progress) = &options.progress {
        progress.set_total(total);
        progress.mark_progress(offset);
    }

    let sent = send_stream(
        inner,
        request_id,
        file,
        offset,
        total,
        compress,
        options.progress.as_deref(),
    )
    .await?;

    // The server confirms once the last chunk is stored.
    let timeout = inner.config.timeout_for(TimeoutCategory::Command);
    inner
        .waits
        .wait(CMD_REQUEST_COMPLETED, request_id, timeout)
        .await
        .and_then(check_completion)?;

    tracing::info!("uploaded {} ({} of {} bytes sent)", remote_name, sent, total);
    Ok(UploadSummary {
        offset,
        sent,
        total,
    })
}

/// Streams bytes `start..total` of `file` as data frames for
/// `request_id`. Any failure, including a source that shrank after the
/// size was announced, sends `CMD_ABORT_FILE_TRANSFER` before returning
/// the error.
async fn send_stream(
    inner: &Arc<SessionInner>,
    request_id: u32,
    mut file: tokio::fs::File,
    start: u64,
    total: u64,
    compress: bool,
    progress: Option<&dyn ProgressListener>,
) -> Result<u64, SessionError> {
    let chunk_size = inner.config.file_chunk_size.max(1);
    let mut buf = vec![0u8; chunk_size];
    let mut sent = 0u64;
    let mut remaining = total.saturating_sub(start);

    let result: Result<(), SessionError> = async {
        loop {
            let want = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
            let n = fill(&mut file, &mut buf[..want]).await?;
            if n < want {
                return Err(SessionError::FileTransfer(format!(
                    "source file shrank during upload ({} bytes missing)",
                    remaining - n as u64
                )));
            }
            remaining -= n as u64;
            let last = remaining == 0;
            let mut frame = if compress {
                let mut f = Frame::binary(CMD_FILE_DATA, request_id, compress_chunk(&buf[..n]));
                f.flags.set(FrameFlags::STREAM, true);
                f
            } else {
                Frame::binary(CMD_FILE_DATA, request_id, Bytes::copy_from_slice(&buf[..n]))
            };
            frame.flags.set(FrameFlags::END_OF_FILE, last);
            inner.transport.send(&frame).await?;

            sent += n as u64;
            if let Some(progress) = progress {
                progress.mark_progress(start + sent);
            }
            if last {
                return Ok(());
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("file transfer {} failed: {}", request_id, e);
        let _ = inner
            .transport
            .send(&Frame::with_id(CMD_ABORT_FILE_TRANSFER, request_id))
            .await;
        return Err(e);
    }
    Ok(sent)
}

async fn fill(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize, SessionError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Open,
    Received,
    Failed,
}

/// One inbound chunk, handed from the reader to the receipt's writer.
struct Chunk {
    data: Bytes,
    compressed: bool,
    last: bool,
}

struct Receipt {
    status: ReceiptStatus,
    writer: Option<mpsc::UnboundedSender<Chunk>>,
    file: Option<NamedTempFile>,
    path: Option<PathBuf>,
    size: u64,
    last_update: Instant,
    error: Option<String>,
}

impl Receipt {
    fn failed(error: &str) -> Self {
        Self {
            status: ReceiptStatus::Failed,
            writer: None,
            file: None,
            path: None,
            size: 0,
            last_update: Instant::now(),
            error: Some(error.to_string()),
        }
    }

    /// Opens a receipt whose chunks are written to a temp file on the
    /// blocking pool.
    fn open(id: u32, receipts: &Arc<Receipts>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let receipts = Arc::downgrade(receipts);
        tokio::task::spawn_blocking(move || {
            let outcome = write_chunks(id, rx, &receipts);
            if let Some(receipts) = receipts.upgrade() {
                receipts.finish(id, outcome);
            }
        });
        Self {
            status: ReceiptStatus::Open,
            writer: Some(tx),
            file: None,
            path: None,
            size: 0,
            last_update: Instant::now(),
            error: None,
        }
    }
}

/// Writer side of one receipt. Returns `Ok(None)` if the receipt was
/// dropped before the last chunk arrived.
fn write_chunks(
    id: u32,
    mut rx: mpsc::UnboundedReceiver<Chunk>,
    receipts: &Weak<Receipts>,
) -> Result<Option<(NamedTempFile, u64)>, String> {
    let mut file = NamedTempFile::new().map_err(|e| format!("cannot create temp file: {}", e))?;
    if let Some(receipts) = receipts.upgrade() {
        receipts.set_path(id, file.path());
    }

    let mut size = 0u64;
    while let Some(chunk) = rx.blocking_recv() {
        let written = if chunk.compressed {
            let data = decompress_chunk(&chunk.data).map_err(|e| e.to_string())?;
            file.write_all(&data).map(|()| data.len())
        } else {
            file.write_all(&chunk.data).map(|()| chunk.data.len())
        };
        size += written.map_err(|e| format!("write failed: {}", e))? as u64;
        if chunk.last {
            file.flush().map_err(|e| format!("flush failed: {}", e))?;
            return Ok(Some((file, size)));
        }
    }
    Ok(None)
}

/// Receipt table shared between the reader and the chunk writers.
#[derive(Default)]
struct Receipts {
    table: Mutex<HashMap<u32, Receipt>>,
    changed: Notify,
}

impl Receipts {
    fn set_path(&self, id: u32, path: &Path) {
        if let Some(receipt) = self.table.lock().get_mut(&id) {
            receipt.path = Some(path.to_path_buf());
        }
    }

    fn finish(&self, id: u32, outcome: Result<Option<(NamedTempFile, u64)>, String>) {
        {
            let mut table = self.table.lock();
            let Some(receipt) = table.get_mut(&id) else {
                return;
            };
            if receipt.status != ReceiptStatus::Open {
                return;
            }
            receipt.writer = None;
            match outcome {
                Ok(Some((file, size))) => {
                    tracing::debug!("transfer {} complete ({} bytes)", id, size);
                    receipt.status = ReceiptStatus::Received;
                    receipt.file = Some(file);
                    receipt.size = size;
                }
                Ok(None) => {
                    receipt.status = ReceiptStatus::Failed;
                    receipt.error = Some("transfer interrupted".into());
                }
                Err(e) => {
                    tracing::warn!("transfer {} failed: {}", id, e);
                    receipt.status = ReceiptStatus::Failed;
                    receipt.error = Some(e);
                }
            }
        }
        self.changed.notify_waiters();
    }
}

/// A downloaded file in a temporary location. It is deleted when dropped
/// unless persisted.
#[derive(Debug)]
pub struct DownloadedFile {
    file: NamedTempFile,
    size: u64,
}

impl DownloadedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Moves the file to `dest`.
    pub fn persist(self, dest: impl AsRef<Path>) -> Result<PathBuf, SessionError> {
        let dest = dest.as_ref().to_path_buf();
        self.file
            .persist(&dest)
            .map_err(|e| SessionError::FileTransfer(format!("cannot persist download: {}", e)))?;
        Ok(dest)
    }
}

/// Inbound transfers and file monitors.
pub struct FileReceiver {
    receipts: Arc<Receipts>,
    followers: Mutex<HashMap<u32, mpsc::Sender<String>>>,
    ttl: Duration,
}

impl FileReceiver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            receipts: Arc::new(Receipts::default()),
            followers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Queues one `CMD_FILE_DATA` chunk for the transfer's writer. Never
    /// touches the disk itself.
    pub fn on_data(&self, frame: &Frame) {
        let id = frame.id;
        let mut table = self.receipts.table.lock();
        let receipt = table
            .entry(id)
            .or_insert_with(|| Receipt::open(id, &self.receipts));
        receipt.last_update = Instant::now();
        if receipt.status != ReceiptStatus::Open {
            return;
        }

        let last = frame.is_end_of_file();
        let chunk = Chunk {
            data: frame.binary_data().clone(),
            compressed: frame.flags.contains(FrameFlags::STREAM),
            last,
        };
        let queued = receipt
            .writer
            .as_ref()
            .is_some_and(|tx| tx.send(chunk).is_ok());
        if !queued {
            tracing::warn!("transfer {} has no writer, dropping chunk", id);
            receipt.status = ReceiptStatus::Failed;
            receipt.error = Some("writer stopped".into());
            receipt.writer = None;
            drop(table);
            self.receipts.changed.notify_waiters();
        }
    }

    /// Marks a transfer aborted by the peer.
    pub fn on_abort(&self, frame: &Frame) {
        {
            let mut table = self.receipts.table.lock();
            let receipt = table
                .entry(frame.id)
                .or_insert_with(|| Receipt::failed("aborted by peer"));
            receipt.status = ReceiptStatus::Failed;
            receipt.error = Some("aborted by peer".into());
            receipt.writer = None;
            receipt.file = None;
            receipt.last_update = Instant::now();
        }
        self.receipts.changed.notify_waiters();
    }

    /// Routes a `CMD_FILE_MONITORING` frame to its follower. Returns the
    /// notification to publish.
    pub fn on_monitor(&self, frame: &Frame) -> Option<Notification> {
        let monitor = frame.get_u32(VID_MONITOR_ID)?;
        let text = frame.get_str(VID_FILE_DATA).unwrap_or_default();

        let mut followers = self.followers.lock();
        if let Some(tx) = followers.get(&monitor) {
            match tx.try_send(text.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("file follower {} is lagging, dropping data", monitor)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    followers.remove(&monitor);
                }
            }
        }
        Some(
            Notification::new(notification::FILE_MONITOR)
                .with_subcode(u64::from(monitor))
                .with_payload(NotificationPayload::Text(text)),
        )
    }

    pub fn add_follower(&self, monitor: u32) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(FOLLOWER_QUEUE);
        self.followers.lock().insert(monitor, tx);
        rx
    }

    pub fn remove_follower(&self, monitor: u32) {
        self.followers.lock().remove(&monitor);
    }

    pub fn status(&self, id: u32) -> Option<ReceiptStatus> {
        self.receipts.table.lock().get(&id).map(|r| r.status)
    }

    /// Waits until transfer `id` leaves `Open`.
    ///
    /// `timeout` counts from the arrival of the latest chunk, so a slow but
    /// steady transfer never times out. A receipt removed by housekeeping
    /// fails the wait with `Timeout`.
    pub async fn wait(&self, id: u32, timeout: Duration) -> Result<DownloadedFile, SessionError> {
        let started = Instant::now();
        let mut seen = false;
        loop {
            let notified = self.receipts.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut table = self.receipts.table.lock();
                match table.get(&id).map(|r| (r.status, r.last_update)) {
                    Some((ReceiptStatus::Open, last_update)) => {
                        seen = true;
                        last_update + timeout
                    }
                    Some((ReceiptStatus::Received, _)) => {
                        let receipt = table.remove(&id).ok_or(SessionError::Timeout)?;
                        return match receipt.file {
                            Some(file) => Ok(DownloadedFile {
                                file,
                                size: receipt.size,
                            }),
                            None => Err(SessionError::FileTransfer("no data".into())),
                        };
                    }
                    Some((ReceiptStatus::Failed, _)) => {
                        let reason = table
                            .remove(&id)
                            .and_then(|r| r.error)
                            .unwrap_or_else(|| "transfer failed".into());
                        return Err(SessionError::FileTransfer(reason));
                    }
                    None if seen => return Err(SessionError::Timeout),
                    None => started + timeout,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Removes receipts whose last update is older than the TTL. Their
    /// writers stop and the temp files are deleted.
    pub fn expire(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let removed = {
            let mut table = self.receipts.table.lock();
            let before = table.len();
            table.retain(|id, r| {
                let keep = now.saturating_duration_since(r.last_update) < ttl;
                if !keep {
                    tracing::debug!("dropping stale file receipt {}", id);
                }
                keep
            });
            before - table.len()
        };
        if removed > 0 {
            self.receipts.changed.notify_waiters();
        }
        removed
    }

    /// Fails every open transfer and forgets all followers.
    pub fn fail_all(&self, reason: &str) {
        for receipt in self.receipts.table.lock().values_mut() {
            if receipt.status == ReceiptStatus::Open {
                receipt.status = ReceiptStatus::Failed;
                receipt.error = Some(reason.to_string());
                receipt.writer = None;
            }
        }
        self.followers.lock().clear();
        self.receipts.changed.notify_waiters();
    }

    #[cfg(test)]
    fn temp_path(&self, id: u32) -> Option<PathBuf> {
        self.receipts.table.lock().get(&id)?.path.clone()
    }
}

/// Downloads `remote_name` into a temporary file.
pub(crate) async fn download(
    inner: &Arc<SessionInner>,
    remote_name: &str,
) -> Result<DownloadedFile, SessionError> {
    let request = Frame::new(CMD_GET_SERVER_FILE).with_field(VID_FILE_NAME, remote_name);
    let reply = inner
        .request_completion(request, TimeoutCategory::Command)
        .await?;
    let file = inner
        .files
        .wait(reply.id, inner.config.timeout_for(TimeoutCategory::Command))
        .await?;
    tracing::info!("downloaded {} ({} bytes)", remote_name, file.size());
    Ok(file)
}

/// Incremental text appended to a followed server file.
pub struct FileFollower {
    monitor: u32,
    rx: mpsc::Receiver<String>,
    session: Arc<SessionInner>,
}

impl FileFollower {
    pub fn monitor_id(&self) -> u32 {
        self.monitor
    }

    /// Next piece of appended text; `None` once following stopped.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stops following on the server.
    pub async fn cancel(self) -> Result<(), SessionError> {
        self.session.files.remove_follower(self.monitor);
        let request =
            Frame::new(CMD_CANCEL_FILE_MONITORING).with_field(VID_MONITOR_ID, self.monitor);
        self.session
            .request_completion(request, TimeoutCategory::Command)
            .await
            .map(|_| ())
    }
}

/// Downloads `remote_name` and keeps following it.
pub(crate) async fn follow(
    inner: &Arc<SessionInner>,
    remote_name: &str,
) -> Result<(DownloadedFile, FileFollower), SessionError> {
    let request = Frame::new(CMD_GET_SERVER_FILE)
        .with_field(VID_FILE_NAME, remote_name)
        .with_field(VID_FILE_FOLLOW, true);
    let reply = inner
        .request_completion(request, TimeoutCategory::Command)
        .await?;
    let monitor = reply.require_u32(VID_MONITOR_ID)?;
    let rx = inner.files.add_follower(monitor);
    let file = inner
        .files
        .wait(reply.id, inner.config.timeout_for(TimeoutCategory::Command))
        .await?;
    Ok((
        file,
        FileFollower {
            monitor,
            rx,
            session: inner.clone(),
        },
    ))
}
