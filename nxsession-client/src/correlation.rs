//! Request/response correlation.
//!
//! Replies are matched to callers by the exact `(code, id)` pair, never by
//! arrival order. A reply that arrives before its caller starts waiting is
//! parked in the unmatched store and handed over on registration.

use crate::error::SessionError;
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, ResultCode};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

type Key = (u16, u32);
type Reply = Result<Frame, SessionError>;

/// Session-wide request id counter.
///
/// Ids start at 1 and never repeat for the lifetime of the session,
/// including across reconnects. The counter refuses to wrap.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Allocates the next id.
    pub fn next(&self) -> Result<u32, SessionError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == u32::MAX {
                    None
                } else {
                    Some(v + 1)
                }
            })
            .map_err(|_| SessionError::RequestIdsExhausted)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

struct Parked {
    frame: Frame,
    arrived: Instant,
}

#[derive(Default)]
struct State {
    waiters: HashMap<Key, oneshot::Sender<Reply>>,
    unmatched: HashMap<Key, VecDeque<Parked>>,
    closed: Option<Arc<SessionError>>,
}

/// Pending awaits and early replies.
pub struct WaitQueue {
    state: Mutex<State>,
    unmatched_ttl: Duration,
}

impl WaitQueue {
    pub fn new(unmatched_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            unmatched_ttl,
        }
    }

    /// Registers interest in `(code, id)` and returns the reply slot.
    ///
    /// Fails immediately once the queue is closed.
    pub fn register(&self, code: u16, id: u32) -> Result<oneshot::Receiver<Reply>, SessionError> {
        let mut state = self.state.lock();
        if let Some(cause) = &state.closed {
            return Err(cause.share());
        }
        let (tx, rx) = oneshot::channel();
        let key = (code, id);

        if let Some(queue) = state.unmatched.get_mut(&key) {
            if let Some(parked) = queue.pop_front() {
                if queue.is_empty() {
                    state.unmatched.remove(&key);
                }
                let _ = tx.send(Ok(parked.frame));
                return Ok(rx);
            }
        }

        if state.waiters.insert(key, tx).is_some() {
            tracing::debug!(
                "replacing waiter for {} id={}",
                message_code_name(code),
                id
            );
        }
        Ok(rx)
    }

    /// Drops interest in `(code, id)`.
    pub fn cancel(&self, code: u16, id: u32) {
        self.state.lock().waiters.remove(&(code, id));
    }

    /// Hands a frame to its waiter, or parks it when nobody waits yet.
    ///
    /// Returns `true` when a waiter received the frame.
    pub fn deliver(&self, frame: Frame) -> bool {
        let key = (frame.code, frame.id);
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }
        if let Some(tx) = state.waiters.remove(&key) {
            match tx.send(Ok(frame)) {
                Ok(()) => return true,
                Err(Ok(frame)) => {
                    tracing::debug!("waiter for id={} is gone, frame parked", frame.id);
                    park(&mut state, key, frame);
                    return false;
                }
                Err(Err(_)) => return false,
            }
        }
        park(&mut state, key, frame);
        false
    }

    /// Waits for the frame `(code, id)`.
    pub async fn wait(&self, code: u16, id: u32, timeout: Duration) -> Result<Frame, SessionError> {
        let rx = self.register(code, id)?;
        self.wait_on(rx, code, id, timeout).await
    }

    /// Waits on a slot obtained from [`WaitQueue::register`].
    pub async fn wait_on(
        &self,
        rx: oneshot::Receiver<Reply>,
        code: u16,
        id: u32,
        timeout: Duration,
    ) -> Result<Frame, SessionError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.cancel(code, id);
                tracing::debug!(
                    "wait for {} id={} timed out after {:?}",
                    message_code_name(code),
                    id,
                    timeout
                );
                Err(SessionError::Timeout)
            }
        }
    }

    fn closed_error(&self) -> SessionError {
        match &self.state.lock().closed {
            Some(cause) => cause.share(),
            None => SessionError::SessionClosed,
        }
    }

    /// Fails every current waiter with `cause` and forgets parked frames.
    /// The queue stays usable for later waits.
    pub fn release_all(&self, cause: &Arc<SessionError>) -> usize {
        let mut state = self.state.lock();
        let waiters: Vec<_> = state.waiters.drain().collect();
        state.unmatched.clear();
        drop(state);

        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(cause.share()));
        }
        count
    }

    /// Closes the queue for good: current and future waits fail with `cause`.
    pub fn shutdown(&self, cause: Arc<SessionError>) {
        self.state.lock().closed = Some(cause.clone());
        let released = self.release_all(&cause);
        tracing::debug!("wait queue shut down, released {} waiter(s)", released);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Drops parked frames older than the unmatched-frame TTL.
    pub fn expire_unmatched(&self, now: Instant) -> usize {
        let ttl = self.unmatched_ttl;
        let mut state = self.state.lock();
        let mut dropped = 0;
        state.unmatched.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|p| now.saturating_duration_since(p.arrived) < ttl);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn unmatched_count(&self) -> usize {
        self.state.lock().unmatched.values().map(VecDeque::len).sum()
    }
}

fn park(state: &mut State, key: Key, frame: Frame) {
    state.unmatched.entry(key).or_default().push_back(Parked {
        frame,
        arrived: Instant::now(),
    });
}

/// Converts a completion frame into `Ok(frame)` or a request error.
///
/// The error text is taken from the first present of `VID_ERROR_TEXT`,
/// `VID_LOCKED_BY` and `VID_ADDITIONAL_INFO`.
pub fn check_completion(frame: Frame) -> Result<Frame, SessionError> {
    let rcc = ResultCode::from_u32(frame.get_u32(VID_RCC).unwrap_or(0));
    if rcc.is_success() {
        return Ok(frame);
    }
    let message = frame
        .get_str(VID_ERROR_TEXT)
        .or_else(|| frame.get_str(VID_LOCKED_BY).map(|who| format!("locked by {}", who)))
        .or_else(|| frame.get_str(VID_ADDITIONAL_INFO));
    let related_ids = frame.get_u32_list(VID_OBJECT_LIST).unwrap_or_default();
    Err(SessionError::Request {
        code: rcc,
        message,
        related_ids,
    })
}
