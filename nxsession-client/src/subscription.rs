//! Message subscriptions and topic membership.

use crate::error::SessionError;
use nxsession_protocol::Frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Receives streamed output frames matched by `(code, id)`.
///
/// Runs on the reader task, so it must not block.
pub trait MessageHandler: Send + Sync {
    /// Handles one frame. Returning `true` completes the subscription.
    fn on_message(&self, frame: &Frame) -> bool;

    /// Called when the subscription expires without completing.
    fn on_expired(&self) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&Frame) -> bool + Send + Sync,
{
    fn on_message(&self, frame: &Frame) -> bool {
        self(frame)
    }
}

type Completion = oneshot::Sender<Result<(), SessionError>>;

struct Entry {
    handler: Arc<dyn MessageHandler>,
    timeout: Duration,
    expires: Instant,
    completion: Completion,
}

/// Resolves when a message subscription completes, expires or the
/// connection goes away.
pub struct SubscriptionHandle {
    code: u16,
    id: u32,
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> (u16, u32) {
        (self.code, self.id)
    }

    pub async fn completed(self) -> Result<(), SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::SessionClosed))
    }
}

/// Active message subscriptions keyed by `(code, id)`.
///
/// Each delivered frame pushes the expiry forward by the subscription's
/// timeout.
#[derive(Default)]
pub struct MessageSubscriptions {
    entries: Mutex<HashMap<(u16, u32), Entry>>,
}

impl MessageSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        code: u16,
        id: u32,
        handler: Arc<dyn MessageHandler>,
        timeout: Duration,
    ) -> SubscriptionHandle {
        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            handler,
            timeout,
            expires: Instant::now() + timeout,
            completion: tx,
        };
        if let Some(old) = self.entries.lock().insert((code, id), entry) {
            let _ = old.completion.send(Err(SessionError::SessionClosed));
        }
        SubscriptionHandle { code, id, rx }
    }

    pub fn remove(&self, code: u16, id: u32) -> bool {
        self.entries.lock().remove(&(code, id)).is_some()
    }

    /// Offers a frame to the matching subscription.
    ///
    /// Gives the frame back when nobody subscribed to its `(code, id)`.
    pub fn dispatch(&self, frame: Frame) -> Result<(), Frame> {
        let key = (frame.code, frame.id);
        let handler = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires = Instant::now() + entry.timeout;
                    entry.handler.clone()
                }
                None => return Err(frame),
            }
        };

        if handler.on_message(&frame) {
            if let Some(entry) = self.entries.lock().remove(&key) {
                let _ = entry.completion.send(Ok(()));
            }
        }
        Ok(())
    }

    /// Removes subscriptions past their expiry. Handlers are told through
    /// [`MessageHandler::on_expired`].
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<_> = entries
                .iter()
                .filter(|(_, e)| e.expires <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = expired.len();
        for entry in expired {
            entry.handler.on_expired();
            let _ = entry.completion.send(Err(SessionError::SubscriptionExpired));
        }
        count
    }

    /// Fails every subscription with `cause`.
    pub fn fail_all(&self, cause: &Arc<SessionError>) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(cause.share()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reference-counted topic membership.
///
/// Only the first subscribe and the last unsubscribe of a topic reach the
/// server. The async mutex is held across the server call, so membership
/// changes for all topics are serialized.
#[derive(Default)]
pub struct TopicSubscriptions {
    counts: tokio::sync::Mutex<HashMap<String, u32>>,
}

impl TopicSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one reference to `topic`; `change` is invoked with `true` when
    /// this is the first one. Returns the new count.
    pub async fn subscribe<F, Fut>(&self, topic: &str, change: F) -> Result<u32, SessionError>
    where
        F: FnOnce(String, bool) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let mut counts = self.counts.lock().await;
        let current = counts.get(topic).copied().unwrap_or(0);
        if current == 0 {
            change(topic.to_string(), true).await?;
        }
        counts.insert(topic.to_string(), current + 1);
        Ok(current + 1)
    }

    /// Drops one reference to `topic`; `change` is invoked with `false`
    /// when it was the last one. Returns the remaining count.
    pub async fn unsubscribe<F, Fut>(&self, topic: &str, change: F) -> Result<u32, SessionError>
    where
        F: FnOnce(String, bool) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let mut counts = self.counts.lock().await;
        let current = match counts.get(topic).copied() {
            Some(n) if n > 0 => n,
            _ => return Ok(0),
        };
        if current == 1 {
            change(topic.to_string(), false).await?;
            counts.remove(topic);
            return Ok(0);
        }
        counts.insert(topic.to_string(), current - 1);
        Ok(current - 1)
    }

    /// Re-announces every active topic, one at a time, without touching
    /// the counts.
    pub async fn replay<F, Fut>(&self, mut change: F) -> Result<usize, SessionError>
    where
        F: FnMut(String, bool) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let counts = self.counts.lock().await;
        let mut topics: Vec<&String> = counts.keys().collect();
        topics.sort();
        for topic in &topics {
            change((*topic).clone(), true).await?;
        }
        Ok(topics.len())
    }

    pub async fn count(&self, topic: &str) -> u32 {
        self.counts.lock().await.get(topic).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Vec<(String, u32)> {
        let mut all: Vec<_> = self
            .counts
            .lock()
            .await
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxsession_protocol::codes::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handler_completes_subscription() {
        let subs = MessageSubscriptions::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = subs.add(
            CMD_EXECUTE_SCRIPT_UPDATE,
            9,
            Arc::new(move |f: &Frame| {
                counter.fetch_add(1, Ordering::SeqCst);
                f.is_end_of_sequence()
            }),
            Duration::from_secs(5),
        );

        assert!(subs.dispatch(Frame::with_id(CMD_EXECUTE_SCRIPT_UPDATE, 9)).is_ok());
        let mut last = Frame::with_id(CMD_EXECUTE_SCRIPT_UPDATE, 9);
        last.flags.set(nxsession_protocol::FrameFlags::END_OF_SEQUENCE, true);
        assert!(subs.dispatch(last).is_ok());

        handle.completed().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_unmatched_frame_is_returned() {
        let subs = MessageSubscriptions::new();
        let _handle = subs.add(CMD_EXECUTE_SCRIPT_UPDATE, 1, Arc::new(|_: &Frame| false), Duration::from_secs(1));
        let back = subs.dispatch(Frame::with_id(CMD_EXECUTE_SCRIPT_UPDATE, 2)).unwrap_err();
        assert_eq!(back.id, 2);
    }

    struct Expiring(AtomicBool);

    impl MessageHandler for Expiring {
        fn on_message(&self, _: &Frame) -> bool {
            false
        }

        fn on_expired(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_expiry_notifies_handler_and_waiter() {
        let subs = MessageSubscriptions::new();
        let handler = Arc::new(Expiring(AtomicBool::new(false)));
        let handle = subs.add(CMD_EXECUTE_SCRIPT_UPDATE, 4, handler.clone(), Duration::from_millis(10));

        assert_eq!(subs.expire(Instant::now()), 0);
        assert_eq!(subs.expire(Instant::now() + Duration::from_millis(50)), 1);
        assert!(handler.0.load(Ordering::SeqCst));
        assert!(matches!(handle.completed().await, Err(SessionError::SubscriptionExpired)));
    }

    #[tokio::test]
    async fn test_fail_all_releases_waiters() {
        let subs = MessageSubscriptions::new();
        let a = subs.add(1, 1, Arc::new(|_: &Frame| false), Duration::from_secs(5));
        let b = subs.add(1, 2, Arc::new(|_: &Frame| false), Duration::from_secs(5));
        assert_eq!(subs.fail_all(&Arc::new(SessionError::SessionClosed)), 2);
        assert!(matches!(a.completed().await, Err(SessionError::SessionClosed)));
        assert!(matches!(b.completed().await, Err(SessionError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_topic_reference_counting() {
        let topics = TopicSubscriptions::new();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for _ in 0..2 {
            let log = calls.clone();
            topics
                .subscribe("alarms", |t, on| async move {
                    log.lock().push((t, on));
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(topics.count("alarms").await, 2);

        for expected in [1, 0] {
            let log = calls.clone();
            let left = topics
                .unsubscribe("alarms", |t, on| async move {
                    log.lock().push((t, on));
                    Ok(())
                })
                .await
                .unwrap();
            assert_eq!(left, expected);
        }

        assert_eq!(
            *calls.lock(),
            vec![("alarms".to_string(), true), ("alarms".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_failed_first_subscribe_keeps_count_zero() {
        let topics = TopicSubscriptions::new();
        let result = topics
            .subscribe("events", |_, _| async { Err(SessionError::request(nxsession_protocol::ResultCode::AccessDenied)) })
            .await;
        assert!(result.is_err());
        assert_eq!(topics.count("events").await, 0);
    }

    #[tokio::test]
    async fn test_replay_preserves_counts() {
        let topics = TopicSubscriptions::new();
        for topic in ["objects", "alarms", "alarms"] {
            topics.subscribe(topic, |_, _| async { Ok(()) }).await.unwrap();
        }
        let replayed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = replayed.clone();
        let n = topics
            .replay(move |t, _| {
                let log = log.clone();
                async move {
                    log.lock().push(t);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(*replayed.lock(), vec!["alarms".to_string(), "objects".to_string()]);
        assert_eq!(
            topics.snapshot().await,
            vec![("alarms".to_string(), 2), ("objects".to_string(), 1)]
        );
    }
}
