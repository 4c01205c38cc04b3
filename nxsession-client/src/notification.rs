//! Asynchronous notification fan-out.
//!
//! The reader enqueues notifications without ever blocking; a single
//! consumer task hands them to the registered listeners in enqueue order.
//! When the queue is full the newest notification is dropped.

use crate::cache::CachedEntity;
use crate::error::SessionError;
use nxsession_protocol::{FieldValue, Frame};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Offset added to `VID_NOTIFICATION_CODE` of generic `CMD_NOTIFY` frames.
pub const NOTIFY_BASE: u32 = 1000;

pub const CONNECTION_BROKEN: u32 = 1;
pub const NEW_EVENTLOG_RECORD: u32 = 2;
pub const USER_DB_CHANGED: u32 = 3;
pub const OBJECT_CHANGED: u32 = 4;
pub const OBJECT_DELETED: u32 = 5;
pub const NEW_SYSLOG_RECORD: u32 = 6;
pub const NEW_SNMP_TRAP: u32 = 7;
pub const SESSION_KILLED: u32 = 8;
pub const ALARM_CHANGED: u32 = 9;
pub const AUDIT_RECORD: u32 = 10;
pub const EVENT_TEMPLATE_CHANGED: u32 = 11;
pub const EVENT_TEMPLATE_DELETED: u32 = 12;
pub const CUSTOM_MESSAGE: u32 = 13;
pub const FILE_MONITOR: u32 = 14;
pub const OBJECT_SYNC_COMPLETED: u32 = 15;
pub const RECONNECTING: u32 = 16;
pub const RECONNECT_COMPLETED: u32 = 17;
pub const JOB_CHANGED: u32 = 18;
pub const CONSOLE_OUTPUT: u32 = 19;
pub const USER_DB_SYNC_COMPLETED: u32 = 20;

/// Payload attached to a notification.
#[derive(Debug, Clone)]
pub enum NotificationPayload {
    None,
    /// A cache entity after the change (or the removed entity).
    Entity(Arc<CachedEntity>),
    /// One record unpacked from a streamed batch.
    Record(Arc<Record>),
    /// A whole frame, for custom messages.
    Message(Arc<Frame>),
    /// Incremental text, for file monitors.
    Text(String),
    /// Terminating cause, for connection loss.
    Error(Arc<SessionError>),
}

/// A record from a streamed batch. Fields are keyed by offset within the
/// record's field id range.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub index: u32,
    pub fields: Vec<(u32, FieldValue)>,
}

impl Record {
    pub fn get(&self, offset: u32) -> Option<&FieldValue> {
        self.fields.iter().find(|(o, _)| *o == offset).map(|(_, v)| v)
    }
}

/// An asynchronous event delivered to listeners.
#[derive(Debug, Clone)]
pub struct Notification {
    pub code: u32,
    pub subcode: u64,
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            subcode: 0,
            payload: NotificationPayload::None,
        }
    }

    pub fn with_subcode(mut self, subcode: u64) -> Self {
        self.subcode = subcode;
        self
    }

    pub fn with_payload(mut self, payload: NotificationPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Receives session notifications on the consumer task.
pub trait SessionListener: Send + Sync {
    fn on_notification(&self, notification: &Notification);
}

impl<F> SessionListener for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) {
        self(notification)
    }
}

/// Handle returned by [`NotificationHub::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Control {
    RefreshListeners,
    Deliver(Notification),
    Stop,
}

type ListenerList = Vec<(ListenerId, Arc<dyn SessionListener>)>;

/// Producer side of the notification queue plus the listener registry.
pub struct NotificationHub {
    queue: mpsc::Sender<Notification>,
    control: mpsc::UnboundedSender<Control>,
    listeners: RwLock<ListenerList>,
    next_listener: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

/// Consumer side; run it on its own task with [`NotificationConsumer::run`].
pub struct NotificationConsumer {
    hub: Arc<NotificationHub>,
    queue: mpsc::Receiver<Notification>,
    control: mpsc::UnboundedReceiver<Control>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> (Arc<Self>, NotificationConsumer) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            queue: tx,
            control: ctl_tx,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            capacity,
        });
        let consumer = NotificationConsumer {
            hub: hub.clone(),
            queue: rx,
            control: ctl_rx,
        };
        (hub, consumer)
    }

    /// Enqueues without blocking. Returns `false` if the notification was
    /// dropped.
    pub fn publish(&self, notification: Notification) -> bool {
        match self.queue.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    code = n.code,
                    dropped,
                    "notification queue full ({} entries), dropping notification",
                    self.capacity
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueues a connection lifecycle notification. These bypass the
    /// queue limit and are delivered after everything published before
    /// them.
    pub fn publish_lifecycle(&self, notification: Notification) -> bool {
        self.control.send(Control::Deliver(notification)).is_ok()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        let _ = self.control.send(Control::RefreshListeners);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.write();
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            listeners.len() != before
        };
        if removed {
            let _ = self.control.send(Control::RefreshListeners);
        }
        removed
    }

    /// Stops the consumer once the notifications already queued have been
    /// delivered.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Number of notifications dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of notifications currently queued.
    pub fn queued(&self) -> usize {
        self.capacity - self.queue.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn snapshot(&self) -> ListenerList {
        self.listeners.read().clone()
    }
}

impl NotificationConsumer {
    pub async fn run(mut self) {
        let mut listeners = self.hub.snapshot();
        loop {
            tokio::select! {
                biased;
                ctl = self.control.recv() => match ctl {
                    Some(Control::RefreshListeners) => listeners = self.hub.snapshot(),
                    Some(Control::Deliver(notification)) => {
                        self.flush(&listeners);
                        deliver(&listeners, &notification);
                    }
                    Some(Control::Stop) | None => {
                        self.flush(&listeners);
                        break;
                    }
                },
                next = self.queue.recv() => match next {
                    Some(notification) => deliver(&listeners, &notification),
                    None => break,
                },
            }
        }
        tracing::debug!("notification consumer stopped");
    }

    fn flush(&mut self, listeners: &ListenerList) {
        while let Ok(notification) = self.queue.try_recv() {
            deliver(listeners, &notification);
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn deliver(listeners: &ListenerList, notification: &Notification) {
    for (id, listener) in listeners {
        let result = catch_unwind(AssertUnwindSafe(|| listener.on_notification(notification)));
        if let Err(panic) = result {
            let reason = panic_reason(panic.as_ref());
            tracing::error!(
                listener = id.0,
                code = notification.code,
                "session listener panicked: {}",
                reason
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn SessionListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn SessionListener> =
            Arc::new(move |n: &Notification| sink.lock().push(n.code));
        (seen, listener)
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<u32>>>, n: usize) {
        for _ in 0..200 {
            if seen.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let (hub, consumer) = NotificationHub::new(16);
        let (seen, listener) = recorder();
        hub.add_listener(listener);
        let task = tokio::spawn(consumer.run());

        for code in [OBJECT_CHANGED, OBJECT_DELETED, ALARM_CHANGED] {
            assert!(hub.publish(Notification::new(code)));
        }
        wait_for(&seen, 3).await;
        assert_eq!(*seen.lock(), vec![OBJECT_CHANGED, OBJECT_DELETED, ALARM_CHANGED]);

        hub.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_without_blocking() {
        let (hub, consumer) = NotificationHub::new(4);
        for i in 0..10 {
            hub.publish(Notification::new(100 + i));
        }
        assert_eq!(hub.queued(), 4);
        assert_eq!(hub.dropped_count(), 6);

        let (seen, listener) = recorder();
        hub.add_listener(listener);
        let task = tokio::spawn(consumer.run());
        wait_for(&seen, 4).await;
        assert_eq!(*seen.lock(), vec![100, 101, 102, 103]);

        hub.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let (hub, consumer) = NotificationHub::new(16);
        hub.add_listener(Arc::new(|_: &Notification| panic!("listener bug")));
        let (seen, listener) = recorder();
        hub.add_listener(listener);
        let task = tokio::spawn(consumer.run());

        hub.publish(Notification::new(OBJECT_CHANGED));
        hub.publish(Notification::new(OBJECT_DELETED));
        wait_for(&seen, 2).await;
        assert_eq!(*seen.lock(), vec![OBJECT_CHANGED, OBJECT_DELETED]);

        hub.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let (hub, consumer) = NotificationHub::new(16);
        let (seen, listener) = recorder();
        let id = hub.add_listener(listener);
        let task = tokio::spawn(consumer.run());

        hub.publish(Notification::new(1));
        wait_for(&seen, 1).await;
        assert!(hub.remove_listener(id));
        assert!(!hub.remove_listener(id));
        hub.publish(Notification::new(2));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock(), vec![1]);

        hub.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_queue() {
        let (hub, consumer) = NotificationHub::new(16);
        let (seen, listener) = recorder();
        hub.add_listener(listener);
        hub.publish(Notification::new(CONNECTION_BROKEN));
        hub.stop();
        consumer.run().await;
        assert_eq!(*seen.lock(), vec![CONNECTION_BROKEN]);
    }

    #[tokio::test]
    async fn test_lifecycle_survives_full_queue() {
        let (hub, consumer) = NotificationHub::new(2);
        hub.publish(Notification::new(OBJECT_CHANGED));
        hub.publish(Notification::new(OBJECT_DELETED));
        assert!(!hub.publish(Notification::new(ALARM_CHANGED)));
        assert!(hub.publish_lifecycle(Notification::new(CONNECTION_BROKEN)));
        assert_eq!(hub.dropped_count(), 1);

        let (seen, listener) = recorder();
        hub.add_listener(listener);
        hub.stop();
        consumer.run().await;
        assert_eq!(
            *seen.lock(),
            vec![OBJECT_CHANGED, OBJECT_DELETED, CONNECTION_BROKEN]
        );
    }

    #[test]
    fn test_record_lookup() {
        let record = Record {
            index: 0,
            fields: vec![(0, FieldValue::Int32(5)), (1, FieldValue::String("x".into()))],
        };
        assert_eq!(record.get(0), Some(&FieldValue::Int32(5)));
        assert!(record.get(7).is_none());
    }
}
