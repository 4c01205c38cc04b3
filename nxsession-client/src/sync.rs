//! Background object synchronization.
//!
//! Cache misses are queued and sent to the server in batches: the worker
//! waits for the debounce interval after the first id, then issues one
//! `CMD_GET_SELECTED_OBJECTS` for everything collected. The objects arrive
//! later as ordinary cache deltas.

use crate::config::TimeoutCategory;
use crate::session::SessionInner;
use nxsession_protocol::codes::*;
use nxsession_protocol::Frame;
use std::collections::BTreeSet;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;

/// Producer handle for the sync worker.
#[derive(Debug, Clone)]
pub struct ObjectSync {
    tx: mpsc::UnboundedSender<u32>,
}

impl ObjectSync {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `id` for the next batch. Returns `false` once the worker has
    /// stopped.
    pub fn request(&self, id: u32) -> bool {
        self.tx.send(id).is_ok()
    }
}

/// Collects one batch: blocks for the first id, then gathers more until
/// `debounce` has elapsed. Returns `None` when the queue is closed.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<u32>,
    debounce: Duration,
) -> Option<BTreeSet<u32>> {
    let first = rx.recv().await?;
    let mut batch = BTreeSet::from([first]);
    let window = tokio::time::sleep(debounce);
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            next = rx.recv() => match next {
                Some(id) => {
                    batch.insert(id);
                }
                None => break,
            },
        }
    }
    Some(batch)
}

pub fn batch_request(ids: &[u32]) -> Frame {
    let mut frame = Frame::new(CMD_GET_SELECTED_OBJECTS).with_field(VID_NUM_OBJECTS, ids.len() as u32);
    frame.set_u32_list(VID_OBJECT_LIST, ids);
    frame
}

pub(crate) async fn run(
    session: Weak<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<u32>,
    debounce: Duration,
) {
    while let Some(mut batch) = next_batch(&mut rx, debounce).await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        batch.retain(|id| !inner.caches.objects.contains(*id));
        if batch.is_empty() {
            continue;
        }
        let ids: Vec<u32> = batch.into_iter().collect();
        tracing::debug!("synchronizing {} object(s)", ids.len());
        if let Err(e) = inner
            .request_completion(batch_request(&ids), TimeoutCategory::Command)
            .await
        {
            tracing::warn!("object sync for {} id(s) failed: {}", ids.len(), e);
        }
    }
    tracing::debug!("object sync worker stopped");
}
