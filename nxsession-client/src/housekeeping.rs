//! Periodic expiry of ephemeral session state.

use crate::session::SessionInner;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub receipts: usize,
    pub subscriptions: usize,
    pub unmatched_frames: usize,
    pub orphan_channels: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.receipts + self.subscriptions + self.unmatched_frames + self.orphan_channels
    }
}

pub(crate) fn sweep(inner: &SessionInner, now: Instant) -> SweepReport {
    SweepReport {
        receipts: inner.files.expire(now),
        subscriptions: inner.messages.expire(now),
        unmatched_frames: inner.waits.expire_unmatched(now),
        orphan_channels: inner.proxy.expire_orphans(now),
    }
}

/// Runs until the session is dropped or closed.
pub(crate) async fn run(session: Weak<SessionInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = session.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        let report = sweep(&inner, Instant::now());
        if report.total() > 0 {
            tracing::debug!(
                "housekeeping: {} receipt(s), {} subscription(s), {} unmatched frame(s), {} orphan channel(s) expired",
                report.receipts,
                report.subscriptions,
                report.unmatched_frames,
                report.orphan_channels
            );
        }
    }
    tracing::debug!("housekeeping stopped");
}
