//! Notification channel: fans lifecycle events out to every cache instance.
//!
//! The authoring path publishes once. Every subscriber, including the
//! instance that made the change, receives the event through the same
//! queue, so the local instance never takes a special-cased fast path that
//! could diverge from the rest of the farm.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::events::{ChangeKind, ChangeNotification, EventQueue};
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "channel";

/// Transport contract for lifecycle notifications.
///
/// Delivery is at-least-once: the cache's event application is idempotent,
/// so a transport is free to redeliver after a transient failure. Per-node
/// causal order is re-derived from the epoch the channel stamps on every
/// event, so a transport that reorders across nodes is acceptable.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, kind: ChangeKind);

    /// Register a new subscriber and return its delivery queue.
    fn subscribe(&self) -> Arc<EventQueue>;
}

/// In-process channel for single-instance deployments and tests.
///
/// One epoch counter covers all subscribers, so every queue observes the
/// same total order.
pub struct LocalChannel {
    epoch: AtomicU64,
    queue_soft_limit: usize,
    subscribers: RwLock<Vec<Arc<EventQueue>>>,
}

impl LocalChannel {
    pub fn new(queue_soft_limit: usize) -> Self {
        Self {
            epoch: AtomicU64::new(1),
            queue_soft_limit,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        rw_read(&self.subscribers, SOURCE, "subscriber_count").len()
    }
}

impl NotificationChannel for LocalChannel {
    fn publish(&self, kind: ChangeKind) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let event = ChangeNotification::new(kind, epoch);

        info!(
            event_id = %event.id,
            epoch = event.epoch,
            kind = ?event.kind,
            "lifecycle event published"
        );

        for queue in rw_read(&self.subscribers, SOURCE, "publish").iter() {
            queue.push(event.clone());
        }
    }

    fn subscribe(&self) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new(self.queue_soft_limit));
        rw_write(&self.subscribers, SOURCE, "subscribe").push(Arc::clone(&queue));
        queue
    }
}
