//! Content lifecycle events and the per-instance delivery queue.
//!
//! One tagged variant covers every lifecycle change, so the state-transition
//! logic lives in a single dispatcher instead of a handler class per
//! notification type. Events carry a unique id for at-least-once dedupe and
//! a monotonic epoch for per-node causal ordering.

use std::collections::VecDeque;
use std::sync::Mutex;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::ContentId;
use crate::lock::mutex_lock;

const SOURCE: &str = "events";
const METRIC_EVENTS_DROPPED: &str = "fronda_events_dropped_total";
const METRIC_QUEUE_LEN: &str = "fronda_event_queue_len";

/// Monotonic sequence number assigned by the notification channel.
///
/// Used to re-derive per-node causal order on delivery and to discard
/// events older than what has already been applied.
pub type Epoch = u64;

/// The lifecycle change a notification describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A node (or one of its variants) was published or republished.
    Refreshed { id: ContentId },
    /// A node and everything below it must be re-read.
    RefreshedBranch { id: ContentId },
    /// A node was unpublished or deleted; its branch goes with it.
    Removed { id: ContentId },
    /// A node was moved under a new parent; its subtree follows.
    TreeMoved {
        id: ContentId,
        new_parent: ContentId,
    },
    /// The children of a parent were reordered.
    Sorted {
        parent: ContentId,
        ordered_children: Vec<ContentId>,
    },
}

impl ChangeKind {
    /// The node whose causal history this event belongs to.
    pub fn subject(&self) -> ContentId {
        match self {
            Self::Refreshed { id }
            | Self::RefreshedBranch { id }
            | Self::Removed { id }
            | Self::TreeMoved { id, .. } => *id,
            Self::Sorted { parent, .. } => *parent,
        }
    }
}

/// A lifecycle event as delivered to every cache instance, including the
/// one that originated the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Unique per emission; redelivered copies share it.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: ChangeKind,
    pub timestamp: OffsetDateTime,
}

impl ChangeNotification {
    pub fn new(kind: ChangeKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Per-subscriber FIFO of pending notifications.
///
/// A mutex is enough here: contention is one producer (the channel) against
/// one consumer draining in batches. Past the soft limit the oldest
/// notification is dropped and counted; at-least-once delivery means a
/// dropped refresh is repaired by the next one for the same node.
pub struct EventQueue {
    queue: Mutex<VecDeque<ChangeNotification>>,
    soft_limit: usize,
}

impl EventQueue {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            soft_limit: soft_limit.max(1),
        }
    }

    pub fn push(&self, event: ChangeNotification) {
        let mut queue = mutex_lock(&self.queue, SOURCE, "push");
        if queue.len() >= self.soft_limit {
            queue.pop_front();
            counter!(METRIC_EVENTS_DROPPED).increment(1);
            tracing::warn!(
                soft_limit = self.soft_limit,
                "event queue full; oldest notification dropped"
            );
        }
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Drain up to `limit` notifications in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<ChangeNotification> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let batch: Vec<ChangeNotification> = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        batch
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
    }
}
