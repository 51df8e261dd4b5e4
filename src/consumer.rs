//! Background consumer draining lifecycle events into the cache.
//!
//! One consumer per cache instance. Each pass drains a bounded batch from
//! the subscription queue and hands it to the cache as a single apply, so
//! a burst of authoring activity becomes one snapshot generation instead
//! of one per event.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::EventQueue;
use crate::service::PublishedCache;
use crate::source::ContentSource;

const METRIC_CONSUME_MS: &str = "fronda_consume_ms";

pub struct CacheConsumer<S> {
    cache: Arc<PublishedCache<S>>,
    queue: Arc<EventQueue>,
}

impl<S: ContentSource> CacheConsumer<S> {
    /// `queue` is the subscription returned by the notification channel.
    pub fn new(cache: Arc<PublishedCache<S>>, queue: Arc<EventQueue>) -> Self {
        Self { cache, queue }
    }

    /// Drain and apply one batch. Returns `true` when any event was drained,
    /// so callers can keep consuming while a backlog exists.
    pub async fn consume(&self) -> bool {
        let batch = self
            .queue
            .drain(self.cache.settings().consume_batch_limit);
        if batch.is_empty() {
            return false;
        }

        let started = Instant::now();
        let drained = batch.len();
        let applied = self.cache.apply_events(batch).await;
        histogram!(METRIC_CONSUME_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if applied < drained {
            debug!(drained, applied, "batch applied with discards");
        } else {
            info!(drained, "lifecycle batch applied");
        }
        true
    }

    /// Drain until the queue is observed empty.
    pub async fn consume_pending(&self) {
        while self.consume().await {}
    }

    /// Run the consumer on an interval until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        let interval = self.cache.settings().auto_consume_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.consume_pending().await;
            }
        })
    }
}
