//! Cache settings.
//!
//! A host deserializes [`CacheSettings`] from whatever configuration layer
//! it runs (file, env); every field has a sensible default so an empty
//! table works.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_GET_DEADLINE_MS: u64 = 2_000;
const DEFAULT_REFRESH_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_REFRESH_BACKOFF_MS: u64 = 50;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SEED_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_COLLECT_MIN_GEN_DELTA: u64 = 8;
const DEFAULT_QUEUE_SOFT_LIMIT: usize = 10_000;

/// Tuning knobs for the published-content cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Deadline for a `get` that has to fall through to the content store.
    pub get_deadline_ms: u64,
    /// Retries after a transient store failure during refresh.
    pub refresh_retry_attempts: u32,
    /// Base backoff between refresh retries; doubles per attempt.
    pub refresh_backoff_ms: u64,
    /// Maximum lifecycle events handed to one `apply` batch.
    pub consume_batch_limit: usize,
    /// Cadence of the background consumer loop.
    pub auto_consume_interval_ms: u64,
    /// Nodes refreshed eagerly at startup before the cache reports ready.
    pub seed_ids: Vec<i64>,
    /// Walk descendants of each seed candidate.
    pub seed_descendants: bool,
    /// Overall budget for the seeding pass; a partial seed is acceptable.
    pub seed_timeout_ms: u64,
    /// Generations between collections of superseded snapshot links.
    pub collect_min_gen_delta: u64,
    /// Per-subscriber queue bound; the oldest notification is dropped past it.
    pub queue_soft_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            get_deadline_ms: DEFAULT_GET_DEADLINE_MS,
            refresh_retry_attempts: DEFAULT_REFRESH_RETRY_ATTEMPTS,
            refresh_backoff_ms: DEFAULT_REFRESH_BACKOFF_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            seed_ids: Vec::new(),
            seed_descendants: true,
            seed_timeout_ms: DEFAULT_SEED_TIMEOUT_MS,
            collect_min_gen_delta: DEFAULT_COLLECT_MIN_GEN_DELTA,
            queue_soft_limit: DEFAULT_QUEUE_SOFT_LIMIT,
        }
    }
}

impl CacheSettings {
    pub fn get_deadline(&self) -> Duration {
        Duration::from_millis(self.get_deadline_ms)
    }

    /// Exponential backoff for retry `attempt` (zero-based), capped so a
    /// misconfigured attempt count cannot overflow into hour-long sleeps.
    pub fn refresh_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.refresh_backoff_ms.saturating_mul(1 << attempt.min(6)))
    }

    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let settings = CacheSettings::default();
        assert_eq!(settings.get_deadline_ms, 2_000);
        assert_eq!(settings.refresh_retry_attempts, 3);
        assert_eq!(settings.refresh_backoff_ms, 50);
        assert_eq!(settings.consume_batch_limit, 100);
        assert_eq!(settings.auto_consume_interval_ms, 1_000);
        assert!(settings.seed_ids.is_empty());
        assert!(settings.seed_descendants);
        assert_eq!(settings.collect_min_gen_delta, 8);
        assert_eq!(settings.queue_soft_limit, 10_000);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let settings = CacheSettings {
            refresh_backoff_ms: 50,
            ..Default::default()
        };
        assert_eq!(settings.refresh_backoff(0), Duration::from_millis(50));
        assert_eq!(settings.refresh_backoff(1), Duration::from_millis(100));
        assert_eq!(settings.refresh_backoff(2), Duration::from_millis(200));
    }

    #[test]
    fn backoff_is_capped() {
        let settings = CacheSettings {
            refresh_backoff_ms: 50,
            ..Default::default()
        };
        assert_eq!(settings.refresh_backoff(60), settings.refresh_backoff(6));
    }

    #[test]
    fn deserializes_from_empty_table() {
        let settings: CacheSettings = serde_json::from_str("{}").expect("defaults");
        assert_eq!(settings.consume_batch_limit, 100);
    }

    #[test]
    fn deserializes_overrides() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{"seed_ids": [1, 2, 3], "get_deadline_ms": 500}"#)
                .expect("overrides");
        assert_eq!(settings.seed_ids, vec![1, 2, 3]);
        assert_eq!(settings.get_deadline_ms, 500);
    }
}
