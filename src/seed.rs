//! Startup seeding: warm configured branches before declaring the cache
//! ready.
//!
//! Until seeding finishes, `is_ready` stays false and a host keeps routing
//! around this instance (or serving cold reads through the deadline path).
//! Seeding is best-effort: a branch that cannot be read is logged and
//! skipped, and the overall pass runs under a budget; the cache is declared
//! ready either way, because a partially warm cache that fills on demand
//! beats an instance that never comes up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use metrics::histogram;
use tracing::{info, warn};

use crate::config::CacheSettings;
use crate::domain::ContentId;
use crate::service::PublishedCache;
use crate::source::ContentSource;

const METRIC_SEED_MS: &str = "fronda_seed_ms";

const PHASE_NOT_STARTED: u8 = 0;
const PHASE_SEEDING: u8 = 1;
const PHASE_READY: u8 = 2;

/// Seeding phase of one cache instance.
pub struct SeedState {
    phase: AtomicU8,
}

impl SeedState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(PHASE_NOT_STARTED),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_READY
    }

    pub fn is_seeding(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_SEEDING
    }

    /// Move to seeding; `false` when another seeder already claimed it.
    fn begin(&self) -> bool {
        self.phase
            .compare_exchange(
                PHASE_NOT_STARTED,
                PHASE_SEEDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish(&self) {
        self.phase.store(PHASE_READY, Ordering::Release);
    }
}

/// Runs the startup seeding pass for one cache instance.
pub struct Seeder<S> {
    cache: Arc<PublishedCache<S>>,
}

impl<S: ContentSource> Seeder<S> {
    pub fn new(cache: Arc<PublishedCache<S>>) -> Self {
        Self { cache }
    }

    /// Warm the configured branches and declare the cache ready.
    ///
    /// Returns `false` when seeding had already been claimed (by a previous
    /// call or a concurrent one); the cache state is untouched in that case.
    pub async fn run(&self) -> bool {
        let state = self.cache.seed_state();
        if !state.begin() {
            return false;
        }

        let settings: CacheSettings = self.cache.settings().clone();
        let started = Instant::now();

        match tokio::time::timeout(settings.seed_timeout(), self.seed_all(&settings)).await {
            Ok((seeded, failed)) => {
                info!(seeded, failed, "seeding pass finished");
            }
            Err(_) => {
                warn!(
                    budget_ms = settings.seed_timeout_ms,
                    "seeding budget exhausted; remaining branches fill on demand"
                );
            }
        }

        state.finish();
        histogram!(METRIC_SEED_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        info!("published-content cache ready");
        true
    }

    async fn seed_all(&self, settings: &CacheSettings) -> (usize, usize) {
        let mut seeded = 0usize;
        let mut failed = 0usize;
        for raw in &settings.seed_ids {
            let id = ContentId::new(*raw);
            let outcome = if settings.seed_descendants {
                self.cache.refresh_branch(id).await
            } else {
                self.cache.refresh(id).await
            };
            match outcome {
                Ok(()) => seeded += 1,
                Err(err) => {
                    failed += 1;
                    warn!(node = %id, error = %err, "seed branch skipped");
                }
            }
        }
        (seeded, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VariantKey;
    use crate::source::{MemorySource, VariantRecord};

    fn invariant(name: &str) -> Vec<VariantRecord> {
        vec![VariantRecord::published(VariantKey::invariant(), name)]
    }

    fn tree() -> Arc<MemorySource> {
        let source = MemorySource::new();
        source.upsert(ContentId::new(1), ContentId::ROOT, invariant("Home"));
        source.upsert(ContentId::new(2), ContentId::new(1), invariant("About"));
        source.upsert(ContentId::new(10), ContentId::ROOT, invariant("Blog"));
        Arc::new(source)
    }

    fn settings(seed_ids: Vec<i64>) -> CacheSettings {
        CacheSettings {
            seed_ids,
            refresh_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seeding_warms_branches_and_flips_ready() {
        let cache = PublishedCache::new(tree(), settings(vec![1]));
        assert!(!cache.is_ready());

        assert!(Seeder::new(Arc::clone(&cache)).run().await);

        assert!(cache.is_ready());
        let snapshot = cache.current();
        assert!(snapshot.contains(ContentId::new(1)));
        assert!(snapshot.contains(ContentId::new(2)));
        assert!(!snapshot.contains(ContentId::new(10)));
    }

    #[tokio::test]
    async fn seeding_without_descendants_stops_at_the_candidate() {
        let cache = PublishedCache::new(
            tree(),
            CacheSettings {
                seed_descendants: false,
                ..settings(vec![1])
            },
        );
        Seeder::new(Arc::clone(&cache)).run().await;

        let snapshot = cache.current();
        assert!(snapshot.contains(ContentId::new(1)));
        assert!(!snapshot.contains(ContentId::new(2)));
    }

    #[tokio::test]
    async fn empty_seed_list_is_ready_immediately() {
        let cache = PublishedCache::new(tree(), settings(Vec::new()));
        Seeder::new(Arc::clone(&cache)).run().await;

        assert!(cache.is_ready());
        assert_eq!(cache.current().at_root().len(), 0);
    }

    #[tokio::test]
    async fn failed_seed_branch_does_not_block_readiness() {
        let source = tree();
        let cache = PublishedCache::new(
            Arc::clone(&source),
            CacheSettings {
                refresh_retry_attempts: 0,
                ..settings(vec![1, 10])
            },
        );

        // Only the first branch's reads fail.
        source.fail_reads(1);
        Seeder::new(Arc::clone(&cache)).run().await;

        assert!(cache.is_ready());
        assert!(cache.current().contains(ContentId::new(10)));
    }

    #[tokio::test]
    async fn second_seeding_run_is_a_no_op() {
        let cache = PublishedCache::new(tree(), settings(vec![1]));
        let seeder = Seeder::new(Arc::clone(&cache));

        assert!(seeder.run().await);
        assert!(!seeder.run().await);
    }
}
