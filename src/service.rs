//! The published-content cache service.
//!
//! Reads are served from the current snapshot without touching the content
//! store. A miss falls through to the store under a deadline, composes the
//! entry together with any uncached ancestors, and installs the result so
//! the next reader hits. Lifecycle events arrive in batches and become one
//! snapshot generation each, with duplicates and stale epochs discarded
//! before any store read happens.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::{counter, histogram};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::CacheSettings;
use crate::domain::{ContentId, PublishedContent, PublishedNode, PublishedVariant, VariantKey};
use crate::error::CacheError;
use crate::events::{ChangeKind, ChangeNotification, Epoch};
use crate::seed::SeedState;
use crate::snapshot::{Snapshot, SnapshotOp, SnapshotStore};
use crate::source::{ContentSource, NodeRecord, SourceError, VariantRecord};

const METRIC_GET: &str = "fronda_cache_get_total";
const METRIC_REFRESH_MS: &str = "fronda_refresh_ms";
const METRIC_RETRIES: &str = "fronda_refresh_retries_total";
const METRIC_ABANDONED: &str = "fronda_refresh_abandoned_total";
const METRIC_EVENTS_STALE: &str = "fronda_events_stale_total";
const METRIC_EVENTS_DUPLICATE: &str = "fronda_events_duplicate_total";

/// Serving-path cache over a [`ContentSource`].
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct PublishedCache<S> {
    settings: CacheSettings,
    source: Arc<S>,
    store: SnapshotStore,
    seed_state: Arc<SeedState>,
    /// Highest epoch applied per subject node; older deliveries are stale.
    applied_epochs: DashMap<ContentId, Epoch>,
}

impl<S: ContentSource> PublishedCache<S> {
    pub fn new(source: Arc<S>, settings: CacheSettings) -> Arc<Self> {
        let store = SnapshotStore::new(settings.collect_min_gen_delta);
        Arc::new(Self {
            settings,
            source,
            store,
            seed_state: Arc::new(SeedState::new()),
            applied_epochs: DashMap::new(),
        })
    }

    /// Pin the current snapshot. Every read against it sees one generation,
    /// regardless of what the consumer applies in the meantime.
    pub fn current(&self) -> Snapshot {
        self.store.current()
    }

    pub fn is_ready(&self) -> bool {
        self.seed_state.is_ready()
    }

    pub(crate) fn seed_state(&self) -> Arc<SeedState> {
        Arc::clone(&self.seed_state)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Look up one rendition of a published node.
    ///
    /// `Ok(None)` means not published (or no rendition matches after
    /// fallback). A cold miss reads through to the content store under the
    /// configured deadline; [`CacheError::Timeout`] reports the deadline
    /// expiring, not a missing node.
    pub async fn get(
        &self,
        id: ContentId,
        key: &VariantKey,
    ) -> Result<Option<PublishedContent>, CacheError> {
        if id.is_root() {
            return Ok(None);
        }

        let snapshot = self.store.current();
        if snapshot.contains(id) {
            counter!(METRIC_GET, "result" => "hit").increment(1);
            return Ok(resolve(&snapshot, id, key));
        }

        match tokio::time::timeout(self.settings.get_deadline(), self.fill(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                counter!(METRIC_GET, "result" => "source_error").increment(1);
                return Err(CacheError::Source(err));
            }
            Err(_) => {
                counter!(METRIC_GET, "result" => "timeout").increment(1);
                return Err(CacheError::Timeout { id });
            }
        }

        let snapshot = self.store.current();
        let found = resolve(&snapshot, id, key);
        let result = if found.is_some() { "filled" } else { "miss" };
        counter!(METRIC_GET, "result" => result).increment(1);
        Ok(found)
    }

    /// Read through to the store for one uncached node.
    async fn fill(&self, id: ContentId) -> Result<(), SourceError> {
        let ops = self.build_refresh_ops(id, false, &HashSet::new()).await?;
        if !ops.is_empty() {
            self.store.apply(ops);
        }
        Ok(())
    }

    /// Re-read one node from the store and install the result.
    pub async fn refresh(&self, id: ContentId) -> Result<(), SourceError> {
        self.refresh_inner(id, false).await
    }

    /// Re-read a node and all of its descendants.
    pub async fn refresh_branch(&self, id: ContentId) -> Result<(), SourceError> {
        self.refresh_inner(id, true).await
    }

    #[instrument(skip(self), fields(node = %id))]
    async fn refresh_inner(&self, id: ContentId, branch: bool) -> Result<(), SourceError> {
        let started = Instant::now();
        let ops = self.resolve_with_retry(id, branch, &HashSet::new()).await?;
        if !ops.is_empty() {
            self.store.apply(ops);
        }
        histogram!(METRIC_REFRESH_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Evict a node and its subtree. Never touches the content store, so it
    /// cannot fail; evicting an absent node is a no-op.
    pub fn remove(&self, id: ContentId) {
        self.store.apply(vec![SnapshotOp::Remove(id)]);
    }

    /// Tombstone the whole tree. Readers holding older snapshots keep them.
    pub fn clear(&self) {
        self.store.apply(vec![SnapshotOp::Clear]);
    }

    /// Apply one batch of lifecycle events as a single snapshot generation.
    ///
    /// Duplicates (same event id) and stale deliveries (epoch at or below
    /// the last one applied for the same node) are discarded up front.
    /// Repeated refreshes of one node inside the batch collapse to the last.
    /// A refresh whose store reads keep failing is abandoned without
    /// bumping the node's epoch, so a redelivery retries it; the previously
    /// published version stays visible throughout. Returns the number of
    /// events applied.
    #[instrument(skip(self, events), fields(batch = events.len()))]
    pub async fn apply_events(&self, events: Vec<ChangeNotification>) -> usize {
        if events.is_empty() {
            return 0;
        }

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut accepted: Vec<ChangeNotification> = Vec::new();
        for event in events {
            if !seen.insert(event.id) {
                counter!(METRIC_EVENTS_DUPLICATE).increment(1);
                continue;
            }
            let subject = event.kind.subject();
            if let Some(applied) = self.applied_epochs.get(&subject)
                && event.epoch <= *applied
            {
                debug!(
                    event_id = %event.id,
                    epoch = event.epoch,
                    node = %subject,
                    "stale delivery discarded"
                );
                counter!(METRIC_EVENTS_STALE).increment(1);
                continue;
            }
            accepted.push(event);
        }

        let mut last_refresh: HashMap<ContentId, usize> = HashMap::new();
        for (index, event) in accepted.iter().enumerate() {
            if matches!(
                event.kind,
                ChangeKind::Refreshed { .. } | ChangeKind::RefreshedBranch { .. }
            ) {
                last_refresh.insert(event.kind.subject(), index);
            }
        }

        let mut ops: Vec<SnapshotOp> = Vec::new();
        let mut epoch_bumps: Vec<(ContentId, Epoch)> = Vec::new();
        let mut applied = 0usize;
        // Ids whose entries are staged for removal earlier in this batch.
        // Ancestor resolution must not treat them as still cached, or a
        // later refresh could install a child under a removed parent.
        let mut pending_removals: HashSet<ContentId> = HashSet::new();

        for (index, event) in accepted.iter().enumerate() {
            let subject = event.kind.subject();
            match &event.kind {
                ChangeKind::Refreshed { id } | ChangeKind::RefreshedBranch { id } => {
                    if last_refresh.get(&subject) != Some(&index) {
                        // A later refresh of the same node in this batch
                        // supersedes this one.
                        epoch_bumps.push((subject, event.epoch));
                        applied += 1;
                        continue;
                    }
                    let branch = matches!(event.kind, ChangeKind::RefreshedBranch { .. });
                    match self.resolve_with_retry(*id, branch, &pending_removals).await {
                        Ok(mut resolved) => {
                            for op in &resolved {
                                match op {
                                    SnapshotOp::Remove(removed) => {
                                        self.mark_removed_subtree(*removed, &mut pending_removals);
                                    }
                                    SnapshotOp::Upsert(node) => {
                                        pending_removals.remove(&node.id);
                                    }
                                    _ => {}
                                }
                            }
                            ops.append(&mut resolved);
                            epoch_bumps.push((subject, event.epoch));
                            applied += 1;
                        }
                        Err(err) => {
                            // Epoch stays unbumped, so a redelivery of this
                            // event is not considered stale.
                            warn!(
                                node = %id,
                                error = %err,
                                "refresh abandoned; previously published version stays visible"
                            );
                        }
                    }
                }
                ChangeKind::Removed { id } => {
                    ops.push(SnapshotOp::Remove(*id));
                    self.mark_removed_subtree(*id, &mut pending_removals);
                    epoch_bumps.push((subject, event.epoch));
                    applied += 1;
                }
                ChangeKind::TreeMoved { id, new_parent } => {
                    ops.push(SnapshotOp::Move {
                        id: *id,
                        new_parent: *new_parent,
                    });
                    epoch_bumps.push((subject, event.epoch));
                    applied += 1;
                }
                ChangeKind::Sorted {
                    parent,
                    ordered_children,
                } => {
                    ops.push(SnapshotOp::Sort {
                        parent: *parent,
                        ordered: ordered_children.clone(),
                    });
                    epoch_bumps.push((subject, event.epoch));
                    applied += 1;
                }
            }
        }

        if !ops.is_empty() {
            self.store.apply(ops);
        }
        for (subject, epoch) in epoch_bumps {
            self.applied_epochs
                .entry(subject)
                .and_modify(|current| *current = (*current).max(epoch))
                .or_insert(epoch);
        }

        applied
    }

    /// Record a staged removal and, per the current snapshot, the subtree
    /// it will cascade over.
    fn mark_removed_subtree(&self, id: ContentId, removed: &mut HashSet<ContentId>) {
        let snapshot = self.store.current();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !removed.insert(current) {
                continue;
            }
            if let Some(node) = snapshot.get(current) {
                stack.extend(node.child_ids.iter().copied());
            }
        }
    }

    /// Compose the ops for a refresh, retrying transient store failures
    /// with exponential backoff before giving up.
    async fn resolve_with_retry(
        &self,
        id: ContentId,
        branch: bool,
        pending_removals: &HashSet<ContentId>,
    ) -> Result<Vec<SnapshotOp>, SourceError> {
        let mut attempt: u32 = 0;
        loop {
            match self.build_refresh_ops(id, branch, pending_removals).await {
                Ok(ops) => return Ok(ops),
                Err(err) if attempt < self.settings.refresh_retry_attempts => {
                    counter!(METRIC_RETRIES).increment(1);
                    let backoff = self.settings.refresh_backoff(attempt);
                    warn!(
                        node = %id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "content store read failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    counter!(METRIC_ABANDONED).increment(1);
                    return Err(err);
                }
            }
        }
    }

    /// Read a node (and, for a branch refresh, its descendants) from the
    /// store and stage the ops that bring the snapshot up to date. A node
    /// that is gone or unpublished stages a removal instead.
    ///
    /// `pending_removals` names entries staged for removal earlier in the
    /// same batch; the snapshot still holds them, but ancestor resolution
    /// must go back to the store for them instead.
    async fn build_refresh_ops(
        &self,
        id: ContentId,
        branch: bool,
        pending_removals: &HashSet<ContentId>,
    ) -> Result<Vec<SnapshotOp>, SourceError> {
        let mut ops: Vec<SnapshotOp> = Vec::new();
        let mut staged: HashSet<ContentId> = HashSet::new();
        let mut removed: HashSet<ContentId> = pending_removals.clone();
        let mut worklist: VecDeque<ContentId> = VecDeque::from([id]);

        while let Some(current) = worklist.pop_front() {
            if current.is_root() || staged.contains(&current) {
                continue;
            }
            let Some(record) = self.source.read_node(current).await? else {
                ops.push(SnapshotOp::Remove(current));
                removed.insert(current);
                continue;
            };
            let variants = self.source.read_variants(current).await?;
            let Some(node) = compose_entry(&record, variants) else {
                ops.push(SnapshotOp::Remove(current));
                removed.insert(current);
                continue;
            };
            if !self
                .stage_ancestors(record.parent, &mut ops, &mut staged, &removed)
                .await?
            {
                // An ancestor is unpublished, so this node is unreachable
                // and stays out of the cache.
                debug!(node = %current, "skipped: unpublished ancestor");
                continue;
            }
            ops.push(SnapshotOp::Upsert(node));
            staged.insert(current);
            if branch {
                worklist.extend(record.child_ids);
            }
        }

        Ok(ops)
    }

    /// Walk up from `parent` until a cached (or already staged) ancestor is
    /// found and stage the missing ones top-down. An ancestor in `removed`
    /// does not count as cached even while the snapshot still holds it.
    /// Returns `false` when the chain hits an unpublished or missing
    /// ancestor.
    async fn stage_ancestors(
        &self,
        mut parent: ContentId,
        ops: &mut Vec<SnapshotOp>,
        staged: &mut HashSet<ContentId>,
        removed: &HashSet<ContentId>,
    ) -> Result<bool, SourceError> {
        let snapshot = self.store.current();
        let mut chain: Vec<Arc<PublishedNode>> = Vec::new();

        while !parent.is_root() && !staged.contains(&parent) {
            if !removed.contains(&parent) && snapshot.contains(parent) {
                break;
            }
            let Some(record) = self.source.read_node(parent).await? else {
                return Ok(false);
            };
            let variants = self.source.read_variants(parent).await?;
            let Some(node) = compose_entry(&record, variants) else {
                return Ok(false);
            };
            parent = record.parent;
            chain.push(node);
        }

        for node in chain.into_iter().rev() {
            staged.insert(node.id);
            ops.push(SnapshotOp::Upsert(node));
        }
        Ok(true)
    }
}

fn resolve(snapshot: &Snapshot, id: ContentId, key: &VariantKey) -> Option<PublishedContent> {
    let node = snapshot.get(id)?;
    let (matched, variant) = {
        let (matched, variant) = node.variant(key)?;
        (matched.clone(), Arc::clone(variant))
    };
    Some(PublishedContent::new(
        node,
        matched,
        variant,
        snapshot.generation(),
    ))
}

/// Compose the read-optimized entry from the relational rows. `None` when
/// no variant is published, which the cache treats as "remove".
fn compose_entry(record: &NodeRecord, variants: Vec<VariantRecord>) -> Option<Arc<PublishedNode>> {
    let mut published: BTreeMap<VariantKey, Arc<PublishedVariant>> = BTreeMap::new();
    for variant in variants {
        if !variant.published {
            continue;
        }
        published.insert(
            variant.key,
            Arc::new(PublishedVariant {
                name: variant.name,
                url_segment: variant.url_segment,
                properties: variant.properties,
            }),
        );
    }
    if published.is_empty() {
        return None;
    }
    Some(Arc::new(PublishedNode {
        id: record.id,
        parent: record.parent,
        sort_order: record.sort_order,
        template: record.template.clone(),
        child_ids: record.child_ids.clone(),
        variants: published,
    }))
}
