//! Versioned snapshot store for the published content tree.
//!
//! Entries live in per-identifier chains of generation-stamped immutable
//! links. A writer batch allocates one new generation, pushes new head
//! links for the entries it touches, and publishes the generation with a
//! single atomic store. Every untouched entry is shared by reference with
//! the previous generation, so an update allocates in proportion to what
//! changed, not to the size of the tree.
//!
//! Readers pin the latest committed generation and resolve each identifier
//! to the newest link at or below the pin, which makes reads lock-free and
//! immune to half-applied batches. Once no live snapshot pins a generation,
//! the links it kept alive are collected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::histogram;
use tracing::{debug, warn};

use crate::domain::{ContentId, PublishedNode};
use crate::lock::mutex_lock;

const SOURCE: &str = "snapshot";
const METRIC_APPLY_MS: &str = "fronda_snapshot_apply_ms";

/// One mutation of the published tree, applied as part of a batch.
#[derive(Debug, Clone)]
pub enum SnapshotOp {
    /// Insert or replace the composed entry for a node.
    Upsert(Arc<PublishedNode>),
    /// Remove a node and everything below it.
    Remove(ContentId),
    /// Reparent a node; its subtree follows implicitly.
    Move {
        id: ContentId,
        new_parent: ContentId,
    },
    /// Reorder the children of a parent.
    Sort {
        parent: ContentId,
        ordered: Vec<ContentId>,
    },
    /// Tombstone every entry; the tree reverts to empty pending a reseed.
    Clear,
}

struct Link {
    generation: u64,
    /// `None` is a tombstone: the node is gone as of this generation but
    /// older pinned snapshots may still resolve an earlier link.
    value: Option<Arc<PublishedNode>>,
    next: Option<Arc<Link>>,
}

/// Pin token for one committed generation. While any snapshot holds it,
/// links visible to that generation survive collection.
struct GenerationPin {
    generation: u64,
}

struct WriterState {
    live_generation: u64,
    last_collect_generation: u64,
}

struct Inner {
    entries: DashMap<ContentId, Arc<Link>>,
    committed: AtomicU64,
    writer: Mutex<WriterState>,
    pins: Mutex<VecDeque<Arc<GenerationPin>>>,
    collect_min_delta: u64,
}

/// Copy-on-write store of composed published entries.
///
/// Cheap to clone; clones share the same tree.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Inner>,
}

/// A consistent point-in-time view of the store.
///
/// Holding a snapshot keeps every entry it can see alive; reads against it
/// ignore all later writes.
pub struct Snapshot {
    inner: Arc<Inner>,
    generation: u64,
    _pin: Arc<GenerationPin>,
}

impl SnapshotStore {
    pub fn new(collect_min_delta: u64) -> Self {
        let entries = DashMap::new();
        entries.insert(
            ContentId::ROOT,
            Arc::new(Link {
                generation: 0,
                value: Some(Arc::new(PublishedNode::root())),
                next: None,
            }),
        );
        Self {
            inner: Arc::new(Inner {
                entries,
                committed: AtomicU64::new(0),
                writer: Mutex::new(WriterState {
                    live_generation: 0,
                    last_collect_generation: 0,
                }),
                pins: Mutex::new(VecDeque::new()),
                collect_min_delta: collect_min_delta.max(1),
            }),
        }
    }

    /// Pin the latest committed generation.
    pub fn current(&self) -> Snapshot {
        let mut pins = mutex_lock(&self.inner.pins, SOURCE, "current");
        // Load inside the pins lock so a pin for an older generation can
        // never be queued behind a newer one.
        let generation = self.inner.committed.load(Ordering::Acquire);
        let pin = match pins.back() {
            Some(pin) if pin.generation == generation => Arc::clone(pin),
            _ => {
                let pin = Arc::new(GenerationPin { generation });
                pins.push_back(Arc::clone(&pin));
                pin
            }
        };
        Snapshot {
            inner: Arc::clone(&self.inner),
            generation,
            _pin: pin,
        }
    }

    pub fn committed_generation(&self) -> u64 {
        self.inner.committed.load(Ordering::Acquire)
    }

    /// Apply a batch of mutations at one new generation.
    ///
    /// Single-writer: concurrent callers serialize on the writer lock;
    /// readers never take it. The new generation becomes visible in a
    /// single atomic store after every op has landed.
    pub fn apply(&self, ops: Vec<SnapshotOp>) -> u64 {
        if ops.is_empty() {
            return self.committed_generation();
        }
        let started = Instant::now();
        let mut writer = mutex_lock(&self.inner.writer, SOURCE, "apply");
        let generation = writer.live_generation + 1;
        writer.live_generation = generation;

        for op in ops {
            self.apply_op(op, generation);
        }
        self.inner.committed.store(generation, Ordering::Release);

        if generation - writer.last_collect_generation >= self.inner.collect_min_delta {
            writer.last_collect_generation = generation;
            self.collect(generation);
        }

        histogram!(METRIC_APPLY_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        generation
    }

    fn apply_op(&self, op: SnapshotOp, generation: u64) {
        match op {
            SnapshotOp::Upsert(node) => self.upsert(node, generation),
            SnapshotOp::Remove(id) => self.remove(id, generation),
            SnapshotOp::Move { id, new_parent } => self.reparent(id, new_parent, generation),
            SnapshotOp::Sort { parent, ordered } => self.sort_children(parent, ordered, generation),
            SnapshotOp::Clear => self.clear(generation),
        }
    }

    /// Newest value for an id, committed or not. Writer-lock callers only.
    fn latest(&self, id: ContentId) -> Option<Arc<PublishedNode>> {
        self.inner.entries.get(&id).and_then(|link| link.value.clone())
    }

    /// Push a new head link, or replace the head when it already carries
    /// this generation (several ops of one batch touching one entry).
    fn set(&self, id: ContentId, value: Option<Arc<PublishedNode>>, generation: u64) {
        match self.inner.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                let head = occupied.get();
                let next = if head.generation == generation {
                    head.next.clone()
                } else {
                    Some(Arc::clone(head))
                };
                occupied.insert(Arc::new(Link {
                    generation,
                    value,
                    next,
                }));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Link {
                    generation,
                    value,
                    next: None,
                }));
            }
        }
    }

    fn upsert(&self, node: Arc<PublishedNode>, generation: u64) {
        if node.id.is_root() {
            warn!(target_module = SOURCE, "upsert of the root sentinel ignored");
            return;
        }
        let previous = self.latest(node.id);
        let parent = node.parent;
        self.set(node.id, Some(Arc::clone(&node)), generation);
        if let Some(previous) = previous
            && previous.parent != parent
        {
            self.unlink_child(previous.parent, node.id, generation);
        }
        self.link_child(parent, node.id, generation);
    }

    fn link_child(&self, parent: ContentId, child: ContentId, generation: u64) {
        let Some(node) = self.latest(parent) else {
            // Events are applied top-down, so a missing parent means the
            // caller skipped an ancestor; the entry stays reachable by id.
            warn!(
                parent = %parent,
                child = %child,
                "parent entry missing; child left out of the child list"
            );
            return;
        };
        if node.child_ids.contains(&child) {
            return;
        }
        let mut updated = (*node).clone();
        updated.child_ids.push(child);
        self.set(parent, Some(Arc::new(updated)), generation);
    }

    fn unlink_child(&self, parent: ContentId, child: ContentId, generation: u64) {
        let Some(node) = self.latest(parent) else {
            return;
        };
        if !node.child_ids.contains(&child) {
            return;
        }
        let mut updated = (*node).clone();
        updated.child_ids.retain(|id| *id != child);
        self.set(parent, Some(Arc::new(updated)), generation);
    }

    fn remove(&self, id: ContentId, generation: u64) {
        if id.is_root() {
            warn!(target_module = SOURCE, "remove of the root sentinel ignored");
            return;
        }
        let Some(node) = self.latest(id) else {
            return; // already gone; redelivery is a no-op
        };
        self.unlink_child(node.parent, id, generation);
        self.remove_subtree(id, generation);
    }

    fn remove_subtree(&self, id: ContentId, generation: u64) {
        let Some(node) = self.latest(id) else {
            return;
        };
        for child in &node.child_ids {
            self.remove_subtree(*child, generation);
        }
        self.set(id, None, generation);
    }

    fn reparent(&self, id: ContentId, new_parent: ContentId, generation: u64) {
        let Some(node) = self.latest(id) else {
            debug!(node = %id, "move for an absent entry ignored");
            return;
        };
        if self.latest(new_parent).is_none() {
            warn!(
                node = %id,
                new_parent = %new_parent,
                "move target missing; entry keeps its current parent"
            );
            return;
        }
        // A target inside the node's own subtree would make the parent
        // chain cyclic and removal unbounded.
        let mut cursor = new_parent;
        while !cursor.is_root() {
            if cursor == id {
                warn!(
                    node = %id,
                    new_parent = %new_parent,
                    "move target is inside the node's own subtree; entry keeps its current parent"
                );
                return;
            }
            match self.latest(cursor) {
                Some(ancestor) => cursor = ancestor.parent,
                None => break,
            }
        }
        if node.parent == new_parent {
            return;
        }
        let old_parent = node.parent;
        let mut moved = (*node).clone();
        moved.parent = new_parent;
        self.set(id, Some(Arc::new(moved)), generation);
        self.unlink_child(old_parent, id, generation);
        self.link_child(new_parent, id, generation);
    }

    fn sort_children(&self, parent: ContentId, ordered: Vec<ContentId>, generation: u64) {
        let Some(node) = self.latest(parent) else {
            debug!(parent = %parent, "sort for an absent parent ignored");
            return;
        };
        // Ids the event doesn't know about keep their relative position at
        // the end; ids it names that we don't hold are dropped.
        let mut reordered: Vec<ContentId> = ordered
            .into_iter()
            .filter(|id| node.child_ids.contains(id))
            .collect();
        for id in &node.child_ids {
            if !reordered.contains(id) {
                reordered.push(*id);
            }
        }
        if reordered == node.child_ids {
            return;
        }
        let mut updated = (*node).clone();
        updated.child_ids = reordered;
        self.set(parent, Some(Arc::new(updated)), generation);
    }

    fn clear(&self, generation: u64) {
        let ids: Vec<ContentId> = self.inner.entries.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if id.is_root() {
                self.set(id, Some(Arc::new(PublishedNode::root())), generation);
            } else {
                self.set(id, None, generation);
            }
        }
    }

    /// Oldest generation any live snapshot still pins. Released pins are
    /// dropped from the front on the way.
    fn floor_generation(&self, committed: u64) -> u64 {
        let mut pins = mutex_lock(&self.inner.pins, SOURCE, "floor_generation");
        while let Some(front) = pins.front() {
            if Arc::strong_count(front) == 1 {
                pins.pop_front();
            } else {
                return front.generation;
            }
        }
        committed
    }

    /// Trim links no live snapshot can reach and drop fully superseded
    /// tombstones. Writer-lock callers only.
    fn collect(&self, committed: u64) {
        let floor = self.floor_generation(committed);
        let mut removable: Vec<ContentId> = Vec::new();
        let mut trimmed = 0usize;

        for mut entry in self.inner.entries.iter_mut() {
            let head = Arc::clone(entry.value());
            let current = match trim_chain(&head, floor) {
                Some(new_head) => {
                    trimmed += 1;
                    *entry.value_mut() = Arc::clone(&new_head);
                    new_head
                }
                None => head,
            };
            if current.next.is_none() && current.value.is_none() && current.generation <= floor {
                removable.push(*entry.key());
            }
        }
        for id in &removable {
            self.inner.entries.remove(id);
        }

        if trimmed > 0 || !removable.is_empty() {
            debug!(
                floor,
                trimmed,
                removed = removable.len(),
                "collected superseded snapshot links"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self, id: ContentId) -> usize {
        let Some(head) = self.inner.entries.get(&id).map(|link| Arc::clone(link.value())) else {
            return 0;
        };
        let mut len = 1;
        let mut cursor = head.next.as_ref().map(Arc::clone);
        while let Some(link) = cursor {
            len += 1;
            cursor = link.next.as_ref().map(Arc::clone);
        }
        len
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }
}

/// Rebuild a chain without the links below the newest one visible at the
/// floor. Returns `None` when nothing can be dropped.
fn trim_chain(head: &Arc<Link>, floor: u64) -> Option<Arc<Link>> {
    let mut newer: Vec<&Arc<Link>> = Vec::new();
    let mut cursor = Some(head);
    let mut keeper: Option<&Arc<Link>> = None;
    while let Some(link) = cursor {
        if link.generation <= floor {
            keeper = Some(link);
            break;
        }
        newer.push(link);
        cursor = link.next.as_ref();
    }
    let keeper = keeper?;
    keeper.next.as_ref()?;

    let mut rebuilt = Arc::new(Link {
        generation: keeper.generation,
        value: keeper.value.clone(),
        next: None,
    });
    for link in newer.into_iter().rev() {
        rebuilt = Arc::new(Link {
            generation: link.generation,
            value: link.value.clone(),
            next: Some(rebuilt),
        });
    }
    Some(rebuilt)
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve an entry as of this snapshot's generation.
    pub fn get(&self, id: ContentId) -> Option<Arc<PublishedNode>> {
        // Clone the head Arc and release the shard guard before walking.
        let head = self.inner.entries.get(&id).map(|link| Arc::clone(link.value()))?;
        let mut cursor = Some(&head);
        while let Some(link) = cursor {
            if link.generation <= self.generation {
                return link.value.clone();
            }
            cursor = link.next.as_ref();
        }
        None
    }

    pub fn contains(&self, id: ContentId) -> bool {
        self.get(id).is_some()
    }

    /// Published children of a node, in tree order. Child ids without a
    /// cached entry (unpublished) are skipped.
    pub fn children(&self, id: ContentId) -> Vec<Arc<PublishedNode>> {
        self.get(id)
            .map(|node| {
                node.child_ids
                    .iter()
                    .filter_map(|child| self.get(*child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Published top-level nodes.
    pub fn at_root(&self) -> Vec<Arc<PublishedNode>> {
        self.children(ContentId::ROOT)
    }
}
