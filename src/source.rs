//! Content store adapter: authoritative reads from the relational store.
//!
//! The adapter is a pure read seam with no caching and no retries; the cache
//! service owns the retry policy. A relational implementation lives with
//! its schema; [`MemorySource`] backs tests and single-process embedding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ContentId, VariantKey};

/// The relational shape of one content node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: ContentId,
    pub parent: ContentId,
    pub sort_order: i32,
    pub template: Option<String>,
    /// Children in sort order, published or not.
    pub child_ids: Vec<ContentId>,
}

/// One variant row of a content node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub key: VariantKey,
    pub name: String,
    pub url_segment: String,
    pub published: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl VariantRecord {
    /// A published variant with no properties; tests and seed fixtures
    /// fill in the rest as needed.
    pub fn published(key: VariantKey, name: impl Into<String>) -> Self {
        let name = name.into();
        let url_segment = name.to_lowercase().replace(' ', "-");
        Self {
            key,
            name,
            url_segment,
            published: true,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, alias: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(alias.into(), value);
        self
    }

    pub fn unpublished(mut self) -> Self {
        self.published = false;
        self
    }
}

/// Transient I/O failure talking to the content store.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("content store read failed: {detail}")]
    Unavailable { detail: String },
}

impl SourceError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable {
            detail: detail.into(),
        }
    }
}

/// Read access to the authoritative content store.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// `Ok(None)` means the node does not exist at all (deleted), as
    /// opposed to existing unpublished.
    async fn read_node(&self, id: ContentId) -> Result<Option<NodeRecord>, SourceError>;

    /// All variant rows of a node, published or not.
    async fn read_variants(&self, id: ContentId) -> Result<Vec<VariantRecord>, SourceError>;
}

struct MemoryNode {
    parent: ContentId,
    sort_order: i32,
    template: Option<String>,
    variants: Vec<VariantRecord>,
}

/// In-process content store.
///
/// `fail_reads(n)` makes the next `n` reads return a transient error, which
/// is how the retry and fail-safe-stale paths are exercised without a
/// database.
pub struct MemorySource {
    nodes: DashMap<ContentId, MemoryNode>,
    next_sort_order: AtomicI32,
    fail_budget: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            next_sort_order: AtomicI32::new(0),
            fail_budget: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a node. A fresh node is appended at the end of its
    /// parent's sort order; replacing keeps the existing position.
    pub fn upsert(&self, id: ContentId, parent: ContentId, variants: Vec<VariantRecord>) {
        let sort_order = match self.nodes.get(&id) {
            Some(existing) => existing.sort_order,
            None => self.next_sort_order.fetch_add(1, Ordering::SeqCst),
        };
        self.nodes.insert(
            id,
            MemoryNode {
                parent,
                sort_order,
                template: None,
                variants,
            },
        );
    }

    pub fn set_template(&self, id: ContentId, template: impl Into<String>) {
        if let Some(mut node) = self.nodes.get_mut(&id) {
            node.template = Some(template.into());
        }
    }

    pub fn set_sort_order(&self, id: ContentId, sort_order: i32) {
        if let Some(mut node) = self.nodes.get_mut(&id) {
            node.sort_order = sort_order;
        }
    }

    pub fn move_node(&self, id: ContentId, new_parent: ContentId) {
        if let Some(mut node) = self.nodes.get_mut(&id) {
            node.parent = new_parent;
        }
    }

    pub fn remove(&self, id: ContentId) {
        self.nodes.remove(&id);
    }

    /// Fail the next `count` reads with a transient error.
    pub fn fail_reads(&self, count: usize) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), SourceError> {
        let mut budget = self.fail_budget.load(Ordering::SeqCst);
        while budget > 0 {
            match self.fail_budget.compare_exchange(
                budget,
                budget - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(SourceError::unavailable("injected failure")),
                Err(current) => budget = current,
            }
        }
        Ok(())
    }

    fn children_of(&self, id: ContentId) -> Vec<ContentId> {
        let mut children: Vec<(i32, ContentId)> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().parent == id)
            .map(|entry| (entry.value().sort_order, *entry.key()))
            .collect();
        children.sort();
        children.into_iter().map(|(_, id)| id).collect()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn read_node(&self, id: ContentId) -> Result<Option<NodeRecord>, SourceError> {
        self.take_failure()?;
        let Some(node) = self.nodes.get(&id) else {
            return Ok(None);
        };
        let record = NodeRecord {
            id,
            parent: node.parent,
            sort_order: node.sort_order,
            template: node.template.clone(),
            child_ids: Vec::new(),
        };
        drop(node);
        Ok(Some(NodeRecord {
            child_ids: self.children_of(id),
            ..record
        }))
    }

    async fn read_variants(&self, id: ContentId) -> Result<Vec<VariantRecord>, SourceError> {
        self.take_failure()?;
        Ok(self
            .nodes
            .get(&id)
            .map(|node| node.variants.clone())
            .unwrap_or_default())
    }
}
