//! Identifiers and the composed, read-optimized content entries served by
//! the cache.
//!
//! Everything here is immutable once constructed: a [`PublishedNode`] is the
//! point-in-time composition of one content node (structure plus all of its
//! published variants), and readers share it by `Arc` without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a content node.
///
/// Stable across publish/unpublish cycles; the relational store remains the
/// authority on what the number means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(i64);

impl ContentId {
    /// Sentinel parent of top-level nodes. Never holds content itself.
    pub const ROOT: ContentId = ContentId(-1);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContentId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// A (culture, segment) pair selecting one rendition of a content node.
///
/// `None` on both axes is the invariant rendition shared by every culture.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VariantKey {
    pub culture: Option<String>,
    pub segment: Option<String>,
}

impl VariantKey {
    /// The culture- and segment-less rendition.
    pub fn invariant() -> Self {
        Self::default()
    }

    pub fn culture(culture: impl Into<String>) -> Self {
        Self {
            culture: Some(culture.into()),
            segment: None,
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn without_segment(&self) -> Self {
        Self {
            culture: self.culture.clone(),
            segment: None,
        }
    }

    pub fn is_invariant(&self) -> bool {
        self.culture.is_none() && self.segment.is_none()
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.culture, &self.segment) {
            (None, None) => write!(f, "*"),
            (Some(culture), None) => write!(f, "{culture}"),
            (None, Some(segment)) => write!(f, "*@{segment}"),
            (Some(culture), Some(segment)) => write!(f, "{culture}@{segment}"),
        }
    }
}

/// One published rendition of a content node.
///
/// Property values are opaque JSON; the property-editor value model lives
/// with the authoring stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVariant {
    pub name: String,
    pub url_segment: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// The composed entry for one content node at one point in time.
///
/// `parent` always resolves to another cached entry or [`ContentId::ROOT`];
/// `child_ids` may name nodes that are not (or not yet) published, and
/// readers skip those.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedNode {
    pub id: ContentId,
    pub parent: ContentId,
    pub sort_order: i32,
    pub template: Option<String>,
    pub child_ids: Vec<ContentId>,
    pub variants: BTreeMap<VariantKey, Arc<PublishedVariant>>,
}

impl PublishedNode {
    /// The synthetic entry holding the top-level child list.
    pub(crate) fn root() -> Self {
        Self {
            id: ContentId::ROOT,
            parent: ContentId::ROOT,
            sort_order: 0,
            template: None,
            child_ids: Vec::new(),
            variants: BTreeMap::new(),
        }
    }

    /// Resolve a requested variant.
    ///
    /// Falls back from (culture, segment) to (culture) to the invariant
    /// rendition, so invariant content is served to every culture.
    pub fn variant(&self, requested: &VariantKey) -> Option<(&VariantKey, &Arc<PublishedVariant>)> {
        if let Some(found) = self.variants.get_key_value(requested) {
            return Some(found);
        }
        if requested.segment.is_some()
            && let Some(found) = self.variants.get_key_value(&requested.without_segment())
        {
            return Some(found);
        }
        if !requested.is_invariant() {
            return self.variants.get_key_value(&VariantKey::invariant());
        }
        None
    }

    pub fn is_published(&self) -> bool {
        !self.variants.is_empty()
    }
}

/// What a reader gets back from a cache lookup: the pinned entry, the
/// rendition that satisfied the request, and the snapshot generation the
/// lookup was answered from.
#[derive(Debug, Clone)]
pub struct PublishedContent {
    node: Arc<PublishedNode>,
    key: VariantKey,
    variant: Arc<PublishedVariant>,
    generation: u64,
}

impl PublishedContent {
    pub(crate) fn new(
        node: Arc<PublishedNode>,
        key: VariantKey,
        variant: Arc<PublishedVariant>,
        generation: u64,
    ) -> Self {
        Self {
            node,
            key,
            variant,
            generation,
        }
    }

    pub fn id(&self) -> ContentId {
        self.node.id
    }

    pub fn parent(&self) -> ContentId {
        self.node.parent
    }

    pub fn children(&self) -> &[ContentId] {
        &self.node.child_ids
    }

    pub fn sort_order(&self) -> i32 {
        self.node.sort_order
    }

    pub fn template(&self) -> Option<&str> {
        self.node.template.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.variant.name
    }

    pub fn url_segment(&self) -> &str {
        &self.variant.url_segment
    }

    pub fn property(&self, alias: &str) -> Option<&serde_json::Value> {
        self.variant.properties.get(alias)
    }

    /// The variant key that actually satisfied the request (after fallback).
    pub fn variant_key(&self) -> &VariantKey {
        &self.key
    }

    pub fn node(&self) -> &Arc<PublishedNode> {
        &self.node
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(name: &str) -> Arc<PublishedVariant> {
        Arc::new(PublishedVariant {
            name: name.to_string(),
            url_segment: name.to_lowercase(),
            properties: BTreeMap::new(),
        })
    }

    fn node_with_variants(keys: Vec<VariantKey>) -> PublishedNode {
        let mut variants = BTreeMap::new();
        for key in keys {
            let label = key.to_string();
            variants.insert(key, variant(&label));
        }
        PublishedNode {
            id: ContentId::new(7),
            parent: ContentId::ROOT,
            sort_order: 0,
            template: None,
            child_ids: Vec::new(),
            variants,
        }
    }

    #[test]
    fn root_sentinel() {
        assert!(ContentId::ROOT.is_root());
        assert!(!ContentId::new(1).is_root());
        assert_eq!(ContentId::new(-1), ContentId::ROOT);
    }

    #[test]
    fn variant_exact_match_wins() {
        let en = VariantKey::culture("en-US");
        let node = node_with_variants(vec![VariantKey::invariant(), en.clone()]);

        let (key, _) = node.variant(&en).expect("culture variant");
        assert_eq!(key, &en);
    }

    #[test]
    fn variant_segment_falls_back_to_culture() {
        let en = VariantKey::culture("en-US");
        let node = node_with_variants(vec![en.clone()]);

        let requested = VariantKey::culture("en-US").with_segment("mobile");
        let (key, _) = node.variant(&requested).expect("segment fallback");
        assert_eq!(key, &en);
    }

    #[test]
    fn variant_culture_falls_back_to_invariant() {
        let node = node_with_variants(vec![VariantKey::invariant()]);

        let requested = VariantKey::culture("da-DK");
        let (key, _) = node.variant(&requested).expect("invariant fallback");
        assert!(key.is_invariant());
    }

    #[test]
    fn variant_miss_when_nothing_matches() {
        let node = node_with_variants(vec![VariantKey::culture("en-US")]);

        assert!(node.variant(&VariantKey::invariant()).is_none());
    }

    #[test]
    fn variant_key_display() {
        assert_eq!(VariantKey::invariant().to_string(), "*");
        assert_eq!(VariantKey::culture("en-US").to_string(), "en-US");
        assert_eq!(
            VariantKey::culture("en-US").with_segment("mobile").to_string(),
            "en-US@mobile"
        );
    }
}
