//! Fronda published-content cache
//!
//! The layer between a relational content store and the rendering path:
//! reads come from immutable in-memory snapshots, and authoring changes
//! arrive as lifecycle events that are folded into new snapshot
//! generations without ever blocking readers.
//!
//! - [`service::PublishedCache`] is the serving-path entry point
//! - [`snapshot::SnapshotStore`] holds the generation-stamped tree
//! - [`channel::NotificationChannel`] fans lifecycle events out;
//!   [`consumer::CacheConsumer`] drains them into the cache
//! - [`seed::Seeder`] warms configured branches before the cache
//!   reports ready
//! - [`source::ContentSource`] is the read seam to the authoritative
//!   store
//!
//! ## Configuration
//!
//! Hosts deserialize [`config::CacheSettings`] from their configuration
//! layer; every field has a default, so an empty table works:
//!
//! ```toml
//! [cache]
//! get_deadline_ms = 2000
//! seed_ids = [1001, 1002]
//! # ... see config.rs for all options
//! ```

pub mod channel;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod error;
pub mod events;
pub mod seed;
pub mod service;
pub mod snapshot;
pub mod source;

mod lock;

pub use channel::{LocalChannel, NotificationChannel};
pub use config::CacheSettings;
pub use consumer::CacheConsumer;
pub use domain::{ContentId, PublishedContent, PublishedNode, PublishedVariant, VariantKey};
pub use error::CacheError;
pub use events::{ChangeKind, ChangeNotification, Epoch, EventQueue};
pub use seed::{SeedState, Seeder};
pub use service::PublishedCache;
pub use snapshot::{Snapshot, SnapshotOp, SnapshotStore};
pub use source::{ContentSource, MemorySource, NodeRecord, SourceError, VariantRecord};
