//! Entity cache, transaction overlays and token namespaces.
//!
//! The cache holds a partially materialized view of the graph backed by an
//! [`EntityStore`]. Transactions stage changes in a [`TransactionOverlay`]
//! that is folded into the cache on commit.

/// Shared entity cache and lazy relationship chain loading.
pub mod cache;

/// Token namespaces and their resolve-or-create protocol.
pub mod catalog;

/// Kernel facade.
pub mod core;

/// In-memory store implementation.
pub mod memstore;

/// Cache metrics sinks.
pub mod metrics;

/// Cache configuration and its file form.
pub mod options;

/// Per-transaction deltas and merge-on-commit.
pub mod overlay;

/// Sorted property arrays.
pub mod props;

/// Store contracts consumed by the cache.
pub mod store;

/// Shared storage value types.
pub mod types;

pub use cache::{CachedNode, CachedRelationship, DegreeCounts, EntityCache, LruPolicy};
pub use catalog::{Token, TokenHolder};
pub use self::core::{GraphKernel, NodeRef, RelationshipRef};
pub use memstore::MemoryStore;
pub use metrics::{default_metrics, CacheMetrics, CounterMetrics, NoopMetrics};
pub use options::{CacheConfig, CacheOptions, ConfigError};
pub use overlay::{CommitReport, OverlayMerger, TransactionOverlay};
pub use props::PropertyArray;
pub use store::{EntityStore, StoreError, StoreWriter};
pub use types::{Direction, PropValue, RelDirection, RelationshipRecord, TypeSelector};
