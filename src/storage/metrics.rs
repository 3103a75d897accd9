use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of cached entity a metric refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntityKind {
    /// Node entries.
    Node,
    /// Relationship entries.
    Relationship,
}

/// Trait for tracking cache activity.
///
/// Implementations collect statistics about lookups, chain loading, commit
/// merges and evictions. This information can be used for monitoring and for
/// sizing the cache.
pub trait CacheMetrics: Send + Sync {
    /// Records a lookup served from the cache.
    fn hit(&self, kind: EntityKind);

    /// Records a lookup that had to load the entity from the store.
    fn miss(&self, kind: EntityKind);

    /// Records one relationship chain batch.
    ///
    /// # Parameters
    /// * `loaded` - Number of relationship ids the batch brought in.
    fn chain_batch(&self, loaded: usize);

    /// Records an overlay merged into the cache on commit.
    fn commit_merged(&self);

    /// Records a direction block the race filter refused to add.
    fn filter_skipped(&self);

    /// Records an eviction.
    ///
    /// # Parameters
    /// * `layout_change` - Whether the entity was evicted because a node switched between sparse and dense.
    fn evicted(&self, layout_change: bool);
}

/// A no-op implementation of [`CacheMetrics`] that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn hit(&self, _kind: EntityKind) {}
    fn miss(&self, _kind: EntityKind) {}
    fn chain_batch(&self, _loaded: usize) {}
    fn commit_merged(&self) {}
    fn filter_skipped(&self) {}
    fn evicted(&self, _layout_change: bool) {}
}

/// A thread-safe counter-based implementation of [`CacheMetrics`].
#[derive(Default, Debug)]
pub struct CounterMetrics {
    /// Node lookups served from cache.
    pub node_hits: AtomicU64,

    /// Node lookups that loaded from the store.
    pub node_misses: AtomicU64,

    /// Relationship lookups served from cache.
    pub relationship_hits: AtomicU64,

    /// Relationship lookups that loaded from the store.
    pub relationship_misses: AtomicU64,

    /// Chain batches read.
    pub chain_batches: AtomicU64,

    /// Relationship ids brought in by chain batches.
    pub chain_ids_loaded: AtomicU64,

    /// Overlays merged on commit.
    pub commits_merged: AtomicU64,

    /// Direction blocks skipped by the race filter.
    pub filter_skips: AtomicU64,

    /// Entities evicted.
    pub evictions: AtomicU64,

    /// Nodes evicted because their layout changed.
    pub layout_evictions: AtomicU64,
}

impl CacheMetrics for CounterMetrics {
    fn hit(&self, kind: EntityKind) {
        match kind {
            EntityKind::Node => self.node_hits.fetch_add(1, Ordering::Relaxed),
            EntityKind::Relationship => self.relationship_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn miss(&self, kind: EntityKind) {
        match kind {
            EntityKind::Node => self.node_misses.fetch_add(1, Ordering::Relaxed),
            EntityKind::Relationship => self.relationship_misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn chain_batch(&self, loaded: usize) {
        self.chain_batches.fetch_add(1, Ordering::Relaxed);
        self.chain_ids_loaded
            .fetch_add(loaded as u64, Ordering::Relaxed);
    }

    fn commit_merged(&self) {
        self.commits_merged.fetch_add(1, Ordering::Relaxed);
    }

    fn filter_skipped(&self) {
        self.filter_skips.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self, layout_change: bool) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if layout_change {
            self.layout_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn CacheMetrics> {
    Arc::new(NoopMetrics)
}
