//! Shared entity cache.
//!
//! Nodes and relationships are loaded once per id, through striped load
//! locks, and kept in sharded maps. Relationship chains are pulled in lazily
//! by [`ChainLoader`] as readers walk them. Eviction decisions belong to an
//! optional [`EvictionHook`]; the cache only reports sizes and drops victims.

pub mod cell;
pub mod iter;
pub mod loader;
mod map;
pub mod node;
pub mod policy;
pub mod position;
pub mod rel_ids;
pub mod relationship;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::primitives::concurrency::StripedLocks;
use crate::storage::metrics::{default_metrics, CacheMetrics, EntityKind};
use crate::storage::options::CacheOptions;
use crate::storage::props::PropertyArray;
use crate::storage::store::EntityStore;
use crate::storage::types::{Direction, RelDirection, RelationshipRecord, TypeSelector};
use crate::types::{CacheError, EntityRef, LabelId, NodeId, RelId, Result, TypeId};

pub use cell::LazyCell;
pub use iter::{PropertyIter, RelationshipIter};
pub use loader::{ChainBatch, ChainLoader};
pub use node::{CachedNode, LoadStatus, RelationshipCommit};
pub use policy::{EvictionHook, LruPolicy};
pub use position::{AddFilter, ChainPosition, FirstRelationshipIds, NodeLayout};
pub use rel_ids::RelIdSet;
pub use relationship::{CachedRelationship, GraphProperties};

use map::ShardedMap;

/// Relationship counts of one type on one node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DegreeCounts {
    /// Relationships starting at the node.
    pub outgoing: usize,
    /// Relationships ending at the node.
    pub incoming: usize,
    /// Relationships starting and ending at the node.
    pub loops: usize,
}

impl DegreeCounts {
    /// Count visible to a query in `direction`.
    pub fn total(&self, direction: Direction) -> usize {
        match direction {
            Direction::Outgoing => self.outgoing + self.loops,
            Direction::Incoming => self.incoming + self.loops,
            Direction::Both => self.outgoing + self.incoming + self.loops,
        }
    }
}

/// Id to cached-entity maps with load-once semantics.
pub struct EntityCache {
    store: Arc<dyn EntityStore>,
    loader: ChainLoader,
    nodes: ShardedMap<NodeId, CachedNode>,
    relationships: ShardedMap<RelId, CachedRelationship>,
    graph: RwLock<Arc<GraphProperties>>,
    load_locks: StripedLocks,
    metrics: Arc<dyn CacheMetrics>,
    hook: Option<Arc<dyn EvictionHook>>,
}

impl EntityCache {
    /// Creates an empty cache over `store`.
    pub fn new(store: Arc<dyn EntityStore>, options: &CacheOptions) -> Self {
        Self {
            loader: ChainLoader::new(Arc::clone(&store), options.chain_batch_size),
            store,
            nodes: ShardedMap::new(options.map_shards),
            relationships: ShardedMap::new(options.map_shards),
            graph: RwLock::new(Arc::new(GraphProperties::new())),
            load_locks: StripedLocks::new(options.load_lock_stripes),
            metrics: options.metrics.clone().unwrap_or_else(default_metrics),
            hook: None,
        }
    }

    /// Routes size changes through `hook` and evicts what it returns.
    pub fn with_eviction_hook(mut self, hook: Arc<dyn EvictionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Store the cache reads from.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Chain loader shared by every node.
    pub fn loader(&self) -> &ChainLoader {
        &self.loader
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn CacheMetrics> {
        &self.metrics
    }

    /// Returns the cached node, loading its light record on a miss.
    ///
    /// Concurrent callers for the same id observe the same entry.
    pub fn get_node(&self, id: NodeId) -> Result<Arc<CachedNode>> {
        if let Some(node) = self.node_hit(id) {
            return Ok(node);
        }
        let load = self.load_locks.lock(&EntityRef::Node(id));
        if let Some(node) = self.node_hit(id) {
            return Ok(node);
        }
        self.metrics.miss(EntityKind::Node);
        let record = self
            .store
            .node(id)?
            .ok_or(CacheError::NotFound(EntityRef::Node(id)))?;
        let (node, _) = self.nodes.get_or_insert(id, Arc::new(CachedNode::new(record)));
        drop(load);
        trace!(node = id.0, dense = record.dense, "cache.node.load");
        self.resized(EntityRef::Node(id), node.size_in_bytes());
        Ok(node)
    }

    fn node_hit(&self, id: NodeId) -> Option<Arc<CachedNode>> {
        let node = self.nodes.get(id)?;
        self.metrics.hit(EntityKind::Node);
        if let Some(hook) = &self.hook {
            hook.on_access(EntityRef::Node(id));
        }
        Some(node)
    }

    /// Returns the node only if it is cached.
    pub fn node_if_cached(&self, id: NodeId) -> Option<Arc<CachedNode>> {
        self.nodes.get(id)
    }

    /// Returns the cached relationship, loading its light record on a miss.
    pub fn get_relationship(&self, id: RelId) -> Result<Arc<CachedRelationship>> {
        if let Some(rel) = self.relationship_hit(id) {
            return Ok(rel);
        }
        let load = self.load_locks.lock(&EntityRef::Relationship(id));
        if let Some(rel) = self.relationship_hit(id) {
            return Ok(rel);
        }
        self.metrics.miss(EntityKind::Relationship);
        let record = self
            .store
            .relationship(id)?
            .ok_or(CacheError::NotFound(EntityRef::Relationship(id)))?;
        let (rel, _) = self
            .relationships
            .get_or_insert(id, Arc::new(CachedRelationship::new(record)));
        drop(load);
        trace!(rel = id.0, "cache.relationship.load");
        self.resized(EntityRef::Relationship(id), rel.size_in_bytes());
        Ok(rel)
    }

    fn relationship_hit(&self, id: RelId) -> Option<Arc<CachedRelationship>> {
        let rel = self.relationships.get(id)?;
        self.metrics.hit(EntityKind::Relationship);
        if let Some(hook) = &self.hook {
            hook.on_access(EntityRef::Relationship(id));
        }
        Some(rel)
    }

    /// Returns the relationship only if it is cached.
    pub fn relationship_if_cached(&self, id: RelId) -> Option<Arc<CachedRelationship>> {
        self.relationships.get(id)
    }

    /// Graph-level property container.
    pub fn graph(&self) -> Arc<GraphProperties> {
        Arc::clone(&self.graph.read())
    }

    /// Committed properties of a node.
    pub fn node_properties(&self, id: NodeId) -> Result<Arc<PropertyArray>> {
        let node = self.get_node(id)?;
        let before = node.size_in_bytes();
        let props = node.properties(self.store.as_ref())?;
        self.resized_if_changed(EntityRef::Node(id), before, node.size_in_bytes());
        Ok(props)
    }

    /// Committed labels of a node, sorted.
    pub fn node_labels(&self, id: NodeId) -> Result<Arc<Vec<LabelId>>> {
        let node = self.get_node(id)?;
        let before = node.size_in_bytes();
        let labels = node.labels(self.store.as_ref())?;
        self.resized_if_changed(EntityRef::Node(id), before, node.size_in_bytes());
        Ok(labels)
    }

    /// Committed properties of a relationship.
    pub fn relationship_properties(&self, id: RelId) -> Result<Arc<PropertyArray>> {
        let rel = self.get_relationship(id)?;
        let before = rel.size_in_bytes();
        let props = rel.properties(self.store.as_ref())?;
        self.resized_if_changed(EntityRef::Relationship(id), before, rel.size_in_bytes());
        Ok(props)
    }

    /// Committed graph properties.
    pub fn graph_properties(&self) -> Result<Arc<PropertyArray>> {
        self.graph().properties(self.store.as_ref())
    }

    /// Loads the next chain batch of `node` for a query and caches the relationships it found.
    pub fn load_more(
        &self,
        node: &CachedNode,
        direction: Direction,
        types: &TypeSelector,
    ) -> Result<LoadStatus> {
        let (status, records) = match node.load_more(&self.loader, direction, types) {
            Ok(loaded) => loaded,
            Err(err) => {
                if matches!(err, CacheError::ConcurrentlyDeleted(_)) {
                    self.evict_stale(node);
                }
                return Err(err);
            }
        };
        if status.loaded() {
            self.metrics.chain_batch(records.len());
            self.cache_relationships(records);
            self.resized(EntityRef::Node(node.id()), node.size_in_bytes());
        }
        Ok(status)
    }

    /// Drops `node` if it is still the cached entry for its id, so a retry reads the current chains.
    fn evict_stale(&self, node: &CachedNode) {
        let id = node.id();
        let current = self.nodes.get(id);
        if current.is_some_and(|cached| std::ptr::eq(Arc::as_ptr(&cached), node))
            && self.evict(EntityRef::Node(id))
        {
            trace!(node = id.0, "cache.evict.stale_chain");
        }
    }

    fn cache_relationships(&self, records: Vec<RelationshipRecord>) {
        for record in records {
            if self.relationships.contains(record.id) {
                continue;
            }
            let (rel, inserted) = self
                .relationships
                .get_or_insert(record.id, Arc::new(CachedRelationship::new(record)));
            if inserted {
                self.resized(EntityRef::Relationship(record.id), rel.size_in_bytes());
            }
        }
    }

    /// Loads every remaining relationship of `node`.
    pub fn ensure_fully_loaded(&self, node: &CachedNode) -> Result<()> {
        while self.load_more(node, Direction::Both, &TypeSelector::All)? == LoadStatus::LoadedMore {}
        Ok(())
    }

    /// Walks the committed relationships of `node`, loading chains on demand.
    pub fn relationships(
        &self,
        node: Arc<CachedNode>,
        direction: Direction,
        types: TypeSelector,
    ) -> RelationshipIter<'_> {
        RelationshipIter::new(self, node, direction, types)
    }

    /// Committed degree of a node; loads the full chain first.
    pub fn degree(&self, id: NodeId, direction: Direction, types: &TypeSelector) -> Result<usize> {
        let node = self.get_node(id)?;
        self.ensure_fully_loaded(&node)?;
        Ok(node.cached_degree(direction, types))
    }

    /// Committed relationship types of a node; loads the full chain first.
    pub fn relationship_types(&self, id: NodeId) -> Result<Vec<TypeId>> {
        let node = self.get_node(id)?;
        self.ensure_fully_loaded(&node)?;
        Ok(node.relationship_types())
    }

    /// Calls `visit` with the counts of every relationship type of a node.
    pub fn visit_degrees<F>(&self, id: NodeId, mut visit: F) -> Result<()>
    where
        F: FnMut(TypeId, DegreeCounts),
    {
        let node = self.get_node(id)?;
        self.ensure_fully_loaded(&node)?;
        for set in node.rel_sets(&TypeSelector::All) {
            if set.is_empty() {
                continue;
            }
            visit(
                set.ty(),
                DegreeCounts {
                    outgoing: set.block(RelDirection::Outgoing).len(),
                    incoming: set.block(RelDirection::Incoming).len(),
                    loops: set.block(RelDirection::Loop).len(),
                },
            );
        }
        Ok(())
    }

    /// Drops an entity; the next access reloads it from the store.
    pub fn evict(&self, entity: EntityRef) -> bool {
        let removed = self.remove_entry(entity);
        if removed {
            self.metrics.evicted(false);
            trace!(%entity, "cache.evict");
        }
        removed
    }

    /// Drops a node whose chain layout changed.
    pub(crate) fn evict_for_layout(&self, id: NodeId) -> bool {
        let removed = self.remove_entry(EntityRef::Node(id));
        if removed {
            self.metrics.evicted(true);
            trace!(node = id.0, "cache.evict.layout");
        }
        removed
    }

    fn remove_entry(&self, entity: EntityRef) -> bool {
        let removed = match entity {
            EntityRef::Node(id) => self.nodes.remove(id).is_some(),
            EntityRef::Relationship(id) => self.relationships.remove(id).is_some(),
            EntityRef::Graph => {
                *self.graph.write() = Arc::new(GraphProperties::new());
                true
            }
        };
        if removed {
            if let Some(hook) = &self.hook {
                hook.on_evict(entity);
            }
        }
        removed
    }

    /// Drops every cached entity, telling the eviction hook about each one.
    pub fn clear(&self) {
        let nodes = self.nodes.drain();
        let relationships = self.relationships.drain();
        *self.graph.write() = Arc::new(GraphProperties::new());
        let Some(hook) = &self.hook else {
            return;
        };
        for id in nodes {
            hook.on_evict(EntityRef::Node(id));
        }
        for id in relationships {
            hook.on_evict(EntityRef::Relationship(id));
        }
        hook.on_evict(EntityRef::Graph);
    }

    /// Number of cached nodes.
    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of cached relationships.
    pub fn cached_relationships(&self) -> usize {
        self.relationships.len()
    }

    /// Reports the current footprint of `entity` to the eviction hook.
    pub(crate) fn resized(&self, entity: EntityRef, bytes: usize) {
        let Some(hook) = &self.hook else {
            return;
        };
        for victim in hook.on_resize(entity, bytes) {
            if self.remove_entry(victim) {
                self.metrics.evicted(false);
                trace!(entity = %victim, "cache.evict.policy");
            }
        }
    }

    fn resized_if_changed(&self, entity: EntityRef, before: usize, after: usize) {
        if before != after {
            self.resized(entity, after);
        }
    }
}
