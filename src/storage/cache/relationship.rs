use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::storage::cache::cell::LazyCell;
use crate::storage::props::PropertyArray;
use crate::storage::store::EntityStore;
use crate::storage::types::{PropValue, RelationshipRecord};
use crate::types::{NodeId, PropKeyId, RelId, Result, TypeId};

/// Cached relationship. Endpoints and type are fixed at construction.
#[derive(Debug)]
pub struct CachedRelationship {
    record: RelationshipRecord,
    properties: LazyCell<PropertyArray>,
    gate: Mutex<()>,
}

impl CachedRelationship {
    /// Builds an entry from the light record.
    pub fn new(record: RelationshipRecord) -> Self {
        Self {
            record,
            properties: LazyCell::new(),
            gate: Mutex::new(()),
        }
    }

    /// Relationship id.
    pub fn id(&self) -> RelId {
        self.record.id
    }

    /// Start node.
    pub fn start(&self) -> NodeId {
        self.record.start
    }

    /// End node.
    pub fn end(&self) -> NodeId {
        self.record.end
    }

    /// Relationship type.
    pub fn ty(&self) -> TypeId {
        self.record.ty
    }

    /// Copy of the store record.
    pub fn record(&self) -> RelationshipRecord {
        self.record
    }

    /// The endpoint that is not `node`; `node` itself for loops.
    pub fn other_node(&self, node: NodeId) -> Option<NodeId> {
        if self.record.start == node {
            Some(self.record.end)
        } else if self.record.end == node {
            Some(self.record.start)
        } else {
            None
        }
    }

    /// Property array, loaded on first use.
    pub fn properties(&self, store: &dyn EntityStore) -> Result<Arc<PropertyArray>> {
        self.properties.get_or_try_load(&self.gate, || {
            trace!(rel = self.record.id.0, "cache.relationship.properties.load");
            PropertyArray::from_records(store.relationship_properties(self.record.id)?)
        })
    }

    /// Applies committed property changes if properties are loaded.
    pub fn commit_properties(
        &self,
        add: &BTreeMap<PropKeyId, PropValue>,
        remove: &BTreeSet<PropKeyId>,
    ) {
        let _gate = self.gate.lock();
        self.properties.update(|current| current.with_changes(add, remove));
    }

    /// Bytes retained by the entry.
    pub fn size_in_bytes(&self) -> usize {
        size_of::<Self>()
            + self
                .properties
                .get()
                .map_or(0, |props| props.size_in_bytes())
    }
}

/// Graph-level property container.
#[derive(Debug, Default)]
pub struct GraphProperties {
    properties: LazyCell<PropertyArray>,
    gate: Mutex<()>,
}

impl GraphProperties {
    /// Container with nothing loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Property array, loaded on first use.
    pub fn properties(&self, store: &dyn EntityStore) -> Result<Arc<PropertyArray>> {
        self.properties.get_or_try_load(&self.gate, || {
            trace!("cache.graph.properties.load");
            PropertyArray::from_records(store.graph_properties()?)
        })
    }

    /// Applies committed property changes if properties are loaded.
    pub fn commit_properties(
        &self,
        add: &BTreeMap<PropKeyId, PropValue>,
        remove: &BTreeSet<PropKeyId>,
    ) {
        let _gate = self.gate.lock();
        self.properties.update(|current| current.with_changes(add, remove));
    }

    /// Bytes retained by the container.
    pub fn size_in_bytes(&self) -> usize {
        size_of::<Self>()
            + self
                .properties
                .get()
                .map_or(0, |props| props.size_in_bytes())
    }
}
