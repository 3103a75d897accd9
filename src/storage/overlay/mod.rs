//! Per-transaction copy-on-write delta.
//!
//! A [`TransactionOverlay`] belongs to exactly one transaction and is never
//! shared between threads, so it needs no internal locking. Entries are
//! created the first time an entity is touched. Once an entity is marked
//! deleted every further mutation of it fails with
//! [`CacheError::AlreadyDeleted`].

pub mod merge;

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::primitives::concurrency::LockMode;
use crate::storage::cache::position::FirstRelationshipIds;
use crate::storage::cache::rel_ids::RelIdSet;
use crate::storage::props::PropertyArray;
use crate::storage::types::{Direction, PropValue, RelDirection, RelationshipRecord, TypeSelector};
use crate::types::{CacheError, EntityRef, LabelId, NodeId, PropKeyId, RelId, Result, TxId, TypeId};

pub use merge::{CommitReport, OverlayMerger};

/// Property changes and deletion marker of one entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityDelta {
    deleted: bool,
    prop_add: BTreeMap<PropKeyId, PropValue>,
    prop_remove: BTreeSet<PropKeyId>,
}

impl EntityDelta {
    /// Whether the entity was deleted by the transaction.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Properties set by the transaction.
    pub fn added_properties(&self) -> &BTreeMap<PropKeyId, PropValue> {
        &self.prop_add
    }

    /// Properties removed by the transaction.
    pub fn removed_properties(&self) -> &BTreeSet<PropKeyId> {
        &self.prop_remove
    }

    /// Whether any property changed.
    pub fn has_property_changes(&self) -> bool {
        !self.prop_add.is_empty() || !self.prop_remove.is_empty()
    }

    fn set_property(&mut self, key: PropKeyId, value: PropValue) {
        self.prop_remove.remove(&key);
        self.prop_add.insert(key, value);
    }

    fn remove_property(&mut self, key: PropKeyId) {
        self.prop_add.remove(&key);
        self.prop_remove.insert(key);
    }

    /// Transaction-local value of `key`: `Some(None)` when removed, `None` when untouched.
    pub fn property(&self, key: PropKeyId) -> Option<Option<&PropValue>> {
        if let Some(value) = self.prop_add.get(&key) {
            return Some(Some(value));
        }
        if self.prop_remove.contains(&key) {
            return Some(None);
        }
        None
    }

    /// `base` with this delta's property changes applied.
    pub fn apply_to(&self, base: &PropertyArray) -> PropertyArray {
        base.with_changes(&self.prop_add, &self.prop_remove)
    }
}

/// Changes of one node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeDelta {
    entity: EntityDelta,
    created: bool,
    rel_add: BTreeMap<TypeId, RelIdSet>,
    rel_remove: BTreeMap<TypeId, FxHashSet<RelId>>,
    first_ids: FirstRelationshipIds,
    label_add: BTreeSet<LabelId>,
    label_remove: BTreeSet<LabelId>,
}

impl NodeDelta {
    /// Property changes of the entity.
    pub fn entity(&self) -> &EntityDelta {
        &self.entity
    }

    /// Whether the node was created by the transaction.
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Relationships added per type.
    pub fn relationship_additions(&self) -> Option<&BTreeMap<TypeId, RelIdSet>> {
        (!self.rel_add.is_empty()).then_some(&self.rel_add)
    }

    /// Relationships removed per type.
    pub fn relationship_removals(&self) -> Option<&BTreeMap<TypeId, FxHashSet<RelId>>> {
        (!self.rel_remove.is_empty()).then_some(&self.rel_remove)
    }

    /// Chain heads produced by relationships created on the node.
    pub fn first_ids(&self) -> &FirstRelationshipIds {
        &self.first_ids
    }

    /// Labels added by the transaction.
    pub fn added_labels(&self) -> &BTreeSet<LabelId> {
        &self.label_add
    }

    /// Labels removed by the transaction.
    pub fn removed_labels(&self) -> &BTreeSet<LabelId> {
        &self.label_remove
    }

    /// Whether any label changed.
    pub fn has_label_changes(&self) -> bool {
        !self.label_add.is_empty() || !self.label_remove.is_empty()
    }

    /// Every relationship id removed from the node.
    pub fn removed_ids(&self) -> FxHashSet<RelId> {
        self.rel_remove.values().flatten().copied().collect()
    }

    /// Relationships added on the node that a query over `direction` and `types` sees.
    pub fn added_ids(&self, direction: Direction, types: &TypeSelector) -> Vec<RelId> {
        let mut ids = Vec::new();
        for (ty, set) in &self.rel_add {
            if !types.includes(*ty) {
                continue;
            }
            for dir in direction.chain_directions() {
                ids.extend_from_slice(set.block(*dir));
            }
        }
        ids
    }

    /// Recomputes the chain heads after a created relationship was dropped again.
    fn rebuild_first_ids(&mut self) {
        let mut created: Vec<(RelId, TypeId, RelDirection)> = Vec::new();
        for (ty, set) in &self.rel_add {
            for dir in RelDirection::LOAD_ORDER {
                created.extend(set.block(dir).iter().map(|id| (*id, *ty, dir)));
            }
        }
        created.sort_unstable_by_key(|(id, _, _)| *id);
        self.first_ids = FirstRelationshipIds::default();
        for (id, ty, dir) in created {
            self.first_ids.created(ty, dir, id);
        }
    }
}

/// Changes of one relationship.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelationshipDelta {
    entity: EntityDelta,
    record: Option<RelationshipRecord>,
    created: bool,
}

impl RelationshipDelta {
    /// Property changes of the entity.
    pub fn entity(&self) -> &EntityDelta {
        &self.entity
    }

    /// Whether the relationship was created by the transaction.
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Light record, known for created and deleted relationships.
    pub fn record(&self) -> Option<RelationshipRecord> {
        self.record
    }
}

/// Copy-on-write delta of one transaction.
#[derive(Debug)]
pub struct TransactionOverlay {
    tx: TxId,
    nodes: FxHashMap<NodeId, NodeDelta>,
    relationships: FxHashMap<RelId, RelationshipDelta>,
    graph: Option<EntityDelta>,
    locks: Vec<(EntityRef, LockMode)>,
}

impl TransactionOverlay {
    /// Opens an empty overlay for `tx`.
    pub fn new(tx: TxId) -> Self {
        Self {
            tx,
            nodes: FxHashMap::default(),
            relationships: FxHashMap::default(),
            graph: None,
            locks: Vec::new(),
        }
    }

    /// Owning transaction.
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Whether the overlay holds no change.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty() && self.graph.is_none()
    }

    /// Changes recorded for a node.
    pub fn node_delta(&self, id: NodeId) -> Option<&NodeDelta> {
        self.nodes.get(&id)
    }

    /// Changes recorded for a relationship.
    pub fn relationship_delta(&self, id: RelId) -> Option<&RelationshipDelta> {
        self.relationships.get(&id)
    }

    /// Changes to graph properties.
    pub fn graph_delta(&self) -> Option<&EntityDelta> {
        self.graph.as_ref()
    }

    /// Every touched node.
    pub fn node_deltas(&self) -> impl Iterator<Item = (NodeId, &NodeDelta)> + '_ {
        self.nodes.iter().map(|(id, delta)| (*id, delta))
    }

    /// Every touched relationship.
    pub fn relationship_deltas(&self) -> impl Iterator<Item = (RelId, &RelationshipDelta)> + '_ {
        self.relationships.iter().map(|(id, delta)| (*id, delta))
    }

    /// Property delta of any entity.
    pub fn entity_delta(&self, entity: EntityRef) -> Option<&EntityDelta> {
        match entity {
            EntityRef::Node(id) => self.nodes.get(&id).map(|d| &d.entity),
            EntityRef::Relationship(id) => self.relationships.get(&id).map(|d| &d.entity),
            EntityRef::Graph => self.graph.as_ref(),
        }
    }

    /// Whether `entity` was deleted by the transaction.
    pub fn is_deleted(&self, entity: EntityRef) -> bool {
        self.entity_delta(entity).is_some_and(EntityDelta::is_deleted)
    }

    /// Whether `entity` was created by the transaction.
    pub fn is_created(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.nodes.get(&id).is_some_and(|d| d.created),
            EntityRef::Relationship(id) => self.relationships.get(&id).is_some_and(|d| d.created),
            EntityRef::Graph => false,
        }
    }

    fn live_node(&mut self, id: NodeId) -> Result<&mut NodeDelta> {
        let delta = self.nodes.entry(id).or_default();
        if delta.entity.deleted {
            return Err(CacheError::AlreadyDeleted(EntityRef::Node(id)));
        }
        Ok(delta)
    }

    fn live_entity(&mut self, entity: EntityRef) -> Result<&mut EntityDelta> {
        let delta = match entity {
            EntityRef::Node(id) => &mut self.nodes.entry(id).or_default().entity,
            EntityRef::Relationship(id) => &mut self.relationships.entry(id).or_default().entity,
            EntityRef::Graph => self.graph.get_or_insert_with(EntityDelta::default),
        };
        if delta.deleted {
            return Err(CacheError::AlreadyDeleted(entity));
        }
        Ok(delta)
    }

    /// Marks a node as created by the transaction.
    pub fn node_created(&mut self, id: NodeId) -> Result<()> {
        self.live_node(id)?.created = true;
        Ok(())
    }

    /// Records that `rel` now hangs off `node` as `(ty, dir)`.
    pub fn add_relationship(
        &mut self,
        node: NodeId,
        ty: TypeId,
        dir: RelDirection,
        rel: RelId,
    ) -> Result<()> {
        let delta = self.live_node(node)?;
        delta
            .rel_add
            .entry(ty)
            .or_insert_with(|| RelIdSet::new(ty))
            .add(rel, dir);
        Ok(())
    }

    /// Records that `rel` no longer hangs off `node`.
    ///
    /// A relationship added earlier in the same transaction is simply dropped
    /// from the additions.
    pub fn remove_relationship(
        &mut self,
        node: NodeId,
        ty: TypeId,
        _dir: RelDirection,
        rel: RelId,
    ) -> Result<()> {
        let delta = self.live_node(node)?;
        if let Some(added) = delta.rel_add.get_mut(&ty) {
            if added.contains(rel) {
                let removed: FxHashSet<RelId> = [rel].into_iter().collect();
                added.retain_absent(&removed);
                if added.is_empty() {
                    delta.rel_add.remove(&ty);
                }
                delta.rebuild_first_ids();
                return Ok(());
            }
        }
        delta.rel_remove.entry(ty).or_default().insert(rel);
        Ok(())
    }

    /// Records a relationship created by the transaction on both endpoints.
    pub fn relationship_created(&mut self, record: RelationshipRecord) -> Result<()> {
        for node in endpoints(&record) {
            self.live_node(node)?;
        }
        for node in endpoints(&record) {
            let dir = record.direction_from(node);
            self.add_relationship(node, record.ty, dir, record.id)?;
            self.live_node(node)?.first_ids.created(record.ty, dir, record.id);
        }
        let delta = self.relationships.entry(record.id).or_default();
        delta.created = true;
        delta.record = Some(record);
        Ok(())
    }

    /// Deletes a relationship and detaches it from both endpoints.
    pub fn relationship_deleted(&mut self, record: RelationshipRecord) -> Result<()> {
        self.live_entity(EntityRef::Relationship(record.id))?;
        for node in endpoints(&record) {
            self.live_node(node)?;
        }
        for node in endpoints(&record) {
            let dir = record.direction_from(node);
            self.remove_relationship(node, record.ty, dir, record.id)?;
        }
        let delta = self.relationships.entry(record.id).or_default();
        delta.record = Some(record);
        delta.entity.deleted = true;
        Ok(())
    }

    /// Sets a property on `entity`.
    pub fn add_property(&mut self, entity: EntityRef, key: PropKeyId, value: PropValue) -> Result<()> {
        self.live_entity(entity)?.set_property(key, value);
        Ok(())
    }

    /// Removes a property from `entity`.
    pub fn remove_property(&mut self, entity: EntityRef, key: PropKeyId) -> Result<()> {
        self.live_entity(entity)?.remove_property(key);
        Ok(())
    }

    /// Adds a label to a node.
    pub fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        let delta = self.live_node(node)?;
        delta.label_remove.remove(&label);
        delta.label_add.insert(label);
        Ok(())
    }

    /// Removes a label from a node.
    pub fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        let delta = self.live_node(node)?;
        delta.label_add.remove(&label);
        delta.label_remove.insert(label);
        Ok(())
    }

    /// Marks `entity` deleted and drops its pending property changes.
    pub fn delete(&mut self, entity: EntityRef) -> Result<()> {
        if matches!(entity, EntityRef::Graph) {
            return Err(CacheError::Invalid("the graph entity cannot be deleted"));
        }
        let delta = self.live_entity(entity)?;
        delta.deleted = true;
        delta.prop_add.clear();
        delta.prop_remove.clear();
        Ok(())
    }

    /// Remembers a lock taken on behalf of the transaction.
    pub fn record_lock(&mut self, resource: EntityRef, mode: LockMode) {
        self.locks.push((resource, mode));
    }

    /// Locks taken so far, in acquisition order.
    pub fn locks(&self) -> &[(EntityRef, LockMode)] {
        &self.locks
    }

    /// Hands over the recorded locks for release.
    pub fn take_locks(&mut self) -> Vec<(EntityRef, LockMode)> {
        std::mem::take(&mut self.locks)
    }
}

fn endpoints(record: &RelationshipRecord) -> impl Iterator<Item = NodeId> {
    let end = (record.end != record.start).then_some(record.end);
    std::iter::once(record.start).chain(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(id: u64, start: u64, end: u64, ty: u32) -> RelationshipRecord {
        RelationshipRecord {
            id: RelId(id),
            start: NodeId(start),
            end: NodeId(end),
            ty: TypeId(ty),
        }
    }

    #[test]
    fn mutations_after_delete_are_rejected() -> Result<()> {
        let mut overlay = TransactionOverlay::new(TxId(1));
        let node = EntityRef::Node(NodeId(4));
        overlay.add_property(node, PropKeyId(1), PropValue::Int(1))?;
        overlay.delete(node)?;
        assert!(overlay.is_deleted(node));
        assert!(overlay.entity_delta(node).is_some_and(|d| !d.has_property_changes()));
        let err = overlay
            .add_property(node, PropKeyId(1), PropValue::Int(2))
            .unwrap_err();
        assert!(matches!(err, CacheError::AlreadyDeleted(EntityRef::Node(NodeId(4)))));
        assert!(overlay.add_relationship(NodeId(4), TypeId(0), RelDirection::Outgoing, RelId(1)).is_err());
        assert!(overlay.delete(node).is_err());
        Ok(())
    }

    #[test]
    fn created_relationships_set_chain_heads_on_both_ends() -> Result<()> {
        let mut overlay = TransactionOverlay::new(TxId(1));
        overlay.relationship_created(rel(10, 1, 2, 7))?;
        overlay.relationship_created(rel(11, 1, 3, 8))?;
        let start = overlay.node_delta(NodeId(1)).unwrap();
        assert_eq!(start.first_ids().chain_head(), Some(RelId(11)));
        assert_eq!(
            start.first_ids().group_head(TypeId(7), RelDirection::Outgoing),
            Some(RelId(10))
        );
        let end = overlay.node_delta(NodeId(2)).unwrap();
        assert_eq!(end.added_ids(Direction::Incoming, &TypeSelector::All), vec![RelId(10)]);
        assert!(end.added_ids(Direction::Outgoing, &TypeSelector::All).is_empty());
        Ok(())
    }

    #[test]
    fn loops_are_recorded_once() -> Result<()> {
        let mut overlay = TransactionOverlay::new(TxId(1));
        overlay.relationship_created(rel(5, 9, 9, 1))?;
        let delta = overlay.node_delta(NodeId(9)).unwrap();
        assert_eq!(delta.added_ids(Direction::Both, &TypeSelector::All), vec![RelId(5)]);
        assert_eq!(delta.added_ids(Direction::Outgoing, &TypeSelector::All), vec![RelId(5)]);
        Ok(())
    }

    #[test]
    fn removing_a_fresh_relationship_cancels_the_addition() -> Result<()> {
        let mut overlay = TransactionOverlay::new(TxId(1));
        overlay.relationship_created(rel(10, 1, 2, 7))?;
        overlay.relationship_deleted(rel(10, 1, 2, 7))?;
        let start = overlay.node_delta(NodeId(1)).unwrap();
        assert!(start.relationship_additions().is_none());
        assert!(start.first_ids().is_empty());
        assert!(start.relationship_removals().is_none());
        assert!(overlay.is_deleted(EntityRef::Relationship(RelId(10))));
        Ok(())
    }

    #[test]
    fn property_view_tracks_latest_change() -> Result<()> {
        let mut overlay = TransactionOverlay::new(TxId(1));
        let graph = EntityRef::Graph;
        overlay.add_property(graph, PropKeyId(2), PropValue::from("x"))?;
        overlay.remove_property(graph, PropKeyId(2))?;
        let delta = overlay.graph_delta().unwrap();
        assert_eq!(delta.property(PropKeyId(2)), Some(None));
        assert_eq!(delta.property(PropKeyId(3)), None);
        assert!(overlay.delete(graph).is_err());
        Ok(())
    }

    #[test]
    fn locks_are_handed_over_once() {
        let mut overlay = TransactionOverlay::new(TxId(3));
        overlay.record_lock(EntityRef::Node(NodeId(1)), LockMode::Write);
        assert_eq!(overlay.locks().len(), 1);
        assert_eq!(overlay.take_locks().len(), 1);
        assert!(overlay.take_locks().is_empty());
    }
}
