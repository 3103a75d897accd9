//! In-memory record store.
//!
//! Implements both sides of the store contract with plain maps: relationship
//! chains are id vectors with the newest relationship at the head, and nodes
//! switch to per-(type, direction) chains once they reach the dense
//! threshold. Used by tests, benchmarks and embedders without a disk store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::storage::overlay::TransactionOverlay;
use crate::storage::store::{
    AppliedChanges, ChainHeads, ChainHole, ChainKey, ChainPage, EntityStore, StoreError,
    StoreResult, StoreWriter,
};
use crate::storage::types::{NodeRecord, PropValue, PropertyRecords, RelationshipRecord};
use crate::types::{EntityRef, LabelId, NodeId, PropKeyId, RelId};

#[derive(Debug, Default)]
struct StoredNode {
    dense: bool,
    chains: BTreeMap<ChainKey, Vec<RelId>>,
    properties: BTreeMap<PropKeyId, PropValue>,
    labels: BTreeSet<LabelId>,
}

impl StoredNode {
    fn degree(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    fn chain_key(&self, record: &RelationshipRecord, node: NodeId) -> ChainKey {
        if self.dense {
            ChainKey::Dense(record.ty, record.direction_from(node))
        } else {
            ChainKey::Sparse
        }
    }
}

#[derive(Debug)]
struct StoredRelationship {
    record: RelationshipRecord,
    properties: BTreeMap<PropKeyId, PropValue>,
}

#[derive(Debug, Default)]
struct Records {
    nodes: FxHashMap<NodeId, StoredNode>,
    relationships: FxHashMap<RelId, StoredRelationship>,
    graph: BTreeMap<PropKeyId, PropValue>,
}

impl Records {
    fn insert_relationship(&mut self, record: RelationshipRecord, threshold: usize) -> StoreResult<()> {
        for node in endpoints(&record) {
            if !self.nodes.contains_key(&node) {
                return Err(StoreError::InvalidRecord(node.0));
            }
        }
        for node in endpoints(&record) {
            if let Some(stored) = self.nodes.get_mut(&node) {
                let key = stored.chain_key(&record, node);
                stored.chains.entry(key).or_default().insert(0, record.id);
            }
        }
        self.relationships.insert(
            record.id,
            StoredRelationship {
                record,
                properties: BTreeMap::new(),
            },
        );
        for node in endpoints(&record) {
            self.maybe_make_dense(node, threshold);
        }
        Ok(())
    }

    fn maybe_make_dense(&mut self, id: NodeId, threshold: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.dense || node.degree() < threshold {
            return;
        }
        let sparse = node.chains.get(&ChainKey::Sparse).cloned().unwrap_or_default();
        let mut groups: BTreeMap<ChainKey, Vec<RelId>> = BTreeMap::new();
        for rel in sparse {
            if let Some(stored) = self.relationships.get(&rel) {
                let record = stored.record;
                groups
                    .entry(ChainKey::Dense(record.ty, record.direction_from(id)))
                    .or_default()
                    .push(rel);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.dense = true;
            node.chains = groups;
            debug!(node = id.0, degree = node.degree(), "store.node.dense");
        }
    }

    /// Unlinks a relationship from both endpoint chains and reports the holes it left.
    fn remove_relationship(
        &mut self,
        id: RelId,
    ) -> StoreResult<(RelationshipRecord, Vec<(NodeId, ChainHole)>)> {
        let stored = self
            .relationships
            .remove(&id)
            .ok_or(StoreError::InvalidRecord(id.0))?;
        let record = stored.record;
        let mut holes = Vec::with_capacity(2);
        for node in endpoints(&record) {
            if let Some(stored) = self.nodes.get_mut(&node) {
                let key = stored.chain_key(&record, node);
                if let Some(chain) = stored.chains.get_mut(&key) {
                    if let Some(at) = chain.iter().position(|rel| *rel == id) {
                        let next = chain.get(at + 1).map(|rel| rel.0);
                        chain.remove(at);
                        holes.push((node, ChainHole { key, removed: id.0, next }));
                    }
                    if chain.is_empty() {
                        stored.chains.remove(&key);
                    }
                }
            }
        }
        Ok((record, holes))
    }

    fn properties_mut(&mut self, entity: EntityRef) -> StoreResult<&mut BTreeMap<PropKeyId, PropValue>> {
        match entity {
            EntityRef::Node(id) => self
                .nodes
                .get_mut(&id)
                .map(|node| &mut node.properties)
                .ok_or(StoreError::InvalidRecord(id.0)),
            EntityRef::Relationship(id) => self
                .relationships
                .get_mut(&id)
                .map(|rel| &mut rel.properties)
                .ok_or(StoreError::InvalidRecord(id.0)),
            EntityRef::Graph => Ok(&mut self.graph),
        }
    }
}

fn endpoints(record: &RelationshipRecord) -> impl Iterator<Item = NodeId> {
    let end = (record.end != record.start).then_some(record.end);
    std::iter::once(record.start).chain(end)
}

/// Map-backed [`EntityStore`] and [`StoreWriter`].
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<Records>,
    dense_threshold: usize,
    failing_scans: AtomicUsize,
    failing_applies: AtomicUsize,
    scans: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store; nodes turn dense at `dense_threshold` relationships.
    pub fn new(dense_threshold: usize) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            dense_threshold: dense_threshold.max(1),
            failing_scans: AtomicUsize::new(0),
            failing_applies: AtomicUsize::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Adds a node with no relationships. Replaces nothing if the id is taken.
    pub fn insert_node(&self, id: NodeId, dense: bool) {
        self.records.write().nodes.entry(id).or_insert_with(|| StoredNode {
            dense,
            ..StoredNode::default()
        });
    }

    /// Writes a relationship directly, as another writer would.
    pub fn insert_relationship(&self, record: RelationshipRecord) -> StoreResult<()> {
        self.records
            .write()
            .insert_relationship(record, self.dense_threshold)
    }

    /// Deletes a relationship directly, as another writer would.
    pub fn delete_relationship(&self, id: RelId) -> StoreResult<RelationshipRecord> {
        let (record, _) = self.records.write().remove_relationship(id)?;
        Ok(record)
    }

    /// Sets a node property directly.
    pub fn set_node_property(&self, id: NodeId, key: PropKeyId, value: PropValue) -> StoreResult<()> {
        self.records
            .write()
            .properties_mut(EntityRef::Node(id))?
            .insert(key, value);
        Ok(())
    }

    /// Sets a relationship property directly.
    pub fn set_relationship_property(
        &self,
        id: RelId,
        key: PropKeyId,
        value: PropValue,
    ) -> StoreResult<()> {
        self.records
            .write()
            .properties_mut(EntityRef::Relationship(id))?
            .insert(key, value);
        Ok(())
    }

    /// Sets a graph property directly.
    pub fn set_graph_property(&self, key: PropKeyId, value: PropValue) {
        self.records.write().graph.insert(key, value);
    }

    /// Adds a label directly.
    pub fn add_node_label(&self, id: NodeId, label: LabelId) -> StoreResult<()> {
        let mut records = self.records.write();
        let node = records
            .nodes
            .get_mut(&id)
            .ok_or(StoreError::InvalidRecord(id.0))?;
        node.labels.insert(label);
        Ok(())
    }

    /// Whether a node is stored with dense chains.
    pub fn is_dense(&self, id: NodeId) -> Option<bool> {
        self.records.read().nodes.get(&id).map(|node| node.dense)
    }

    /// Relationship ids of one chain in chain order.
    pub fn chain(&self, id: NodeId, key: ChainKey) -> Vec<RelId> {
        self.records
            .read()
            .nodes
            .get(&id)
            .and_then(|node| node.chains.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Makes the next `count` chain scans fail as if their start record was deleted.
    pub fn fail_next_scans(&self, count: usize) {
        self.failing_scans.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` overlay writes fail.
    pub fn fail_next_applies(&self, count: usize) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    /// Chain scans served so far.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn validate(records: &Records, overlay: &TransactionOverlay) -> StoreResult<()> {
        let created: FxHashSet<NodeId> = overlay
            .node_deltas()
            .filter(|(_, delta)| delta.is_created() && !delta.entity().is_deleted())
            .map(|(id, _)| id)
            .collect();
        let deleted_rels: FxHashSet<RelId> = overlay
            .relationship_deltas()
            .filter(|(_, delta)| delta.entity().is_deleted())
            .map(|(id, _)| id)
            .collect();
        for (id, delta) in overlay.relationship_deltas() {
            if delta.is_created() {
                if delta.entity().is_deleted() {
                    continue;
                }
                let record = delta.record().ok_or(StoreError::InvalidRecord(id.0))?;
                for node in endpoints(&record) {
                    if !created.contains(&node) && !records.nodes.contains_key(&node) {
                        return Err(StoreError::InvalidRecord(node.0));
                    }
                }
            } else if !records.relationships.contains_key(&id) {
                return Err(StoreError::InvalidRecord(id.0));
            }
        }
        for (id, delta) in overlay.node_deltas() {
            if delta.is_created() {
                continue;
            }
            let Some(node) = records.nodes.get(&id) else {
                return Err(StoreError::InvalidRecord(id.0));
            };
            if delta.entity().is_deleted()
                && node.chains.values().flatten().any(|rel| !deleted_rels.contains(rel))
            {
                return Err(StoreError::Unavailable("node still has relationships"));
            }
        }
        Ok(())
    }
}

impl EntityStore for MemoryStore {
    fn node(&self, id: NodeId) -> StoreResult<Option<NodeRecord>> {
        Ok(self
            .records
            .read()
            .nodes
            .get(&id)
            .map(|node| NodeRecord { id, dense: node.dense }))
    }

    fn relationship(&self, id: RelId) -> StoreResult<Option<RelationshipRecord>> {
        Ok(self.records.read().relationships.get(&id).map(|rel| rel.record))
    }

    fn node_properties(&self, id: NodeId) -> StoreResult<PropertyRecords> {
        let records = self.records.read();
        let node = records.nodes.get(&id).ok_or(StoreError::InvalidRecord(id.0))?;
        Ok(node.properties.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn relationship_properties(&self, id: RelId) -> StoreResult<PropertyRecords> {
        let records = self.records.read();
        let rel = records
            .relationships
            .get(&id)
            .ok_or(StoreError::InvalidRecord(id.0))?;
        Ok(rel.properties.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn graph_properties(&self) -> StoreResult<PropertyRecords> {
        let records = self.records.read();
        Ok(records.graph.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn node_labels(&self, id: NodeId) -> StoreResult<Vec<LabelId>> {
        let records = self.records.read();
        let node = records.nodes.get(&id).ok_or(StoreError::InvalidRecord(id.0))?;
        Ok(node.labels.iter().copied().collect())
    }

    fn chain_heads(&self, id: NodeId) -> StoreResult<ChainHeads> {
        let records = self.records.read();
        let node = records.nodes.get(&id).ok_or(StoreError::InvalidRecord(id.0))?;
        if !node.dense {
            let head = node
                .chains
                .get(&ChainKey::Sparse)
                .and_then(|chain| chain.first())
                .map(|rel| rel.0);
            return Ok(ChainHeads::Sparse(head));
        }
        let groups = node
            .chains
            .iter()
            .filter_map(|(key, chain)| match (key, chain.first()) {
                (ChainKey::Dense(ty, dir), Some(head)) => Some(((*ty, *dir), head.0)),
                _ => None,
            })
            .collect();
        Ok(ChainHeads::Dense(groups))
    }

    fn scan_chain(
        &self,
        id: NodeId,
        key: ChainKey,
        from: u64,
        limit: usize,
    ) -> StoreResult<ChainPage> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.failing_scans) {
            trace!(node = id.0, from, "store.scan.injected_failure");
            return Err(StoreError::InvalidRecord(from));
        }
        let records = self.records.read();
        let chain = records
            .nodes
            .get(&id)
            .and_then(|node| node.chains.get(&key))
            .ok_or(StoreError::InvalidRecord(from))?;
        let start = chain
            .iter()
            .position(|rel| rel.0 == from)
            .ok_or(StoreError::InvalidRecord(from))?;
        let end = start.saturating_add(limit).min(chain.len());
        let mut relationships = Vec::with_capacity(end - start);
        for rel in &chain[start..end] {
            let stored = records
                .relationships
                .get(rel)
                .ok_or(StoreError::InvalidRecord(rel.0))?;
            relationships.push(stored.record);
        }
        Ok(ChainPage {
            relationships,
            next: chain.get(end).map(|rel| rel.0),
        })
    }
}

impl StoreWriter for MemoryStore {
    fn apply(&self, overlay: &TransactionOverlay) -> StoreResult<AppliedChanges> {
        if Self::take_failure(&self.failing_applies) {
            return Err(StoreError::Unavailable("injected write failure"));
        }
        let mut records = self.records.write();
        Self::validate(&records, overlay)?;
        let dense_before: FxHashMap<NodeId, bool> = overlay
            .node_deltas()
            .filter_map(|(id, _)| records.nodes.get(&id).map(|node| (id, node.dense)))
            .collect();

        let mut created_nodes: Vec<NodeId> = overlay
            .node_deltas()
            .filter(|(_, delta)| delta.is_created() && !delta.entity().is_deleted())
            .map(|(id, _)| id)
            .collect();
        created_nodes.sort_unstable();
        for id in created_nodes {
            records.nodes.entry(id).or_default();
        }

        let mut deleted = Vec::new();
        let mut created = Vec::new();
        for (id, delta) in overlay.relationship_deltas() {
            match (delta.is_created(), delta.entity().is_deleted()) {
                (true, false) => created.extend(delta.record()),
                (false, true) => deleted.push(id),
                _ => {}
            }
        }
        deleted.sort_unstable();
        let mut chain_holes: FxHashMap<NodeId, Vec<ChainHole>> = FxHashMap::default();
        for id in deleted {
            let (_, holes) = records.remove_relationship(id)?;
            for (node, hole) in holes {
                chain_holes.entry(node).or_default().push(hole);
            }
        }
        created.sort_unstable_by_key(|record| record.id);
        for record in created {
            records.insert_relationship(record, self.dense_threshold)?;
        }

        for (id, delta) in overlay.relationship_deltas() {
            if delta.entity().is_deleted() || !delta.entity().has_property_changes() {
                continue;
            }
            apply_properties(records.properties_mut(EntityRef::Relationship(id))?, delta.entity());
        }
        let mut removed_nodes = Vec::new();
        for (id, delta) in overlay.node_deltas() {
            if delta.entity().is_deleted() {
                removed_nodes.push(id);
                continue;
            }
            if delta.entity().has_property_changes() {
                apply_properties(records.properties_mut(EntityRef::Node(id))?, delta.entity());
            }
            if delta.has_label_changes() {
                if let Some(node) = records.nodes.get_mut(&id) {
                    for label in delta.removed_labels() {
                        node.labels.remove(label);
                    }
                    node.labels.extend(delta.added_labels().iter().copied());
                }
            }
        }
        for id in removed_nodes {
            records.nodes.remove(&id);
        }
        if let Some(delta) = overlay.graph_delta() {
            apply_properties(&mut records.graph, delta);
        }

        let layout_changes = dense_before
            .into_iter()
            .filter_map(|(id, before)| {
                let after = records.nodes.get(&id)?.dense;
                (after != before).then_some((id, after))
            })
            .collect();
        debug!(tx = overlay.tx().0, "store.apply");
        Ok(AppliedChanges {
            layout_changes,
            chain_holes,
        })
    }
}

fn apply_properties(
    target: &mut BTreeMap<PropKeyId, PropValue>,
    delta: &crate::storage::overlay::EntityDelta,
) {
    for key in delta.removed_properties() {
        target.remove(key);
    }
    for (key, value) in delta.added_properties() {
        target.insert(*key, value.clone());
    }
}
