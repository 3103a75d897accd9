//! Kernel facade wiring the cache, overlays, locks and token holders together.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::primitives::concurrency::{LocalLockManager, LockManager, LockMode};
use crate::primitives::ids::{IdGenerator, IdKind, SequentialIds};
use crate::storage::cache::{
    CachedNode, CachedRelationship, DegreeCounts, EntityCache, LruPolicy, PropertyIter,
    RelationshipIter,
};
use crate::storage::catalog::{IsolatedTokenCreator, MemoryTokenStore, TokenHolder, TokenStore};
use crate::storage::memstore::MemoryStore;
use crate::storage::options::CacheOptions;
use crate::storage::overlay::{CommitReport, OverlayMerger, TransactionOverlay};
use crate::storage::props::PropertyArray;
use crate::storage::store::{EntityStore, StoreWriter};
use crate::storage::types::{Direction, PropValue, RelationshipRecord, TypeSelector};
use crate::types::{
    CacheError, EntityRef, LabelId, NodeId, PropKeyId, RelId, Result, TokenKind, TxId, TypeId,
};

/// A node as seen by one transaction.
#[derive(Clone, Debug)]
pub enum NodeRef {
    /// Committed node, served from the shared cache.
    Committed(Arc<CachedNode>),
    /// Node created by the reading transaction.
    Created(NodeId),
}

impl NodeRef {
    /// Node id.
    pub fn id(&self) -> NodeId {
        match self {
            NodeRef::Committed(node) => node.id(),
            NodeRef::Created(id) => *id,
        }
    }
}

/// A relationship as seen by one transaction.
#[derive(Clone, Debug)]
pub enum RelationshipRef {
    /// Committed relationship, served from the shared cache.
    Committed(Arc<CachedRelationship>),
    /// Relationship created by the reading transaction.
    Created(RelationshipRecord),
}

impl RelationshipRef {
    /// Record as the transaction sees it.
    pub fn record(&self) -> RelationshipRecord {
        match self {
            RelationshipRef::Committed(rel) => rel.record(),
            RelationshipRef::Created(record) => *record,
        }
    }

    /// Relationship id.
    pub fn id(&self) -> RelId {
        self.record().id
    }
}

/// Entry point of the kernel.
///
/// Reads go through the shared [`EntityCache`]; an optional overlay layers the
/// reading transaction's own changes on top. Writes take entity write locks,
/// record them in the overlay and stage the change there until
/// [`GraphKernel::commit`].
pub struct GraphKernel {
    cache: Arc<EntityCache>,
    merger: OverlayMerger,
    writer: Arc<dyn StoreWriter>,
    locks: Arc<dyn LockManager>,
    ids: Arc<SequentialIds>,
    property_keys: TokenHolder,
    labels: TokenHolder,
    relationship_types: TokenHolder,
    next_tx: AtomicU64,
}

impl GraphKernel {
    /// Opens a kernel over `store`, loading every persisted token from `token_store`.
    pub fn open<S>(
        options: CacheOptions,
        store: Arc<dyn EntityStore>,
        writer: Arc<dyn StoreWriter>,
        token_store: Arc<S>,
    ) -> Result<Self>
    where
        S: TokenStore + 'static,
    {
        let mut cache = EntityCache::new(store, &options);
        if options.cache_budget_bytes > 0 {
            cache = cache.with_eviction_hook(Arc::new(LruPolicy::new(options.cache_budget_bytes)));
        }
        let cache = Arc::new(cache);
        let ids = Arc::new(SequentialIds::new());
        let creator = Arc::new(IsolatedTokenCreator::new(
            Arc::clone(&token_store),
            Arc::clone(&ids) as Arc<dyn IdGenerator>,
        ));
        let holder = |kind: TokenKind| -> Result<TokenHolder> {
            let holder = TokenHolder::new(kind, creator.clone());
            let persisted = token_store
                .load_tokens(kind)
                .map_err(|source| CacheError::TokenLoad { kind, source })?;
            if let Some(max) = persisted.iter().map(|token| token.id()).max() {
                ids.mark_used(IdKind::Token(kind), u64::from(max));
            }
            holder.put_all(persisted)?;
            Ok(holder)
        };
        let property_keys = holder(TokenKind::PropertyKey)?;
        let labels = holder(TokenKind::Label)?;
        let relationship_types = holder(TokenKind::RelationshipType)?;
        info!(
            batch = options.chain_batch_size,
            budget = options.cache_budget_bytes,
            property_keys = property_keys.all_tokens().len(),
            labels = labels.all_tokens().len(),
            relationship_types = relationship_types.all_tokens().len(),
            "kernel.open"
        );
        Ok(Self {
            merger: OverlayMerger::new(Arc::clone(&cache)),
            cache,
            writer,
            locks: Arc::new(LocalLockManager::new(options.lock_timeout)),
            ids,
            property_keys,
            labels,
            relationship_types,
            next_tx: AtomicU64::new(1),
        })
    }

    /// Opens a kernel backed by fresh in-memory stores.
    pub fn in_memory(options: CacheOptions) -> Result<(Self, Arc<MemoryStore>)> {
        let store = Arc::new(MemoryStore::new(options.dense_node_threshold));
        let kernel = Self::open(
            options,
            store.clone(),
            store.clone(),
            Arc::new(MemoryTokenStore::new()),
        )?;
        Ok((kernel, store))
    }

    /// Replaces the in-process lock manager.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Shared entity cache.
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Id counters; callers reserve ids already present in the store here.
    pub fn ids(&self) -> &Arc<SequentialIds> {
        &self.ids
    }

    /// Property key tokens.
    pub fn property_keys(&self) -> &TokenHolder {
        &self.property_keys
    }

    /// Label tokens.
    pub fn labels(&self) -> &TokenHolder {
        &self.labels
    }

    /// Relationship type tokens.
    pub fn relationship_types(&self) -> &TokenHolder {
        &self.relationship_types
    }

    /// Token holder of `kind`.
    pub fn tokens(&self, kind: TokenKind) -> &TokenHolder {
        match kind {
            TokenKind::PropertyKey => &self.property_keys,
            TokenKind::Label => &self.labels,
            TokenKind::RelationshipType => &self.relationship_types,
        }
    }

    // ---- reads -------------------------------------------------------------

    /// Node `id` as seen by `overlay`'s transaction.
    pub fn get_node(&self, id: NodeId, overlay: Option<&TransactionOverlay>) -> Result<NodeRef> {
        let entity = EntityRef::Node(id);
        if let Some(overlay) = overlay {
            if overlay.is_deleted(entity) {
                return Err(CacheError::NotFound(entity));
            }
            if overlay.is_created(entity) {
                return Ok(NodeRef::Created(id));
            }
        }
        Ok(NodeRef::Committed(self.cache.get_node(id)?))
    }

    /// Relationship `id` as seen by `overlay`'s transaction.
    pub fn get_relationship(
        &self,
        id: RelId,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<RelationshipRef> {
        let entity = EntityRef::Relationship(id);
        if let Some(overlay) = overlay {
            if overlay.is_deleted(entity) {
                return Err(CacheError::NotFound(entity));
            }
            if let Some(record) = overlay
                .relationship_delta(id)
                .filter(|delta| delta.is_created())
                .and_then(|delta| delta.record())
            {
                return Ok(RelationshipRef::Created(record));
            }
        }
        Ok(RelationshipRef::Committed(self.cache.get_relationship(id)?))
    }

    fn ensure_visible(&self, entity: EntityRef, overlay: Option<&TransactionOverlay>) -> Result<()> {
        match entity {
            EntityRef::Node(id) => self.get_node(id, overlay).map(drop),
            EntityRef::Relationship(id) => self.get_relationship(id, overlay).map(drop),
            EntityRef::Graph => Ok(()),
        }
    }

    fn committed_properties(&self, entity: EntityRef) -> Result<Arc<PropertyArray>> {
        match entity {
            EntityRef::Node(id) => self.cache.node_properties(id),
            EntityRef::Relationship(id) => self.cache.relationship_properties(id),
            EntityRef::Graph => self.cache.graph_properties(),
        }
    }

    fn visible_properties(
        &self,
        entity: EntityRef,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<Arc<PropertyArray>> {
        self.ensure_visible(entity, overlay)?;
        let created = overlay.is_some_and(|overlay| overlay.is_created(entity));
        let committed = if created {
            Arc::new(PropertyArray::empty())
        } else {
            self.committed_properties(entity)?
        };
        match overlay.and_then(|overlay| overlay.entity_delta(entity)) {
            Some(delta) if delta.has_property_changes() => Ok(Arc::new(delta.apply_to(&committed))),
            _ => Ok(committed),
        }
    }

    /// Value of one property, `None` when the entity does not have it.
    pub fn get_property(
        &self,
        entity: EntityRef,
        key: PropKeyId,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<Option<PropValue>> {
        if let Some(local) = overlay
            .and_then(|overlay| overlay.entity_delta(entity))
            .and_then(|delta| delta.property(key))
        {
            self.ensure_visible(entity, overlay)?;
            return Ok(local.cloned());
        }
        Ok(self.visible_properties(entity, overlay)?.get(key).cloned())
    }

    /// Every property of the entity, ordered by key id.
    pub fn get_all_properties(
        &self,
        entity: EntityRef,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<PropertyIter> {
        Ok(PropertyIter::new(self.visible_properties(entity, overlay)?))
    }

    /// Property keys of the entity, ordered by key id.
    pub fn get_property_keys(
        &self,
        entity: EntityRef,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<impl Iterator<Item = PropKeyId>> {
        Ok(self.get_all_properties(entity, overlay)?.map(|(key, _)| key))
    }

    /// Relationships of `node`, loading chains while the sequence is consumed.
    ///
    /// Relationships removed by the transaction are hidden; the ones it
    /// created follow the committed ones.
    pub fn relationships(
        &self,
        node: NodeId,
        direction: Direction,
        types: TypeSelector,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<RelationshipIter<'_>> {
        let cached = match self.get_node(node, overlay)? {
            NodeRef::Committed(cached) => cached,
            NodeRef::Created(id) => Arc::new(CachedNode::detached(id)),
        };
        let delta = overlay.and_then(|overlay| overlay.node_delta(node));
        let iter = match delta {
            Some(delta) => {
                let added = delta.added_ids(direction, &types);
                let removed = delta.removed_ids();
                self.cache
                    .relationships(cached, direction, types)
                    .with_overlay(removed, added)
            }
            None => self.cache.relationships(cached, direction, types),
        };
        Ok(iter)
    }

    /// Sorted labels of a node.
    pub fn node_labels(&self, node: NodeId, overlay: Option<&TransactionOverlay>) -> Result<Vec<LabelId>> {
        let committed = match self.get_node(node, overlay)? {
            NodeRef::Committed(_) => self.cache.node_labels(node)?,
            NodeRef::Created(_) => Arc::new(Vec::new()),
        };
        let Some(delta) = overlay.and_then(|overlay| overlay.node_delta(node)) else {
            return Ok(committed.as_ref().clone());
        };
        let mut labels: BTreeSet<LabelId> = committed.iter().copied().collect();
        for label in delta.removed_labels() {
            labels.remove(label);
        }
        labels.extend(delta.added_labels().iter().copied());
        Ok(labels.into_iter().collect())
    }

    /// Whether the node carries `label` as seen by the transaction.
    pub fn has_label(
        &self,
        node: NodeId,
        label: LabelId,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<bool> {
        Ok(self.node_labels(node, overlay)?.binary_search(&label).is_ok())
    }

    fn touches_relationships(node: NodeId, overlay: Option<&TransactionOverlay>) -> bool {
        overlay
            .and_then(|overlay| overlay.node_delta(node))
            .is_some_and(|delta| {
                delta.relationship_additions().is_some() || delta.relationship_removals().is_some()
            })
            || overlay.is_some_and(|overlay| overlay.is_created(EntityRef::Node(node)))
    }

    /// Number of relationships of `node` visible to a query.
    pub fn degree(
        &self,
        node: NodeId,
        direction: Direction,
        types: &TypeSelector,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<usize> {
        if !Self::touches_relationships(node, overlay) {
            self.get_node(node, overlay)?;
            return self.cache.degree(node, direction, types);
        }
        let mut count = 0;
        for id in self.relationships(node, direction, types.clone(), overlay)? {
            id?;
            count += 1;
        }
        Ok(count)
    }

    /// Relationship types present on `node`, sorted.
    pub fn node_relationship_types(
        &self,
        node: NodeId,
        overlay: Option<&TransactionOverlay>,
    ) -> Result<Vec<TypeId>> {
        if !Self::touches_relationships(node, overlay) {
            self.get_node(node, overlay)?;
            return self.cache.relationship_types(node);
        }
        let mut types = BTreeSet::new();
        for id in self.relationships(node, Direction::Both, TypeSelector::All, overlay)? {
            types.insert(self.get_relationship(id?, overlay)?.record().ty);
        }
        Ok(types.into_iter().collect())
    }

    /// Calls `visit` with the committed counts of every relationship type of `node`.
    pub fn visit_degrees<F>(&self, node: NodeId, visit: F) -> Result<()>
    where
        F: FnMut(TypeId, DegreeCounts),
    {
        self.cache.visit_degrees(node, visit)
    }

    // ---- overlay lifecycle ---------------------------------------------------

    /// Opens an empty overlay for a new transaction.
    pub fn begin_overlay(&self) -> TransactionOverlay {
        let tx = TxId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        debug!(tx = tx.0, "kernel.tx.begin");
        TransactionOverlay::new(tx)
    }

    /// Writes the overlay to the store, folds it into the cache and releases its locks.
    ///
    /// A failed store write leaves the cache untouched; the locks are
    /// released either way.
    pub fn commit(&self, mut overlay: TransactionOverlay) -> Result<CommitReport> {
        let applied = match self.writer.apply(&overlay) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(tx = overlay.tx().0, error = %err, "kernel.tx.commit_failed");
                self.release_locks(&mut overlay);
                return Err(err.into());
            }
        };
        let report = self.merger.commit(&overlay, &applied);
        self.release_locks(&mut overlay);
        debug!(tx = overlay.tx().0, "kernel.tx.commit");
        Ok(report)
    }

    /// Discards the overlay and releases its locks.
    pub fn rollback(&self, mut overlay: TransactionOverlay) {
        self.release_locks(&mut overlay);
        self.merger.rollback(overlay);
    }

    fn release_locks(&self, overlay: &mut TransactionOverlay) {
        let tx = overlay.tx();
        for (resource, mode) in overlay.take_locks().into_iter().rev() {
            if let Err(err) = self.locks.release(tx, resource, mode) {
                warn!(tx = tx.0, %resource, error = %err, "kernel.tx.release_failed");
            }
        }
    }

    fn write_lock(&self, overlay: &mut TransactionOverlay, resource: EntityRef) -> Result<()> {
        if overlay.locks().contains(&(resource, LockMode::Write)) {
            return Ok(());
        }
        self.locks.acquire(overlay.tx(), resource, LockMode::Write)?;
        overlay.record_lock(resource, LockMode::Write);
        Ok(())
    }

    /// Checks that a mutation target exists; overlay-deleted targets are left
    /// to the overlay, which rejects the mutation.
    fn ensure_known(&self, entity: EntityRef, overlay: &TransactionOverlay) -> Result<()> {
        if overlay.is_deleted(entity) || overlay.is_created(entity) {
            return Ok(());
        }
        self.ensure_visible(entity, None)
    }

    // ---- writes -------------------------------------------------------------

    /// Creates a node in the transaction.
    pub fn create_node(&self, overlay: &mut TransactionOverlay) -> Result<NodeId> {
        let id = NodeId(self.ids.next_id(IdKind::Node));
        self.write_lock(overlay, EntityRef::Node(id))?;
        overlay.node_created(id)?;
        Ok(id)
    }

    /// Creates a relationship between two visible nodes.
    pub fn create_relationship(
        &self,
        overlay: &mut TransactionOverlay,
        start: NodeId,
        end: NodeId,
        ty: TypeId,
    ) -> Result<RelId> {
        self.get_node(start, Some(overlay))?;
        self.get_node(end, Some(overlay))?;
        let (first, second) = if start <= end { (start, end) } else { (end, start) };
        self.write_lock(overlay, EntityRef::Node(first))?;
        self.write_lock(overlay, EntityRef::Node(second))?;
        let id = RelId(self.ids.next_id(IdKind::Relationship));
        self.write_lock(overlay, EntityRef::Relationship(id))?;
        overlay.relationship_created(RelationshipRecord { id, start, end, ty })?;
        Ok(id)
    }

    /// Deletes a node; its relationships must be deleted in the same transaction.
    pub fn delete_node(&self, overlay: &mut TransactionOverlay, id: NodeId) -> Result<()> {
        let entity = EntityRef::Node(id);
        self.ensure_known(entity, overlay)?;
        self.write_lock(overlay, entity)?;
        overlay.delete(entity)
    }

    /// Deletes a relationship and detaches it from both endpoints.
    pub fn delete_relationship(&self, overlay: &mut TransactionOverlay, id: RelId) -> Result<()> {
        let entity = EntityRef::Relationship(id);
        if overlay.is_deleted(entity) {
            return Err(CacheError::AlreadyDeleted(entity));
        }
        let record = self.get_relationship(id, Some(overlay))?.record();
        let (first, second) = if record.start <= record.end {
            (record.start, record.end)
        } else {
            (record.end, record.start)
        };
        self.write_lock(overlay, EntityRef::Node(first))?;
        self.write_lock(overlay, EntityRef::Node(second))?;
        self.write_lock(overlay, entity)?;
        overlay.relationship_deleted(record)
    }

    /// Sets a property in the transaction.
    pub fn set_property(
        &self,
        overlay: &mut TransactionOverlay,
        entity: EntityRef,
        key: PropKeyId,
        value: PropValue,
    ) -> Result<()> {
        self.ensure_known(entity, overlay)?;
        self.write_lock(overlay, entity)?;
        overlay.add_property(entity, key, value)
    }

    /// Removes a property in the transaction.
    pub fn remove_property(
        &self,
        overlay: &mut TransactionOverlay,
        entity: EntityRef,
        key: PropKeyId,
    ) -> Result<()> {
        self.ensure_known(entity, overlay)?;
        self.write_lock(overlay, entity)?;
        overlay.remove_property(entity, key)
    }

    /// Adds a label to a node in the transaction.
    pub fn add_label(&self, overlay: &mut TransactionOverlay, node: NodeId, label: LabelId) -> Result<()> {
        let entity = EntityRef::Node(node);
        self.ensure_known(entity, overlay)?;
        self.write_lock(overlay, entity)?;
        overlay.add_label(node, label)
    }

    /// Removes a label from a node in the transaction.
    pub fn remove_label(
        &self,
        overlay: &mut TransactionOverlay,
        node: NodeId,
        label: LabelId,
    ) -> Result<()> {
        let entity = EntityRef::Node(node);
        self.ensure_known(entity, overlay)?;
        self.write_lock(overlay, entity)?;
        overlay.remove_label(node, label)
    }

    // ---- tokens -------------------------------------------------------------

    /// Resolves a token name of `kind`, creating it when missing.
    pub fn get_or_create_id(&self, kind: TokenKind, name: &str) -> Result<u32> {
        self.tokens(kind).get_or_create_id(name)
    }

    /// Id of an existing token, without creating one.
    pub fn get_id_by_name(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.tokens(kind).get_id_by_name(name)
    }

    /// Drops an entity from the shared cache.
    pub fn evict(&self, entity: EntityRef) -> bool {
        self.cache.evict(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> (GraphKernel, Arc<MemoryStore>) {
        GraphKernel::in_memory(CacheOptions::default().chain_batch_size(2)).expect("kernel")
    }

    #[test]
    fn overlay_reads_see_own_writes_only() -> Result<()> {
        let (kernel, _) = kernel();
        let mut tx = kernel.begin_overlay();
        let a = kernel.create_node(&mut tx)?;
        let b = kernel.create_node(&mut tx)?;
        let knows = TypeId(kernel.get_or_create_id(TokenKind::RelationshipType, "KNOWS")?);
        let rel = kernel.create_relationship(&mut tx, a, b, knows)?;
        let name = PropKeyId(kernel.get_or_create_id(TokenKind::PropertyKey, "name")?);
        kernel.set_property(&mut tx, EntityRef::Node(a), name, PropValue::from("ada"))?;

        let seen: Vec<RelId> = kernel
            .relationships(a, Direction::Outgoing, TypeSelector::All, Some(&tx))?
            .collect::<Result<_>>()?;
        assert_eq!(seen, vec![rel]);
        assert_eq!(
            kernel.get_property(EntityRef::Node(a), name, Some(&tx))?,
            Some(PropValue::from("ada"))
        );
        assert!(matches!(kernel.get_node(a, None), Err(CacheError::NotFound(_))));

        kernel.commit(tx)?;
        assert_eq!(
            kernel.get_property(EntityRef::Node(a), name, None)?,
            Some(PropValue::from("ada"))
        );
        assert_eq!(kernel.degree(b, Direction::Incoming, &TypeSelector::All, None)?, 1);
        Ok(())
    }

    #[test]
    fn commit_releases_locks_even_when_the_write_fails() -> Result<()> {
        let (kernel, store) = kernel();
        let mut tx = kernel.begin_overlay();
        let node = kernel.create_node(&mut tx)?;
        store.fail_next_applies(1);
        assert!(kernel.commit(tx).is_err());

        let mut retry = kernel.begin_overlay();
        kernel.write_lock(&mut retry, EntityRef::Node(node))?;
        kernel.rollback(retry);
        Ok(())
    }

    #[test]
    fn deleted_entities_are_hidden_and_frozen() -> Result<()> {
        let (kernel, _) = kernel();
        let mut setup = kernel.begin_overlay();
        let node = kernel.create_node(&mut setup)?;
        kernel.commit(setup)?;

        let mut tx = kernel.begin_overlay();
        kernel.delete_node(&mut tx, node)?;
        assert!(matches!(kernel.get_node(node, Some(&tx)), Err(CacheError::NotFound(_))));
        let err = kernel
            .set_property(&mut tx, EntityRef::Node(node), PropKeyId(0), PropValue::Int(1))
            .unwrap_err();
        assert!(matches!(err, CacheError::AlreadyDeleted(_)));
        kernel.rollback(tx);
        assert!(kernel.get_node(node, None).is_ok());
        Ok(())
    }

    #[test]
    fn labels_merge_committed_and_local_changes() -> Result<()> {
        let (kernel, _) = kernel();
        let mut setup = kernel.begin_overlay();
        let node = kernel.create_node(&mut setup)?;
        kernel.add_label(&mut setup, node, LabelId(3))?;
        kernel.add_label(&mut setup, node, LabelId(1))?;
        kernel.commit(setup)?;
        assert_eq!(kernel.node_labels(node, None)?, vec![LabelId(1), LabelId(3)]);

        let mut tx = kernel.begin_overlay();
        kernel.remove_label(&mut tx, node, LabelId(3))?;
        kernel.add_label(&mut tx, node, LabelId(2))?;
        assert_eq!(kernel.node_labels(node, Some(&tx))?, vec![LabelId(1), LabelId(2)]);
        assert!(!kernel.has_label(node, LabelId(3), Some(&tx))?);
        kernel.commit(tx)?;
        assert_eq!(kernel.node_labels(node, None)?, vec![LabelId(1), LabelId(2)]);
        Ok(())
    }
}
