use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::storage::cache::cell::LazyCell;
use crate::storage::cache::loader::ChainLoader;
use crate::storage::cache::position::{AddFilter, ChainPosition, FirstRelationshipIds, NodeLayout};
use crate::storage::cache::rel_ids::RelIdSet;
use crate::storage::props::PropertyArray;
use crate::storage::store::{ChainHole, EntityStore};
use crate::storage::types::{
    Direction, NodeRecord, PropValue, RelDirection, RelationshipRecord, TypeSelector,
};
use crate::types::{LabelId, NodeId, PropKeyId, RelId, Result, TypeId};

/// Outcome of one attempt to load more relationships of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadStatus {
    /// The chains were already exhausted for the query.
    Nothing,
    /// A batch was loaded and nothing is left for the query.
    LoadedEnd,
    /// A batch was loaded and more remains.
    LoadedMore,
}

impl LoadStatus {
    /// Whether the call brought in new state.
    pub fn loaded(self) -> bool {
        !matches!(self, LoadStatus::Nothing)
    }
}

/// What a commit did to a cached node's relationships.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelationshipCommit {
    /// The node switched layout and has to be evicted.
    Evict,
    /// Relationships were never loaded; the next load reads the committed chains.
    NotLoaded,
    /// Changes were merged; `skipped` blocks were refused by the race filter.
    Merged {
        /// Direction blocks refused.
        skipped: usize,
    },
}

#[derive(Debug)]
struct RelState {
    sets: FxHashMap<TypeId, Arc<RelIdSet>>,
    position: ChainPosition,
}

/// Cached node: lazily loaded properties, labels and relationship chains.
#[derive(Debug)]
pub struct CachedNode {
    id: NodeId,
    layout: NodeLayout,
    properties: LazyCell<PropertyArray>,
    labels: LazyCell<Vec<LabelId>>,
    relationships: RwLock<Option<RelState>>,
    gate: Mutex<()>,
}

impl CachedNode {
    /// Builds an entry from the node's light record.
    pub fn new(record: NodeRecord) -> Self {
        Self {
            id: record.id,
            layout: NodeLayout::of(record.dense),
            properties: LazyCell::new(),
            labels: LazyCell::new(),
            relationships: RwLock::new(None),
            gate: Mutex::new(()),
        }
    }

    /// Entry for a node that exists only in a transaction: no committed state to load.
    pub(crate) fn detached(id: NodeId) -> Self {
        Self {
            id,
            layout: NodeLayout::Sparse,
            properties: LazyCell::loaded(PropertyArray::empty()),
            labels: LazyCell::loaded(Vec::new()),
            relationships: RwLock::new(Some(RelState {
                sets: FxHashMap::default(),
                position: ChainPosition::Empty,
            })),
            gate: Mutex::new(()),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Chain layout the entry was loaded with.
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Whether the node's chains are dense.
    pub fn is_dense(&self) -> bool {
        self.layout.is_dense()
    }

    /// Property array, loaded on first use.
    pub fn properties(&self, store: &dyn EntityStore) -> Result<Arc<PropertyArray>> {
        self.properties.get_or_try_load(&self.gate, || {
            trace!(node = self.id.0, "cache.node.properties.load");
            PropertyArray::from_records(store.node_properties(self.id)?)
        })
    }

    /// Sorted labels, loaded on first use.
    pub fn labels(&self, store: &dyn EntityStore) -> Result<Arc<Vec<LabelId>>> {
        self.labels.get_or_try_load(&self.gate, || {
            let mut labels = store.node_labels(self.id)?;
            labels.sort_unstable();
            labels.dedup();
            Ok(labels)
        })
    }

    /// Whether relationship state exists, even if partial.
    pub fn relationships_initialized(&self) -> bool {
        self.relationships.read().is_some()
    }

    /// Whether a query over `direction` and `types` may still find unloaded relationships.
    pub fn has_more(&self, direction: Direction, types: &TypeSelector) -> bool {
        match self.relationships.read().as_ref() {
            Some(state) => state.position.has_more(direction, types),
            None => true,
        }
    }

    /// Current chain position; `None` before relationships are initialized.
    pub fn position(&self) -> Option<ChainPosition> {
        self.relationships
            .read()
            .as_ref()
            .map(|state| state.position.clone())
    }

    /// Snapshot of the cached set for `ty`.
    pub fn rel_set(&self, ty: TypeId) -> Option<Arc<RelIdSet>> {
        self.relationships
            .read()
            .as_ref()
            .and_then(|state| state.sets.get(&ty).cloned())
    }

    /// Snapshot of every cached set selected by `types`, ordered by type id.
    pub fn rel_sets(&self, types: &TypeSelector) -> Vec<Arc<RelIdSet>> {
        let guard = self.relationships.read();
        let Some(state) = guard.as_ref() else {
            return Vec::new();
        };
        let mut sets: Vec<_> = state
            .sets
            .iter()
            .filter(|(ty, _)| types.includes(**ty))
            .map(|(_, set)| Arc::clone(set))
            .collect();
        sets.sort_by_key(|set| set.ty());
        sets
    }

    /// Reads where the node's chains start, once.
    pub fn ensure_relationships(&self, loader: &ChainLoader) -> Result<()> {
        if self.relationships_initialized() {
            return Ok(());
        }
        let _gate = self.gate.lock();
        self.init_relationships_locked(loader)
    }

    fn init_relationships_locked(&self, loader: &ChainLoader) -> Result<()> {
        if self.relationships_initialized() {
            return Ok(());
        }
        let position = loader.initial_position(self.id)?;
        trace!(node = self.id.0, exhausted = position.is_empty(), "cache.node.relationships.init");
        *self.relationships.write() = Some(RelState {
            sets: FxHashMap::default(),
            position,
        });
        Ok(())
    }

    /// Loads the next batch visible to `direction` and `types`.
    ///
    /// Returns the light records of the batch so the caller can populate the
    /// relationship cache once the node's gate is released.
    pub fn load_more(
        &self,
        loader: &ChainLoader,
        direction: Direction,
        types: &TypeSelector,
    ) -> Result<(LoadStatus, Vec<RelationshipRecord>)> {
        let _gate = self.gate.lock();
        self.init_relationships_locked(loader)?;
        let position = match self.relationships.read().as_ref() {
            Some(state) if state.position.has_more(direction, types) => state.position.clone(),
            _ => return Ok((LoadStatus::Nothing, Vec::new())),
        };
        let batch = loader.load_more(self.id, &position, direction, types)?;

        let mut guard = self.relationships.write();
        let Some(state) = guard.as_mut() else {
            return Ok((LoadStatus::Nothing, Vec::new()));
        };
        for (ty, loaded) in batch.sets {
            match state.sets.get_mut(&ty) {
                Some(cached) => Arc::make_mut(cached).append_from(&loaded, |_, _| true),
                None => {
                    state.sets.insert(ty, Arc::new(loaded));
                }
            }
        }
        state.position = batch.next;
        if state.position.is_empty() {
            for set in state.sets.values_mut() {
                Arc::make_mut(set).shrink();
            }
            state.sets.shrink_to_fit();
        }
        let status = if state.position.has_more(direction, types) {
            LoadStatus::LoadedMore
        } else {
            LoadStatus::LoadedEnd
        };
        Ok((status, batch.relationships))
    }

    /// Relationship types with at least one cached id.
    pub fn relationship_types(&self) -> Vec<TypeId> {
        let mut types: Vec<_> = self
            .rel_sets(&TypeSelector::All)
            .iter()
            .filter(|set| !set.is_empty())
            .map(|set| set.ty())
            .collect();
        types.sort_unstable();
        types
    }

    /// Number of cached relationships visible to `direction` among `types`.
    pub fn cached_degree(&self, direction: Direction, types: &TypeSelector) -> usize {
        self.rel_sets(types)
            .iter()
            .map(|set| set.len(direction))
            .sum()
    }

    /// First id of every cached direction block.
    fn gather_first_ids(state: &RelState) -> FxHashSet<RelId> {
        let mut ids = FxHashSet::default();
        for set in state.sets.values() {
            for dir in RelDirection::LOAD_ORDER {
                if let Some(first) = set.first_id(dir) {
                    ids.insert(first);
                }
            }
        }
        ids
    }

    /// Folds a committed transaction's relationship changes into the cache.
    ///
    /// `dense` is the layout the node has after the commit was written. The
    /// race filter is built from a snapshot taken before anything is added.
    /// `holes` are the chain links the write removed; a position parked on one
    /// of them moves on to the record that followed it.
    pub fn commit_relationship_maps(
        &self,
        add: Option<&BTreeMap<TypeId, RelIdSet>>,
        remove: Option<&BTreeMap<TypeId, FxHashSet<RelId>>>,
        first_ids: &FirstRelationshipIds,
        holes: &[ChainHole],
        dense: bool,
    ) -> RelationshipCommit {
        if dense != self.is_dense() {
            return RelationshipCommit::Evict;
        }
        let _gate = self.gate.lock();
        let mut guard = self.relationships.write();
        let Some(state) = guard.as_mut() else {
            return RelationshipCommit::NotLoaded;
        };

        let mut skipped = 0;
        if let Some(add) = add {
            let mut filter = AddFilter::new(
                self.layout,
                first_ids,
                Self::gather_first_ids(state),
                state.position.clone(),
            );
            for (ty, added) in add {
                let removed = remove.and_then(|remove| remove.get(ty));
                let src = state.sets.get(ty).map(Arc::as_ref);
                if let Some(next) =
                    RelIdSet::merged(*ty, src, Some(added), removed, |ty, dir| filter.accept(ty, dir))
                {
                    state.sets.insert(*ty, Arc::new(next));
                }
            }
            skipped = filter.skipped();
        }
        if let Some(remove) = remove {
            for (ty, removed) in remove {
                if add.is_some_and(|add| add.contains_key(ty)) {
                    continue;
                }
                if let Some(cached) = state.sets.get_mut(ty) {
                    Arc::make_mut(cached).retain_absent(removed);
                }
            }
        }
        let mut moved = false;
        for hole in holes {
            moved |= state.position.skip_hole(hole);
        }
        if moved {
            trace!(node = self.id.0, exhausted = state.position.is_empty(), "cache.commit.chain_hole");
            if state.position.is_empty() {
                for set in state.sets.values_mut() {
                    Arc::make_mut(set).shrink();
                }
            }
        }
        if skipped > 0 {
            trace!(node = self.id.0, skipped, "cache.commit.filter_skip");
        }
        RelationshipCommit::Merged { skipped }
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

    /// Applies committed label changes if labels are loaded.
    pub fn commit_labels(&self, add: &BTreeSet<LabelId>, remove: &BTreeSet<LabelId>) {
        let _gate = self.gate.lock();
        self.labels.update(|current| {
            let mut labels: BTreeSet<LabelId> = current.iter().copied().collect();
            for label in remove {
                labels.remove(label);
            }
            labels.extend(add.iter().copied());
            labels.into_iter().collect()
        });
    }

    /// Bytes retained by the entry.
    pub fn size_in_bytes(&self) -> usize {
        let mut size = size_of::<Self>();
        if let Some(props) = self.properties.get() {
            size += props.size_in_bytes();
        }
        if let Some(labels) = self.labels.get() {
            size += labels.capacity() * size_of::<LabelId>();
        }
        if let Some(state) = self.relationships.read().as_ref() {
            size += state
                .sets
                .values()
                .map(|set| set.size_in_bytes())
                .sum::<usize>();
            if let ChainPosition::Dense(partial) = &state.position {
                size += partial.len() * size_of::<((TypeId, RelDirection), u64)>();
            }
        }
        size
    }
}
