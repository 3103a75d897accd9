use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::storage::store::{ChainHeads, ChainHole, ChainKey};
use crate::storage::types::{Direction, RelDirection, TypeSelector};
use crate::types::{RelId, TypeId};

/// How much of a node's relationship chains has been pulled into cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainPosition {
    /// Every chain was read to the end.
    Empty,
    /// Next unread record of the single chain of a sparse node.
    Sparse(u64),
    /// Next unread record of every still-partial chain of a dense node.
    Dense(BTreeMap<(TypeId, RelDirection), u64>),
}

impl ChainPosition {
    /// Initial position for a node whose chains start at `heads`.
    pub fn from_heads(heads: ChainHeads) -> Self {
        match heads {
            ChainHeads::Sparse(Some(head)) => ChainPosition::Sparse(head),
            ChainHeads::Sparse(None) => ChainPosition::Empty,
            ChainHeads::Dense(groups) => {
                let partial: BTreeMap<_, _> = groups.into_iter().collect();
                if partial.is_empty() {
                    ChainPosition::Empty
                } else {
                    ChainPosition::Dense(partial)
                }
            }
        }
    }

    /// Whether the chains are exhausted.
    pub fn is_empty(&self) -> bool {
        matches!(self, ChainPosition::Empty)
    }

    /// Whether a query over `direction` and `types` may still find unread relationships.
    ///
    /// A sparse chain mixes every type and direction, so any partial sparse
    /// chain answers yes. For dense nodes every partial sub-chain is checked,
    /// which keeps the wildcard selector correct.
    pub fn has_more(&self, direction: Direction, types: &TypeSelector) -> bool {
        match self {
            ChainPosition::Empty => false,
            ChainPosition::Sparse(_) => true,
            ChainPosition::Dense(partial) => partial
                .keys()
                .any(|(ty, dir)| types.includes(*ty) && direction.matches(*dir)),
        }
    }

    /// Moves a cursor parked on a record a commit unlinked to the record that followed it.
    ///
    /// Returns whether the position changed.
    pub fn skip_hole(&mut self, hole: &ChainHole) -> bool {
        match hole.key {
            ChainKey::Sparse => {
                if *self != ChainPosition::Sparse(hole.removed) {
                    return false;
                }
                *self = hole.next.map_or(ChainPosition::Empty, ChainPosition::Sparse);
                true
            }
            ChainKey::Dense(ty, dir) => {
                let ChainPosition::Dense(partial) = self else {
                    return false;
                };
                if partial.get(&(ty, dir)) != Some(&hole.removed) {
                    return false;
                }
                match hole.next {
                    Some(next) => {
                        partial.insert((ty, dir), next);
                    }
                    None => {
                        partial.remove(&(ty, dir));
                    }
                }
                if partial.is_empty() {
                    *self = ChainPosition::Empty;
                }
                true
            }
        }
    }

    /// Record the next load of the chain holding `(ty, dir)` starts at.
    pub fn next_record(&self, ty: TypeId, dir: RelDirection) -> Option<u64> {
        match self {
            ChainPosition::Empty => None,
            ChainPosition::Sparse(next) => Some(*next),
            ChainPosition::Dense(partial) => partial.get(&(ty, dir)).copied(),
        }
    }
}

/// On-disk layout of a node's relationship chains.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeLayout {
    /// One chain holding every relationship.
    Sparse,
    /// One chain per relationship type and direction.
    Dense,
}

impl NodeLayout {
    /// Layout for a node record's `dense` flag.
    pub fn of(dense: bool) -> Self {
        if dense {
            NodeLayout::Dense
        } else {
            NodeLayout::Sparse
        }
    }

    /// Whether the layout is dense.
    pub fn is_dense(self) -> bool {
        matches!(self, NodeLayout::Dense)
    }

    /// Id that will head the chain holding `(ty, dir)` once a commit is written.
    ///
    /// A sparse node keeps all relationships in one chain, so the head is the
    /// same for every type and direction.
    pub fn first_id_to_commit(
        self,
        first_ids: &FirstRelationshipIds,
        ty: TypeId,
        dir: RelDirection,
    ) -> Option<RelId> {
        match self {
            NodeLayout::Sparse => first_ids.chain_head(),
            NodeLayout::Dense => first_ids.group_head(ty, dir),
        }
    }
}

/// Gate every committed direction block has to pass before it is added to a cached node.
///
/// Records reach the store before the commit reaches the cache, so a reader
/// may already have loaded the relationships a committer is about to add. The
/// committer knows which id heads each chain after its write. If that id is
/// the first id of any cached block, or the record the next load starts at,
/// a reader got there first and the block is skipped.
#[derive(Debug)]
pub struct AddFilter<'a> {
    layout: NodeLayout,
    first_ids: &'a FirstRelationshipIds,
    cached_first_ids: FxHashSet<RelId>,
    position: ChainPosition,
    skipped: usize,
}

impl<'a> AddFilter<'a> {
    /// Snapshots the cached first ids and position; must run before any block is added.
    pub fn new(
        layout: NodeLayout,
        first_ids: &'a FirstRelationshipIds,
        cached_first_ids: FxHashSet<RelId>,
        position: ChainPosition,
    ) -> Self {
        Self {
            layout,
            first_ids,
            cached_first_ids,
            position,
            skipped: 0,
        }
    }

    /// Whether the `(ty, dir)` block of the commit may be added.
    pub fn accept(&mut self, ty: TypeId, dir: RelDirection) -> bool {
        let Some(first) = self.layout.first_id_to_commit(self.first_ids, ty, dir) else {
            return true;
        };
        let loaded = self.cached_first_ids.contains(&first);
        let pending = self.position.next_record(ty, dir) == Some(first.0);
        if loaded || pending {
            self.skipped += 1;
            return false;
        }
        true
    }

    /// Number of blocks refused so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Chain heads a transaction produces on one node by creating relationships.
///
/// New relationships are linked in at the front of their chains, so the most
/// recently created one heads the chain after the commit is written.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FirstRelationshipIds {
    head: Option<RelId>,
    groups: FxHashMap<(TypeId, RelDirection), RelId>,
}

impl FirstRelationshipIds {
    /// Records that `id` was created on the node as `(ty, dir)`.
    pub fn created(&mut self, ty: TypeId, dir: RelDirection, id: RelId) {
        self.head = Some(id);
        self.groups.insert((ty, dir), id);
    }

    /// Head of the single sparse chain.
    pub fn chain_head(&self) -> Option<RelId> {
        self.head
    }

    /// Head of the `(ty, dir)` group chain.
    pub fn group_head(&self, ty: TypeId, dir: RelDirection) -> Option<RelId> {
        self.groups.get(&(ty, dir)).copied()
    }

    /// Whether no relationship was created on the node.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}
