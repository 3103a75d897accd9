use std::mem::size_of;

use rustc_hash::FxHashSet;

use crate::storage::types::{Direction, RelDirection};
use crate::types::{RelId, TypeId};

/// Relationship ids of one type on one node, split by chain direction.
///
/// Ids keep the order in which they were discovered, so the first id of each
/// block is the first relationship of that chain as seen by the cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelIdSet {
    ty: TypeId,
    blocks: [Vec<RelId>; 3],
}

impl RelIdSet {
    /// Creates an empty set for `ty`.
    pub fn new(ty: TypeId) -> Self {
        Self {
            ty,
            blocks: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    /// Relationship type of every id in the set.
    pub fn ty(&self) -> TypeId {
        self.ty
    }

    /// Appends `id` to the block for `dir`.
    pub fn add(&mut self, id: RelId, dir: RelDirection) {
        self.blocks[dir.index()].push(id);
    }

    /// Ids stored under `dir`.
    pub fn block(&self, dir: RelDirection) -> &[RelId] {
        &self.blocks[dir.index()]
    }

    /// First id of the `dir` block, if any.
    pub fn first_id(&self, dir: RelDirection) -> Option<RelId> {
        self.blocks[dir.index()].first().copied()
    }

    /// Number of ids visible to a query in `direction`.
    pub fn len(&self, direction: Direction) -> usize {
        direction
            .chain_directions()
            .iter()
            .map(|dir| self.blocks[dir.index()].len())
            .sum()
    }

    /// Whether no block holds an id.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }

    /// Whether `id` is stored in any block.
    pub fn contains(&self, id: RelId) -> bool {
        self.blocks.iter().any(|block| block.contains(&id))
    }

    /// Appends every block of `other` whose direction passes `accept`.
    pub fn append_from<F>(&mut self, other: &RelIdSet, mut accept: F)
    where
        F: FnMut(TypeId, RelDirection) -> bool,
    {
        for dir in RelDirection::LOAD_ORDER {
            let from = other.block(dir);
            if from.is_empty() || !accept(self.ty, dir) {
                continue;
            }
            self.blocks[dir.index()].extend_from_slice(from);
        }
    }

    /// Drops every id in `removed`, keeping the order of the rest.
    pub fn retain_absent(&mut self, removed: &FxHashSet<RelId>) {
        for block in &mut self.blocks {
            block.retain(|id| !removed.contains(id));
        }
    }

    /// Builds the committed successor of `src` from a transaction's additions and removals.
    ///
    /// Additions pass through `accept` per direction block; removals apply to
    /// both the cached ids and the additions. Returns `None` when nothing is left
    /// to cache for the type.
    pub fn merged<F>(
        ty: TypeId,
        src: Option<&RelIdSet>,
        add: Option<&RelIdSet>,
        remove: Option<&FxHashSet<RelId>>,
        accept: F,
    ) -> Option<RelIdSet>
    where
        F: FnMut(TypeId, RelDirection) -> bool,
    {
        if src.is_none() && add.is_none() {
            return None;
        }
        let mut next = src.cloned().unwrap_or_else(|| RelIdSet::new(ty));
        if let Some(removed) = remove {
            next.retain_absent(removed);
        }
        if let Some(add) = add {
            match remove {
                Some(removed) => {
                    let mut add = add.clone();
                    add.retain_absent(removed);
                    next.append_from(&add, accept);
                }
                None => next.append_from(add, accept),
            }
        }
        Some(next)
    }

    /// Releases spare capacity once no more ids will be appended by loading.
    pub fn shrink(&mut self) {
        for block in &mut self.blocks {
            block.shrink_to_fit();
        }
    }

    /// Bytes retained by the set.
    pub fn size_in_bytes(&self) -> usize {
        let ids: usize = self.blocks.iter().map(Vec::capacity).sum();
        size_of::<Self>() + ids * size_of::<RelId>()
    }
}
