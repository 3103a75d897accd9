use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::storage::cache::node::CachedNode;
use crate::storage::cache::rel_ids::RelIdSet;
use crate::storage::cache::EntityCache;
use crate::storage::props::PropertyArray;
use crate::storage::types::{Direction, PropValue, RelDirection, TypeSelector};
use crate::types::{PropKeyId, RelId, Result};

struct Cursor {
    set: Arc<RelIdSet>,
    read: [usize; 3],
}

impl Cursor {
    fn new(set: Arc<RelIdSet>) -> Self {
        Self { set, read: [0; 3] }
    }

    fn next(&mut self, direction: Direction) -> Option<RelId> {
        for dir in direction.chain_directions() {
            let block = self.set.block(*dir);
            let read = &mut self.read[dir.index()];
            if *read < block.len() {
                let id = block[*read];
                *read += 1;
                return Some(id);
            }
        }
        None
    }

    /// Switches to a newer snapshot of the same type, keeping the walk's place.
    ///
    /// Loads and merges only append to a block, and removals keep the order of
    /// what is left, so the ids already read form a prefix of the new block too.
    /// Counting how many of them survive gives the new offset.
    fn rebase(&mut self, set: Arc<RelIdSet>) {
        for dir in RelDirection::LOAD_ORDER {
            let read = self.read[dir.index()];
            if read == 0 {
                continue;
            }
            let old = &self.set.block(dir)[..read];
            let new = set.block(dir);
            if new.get(..read) == Some(old) {
                continue;
            }
            let yielded: FxHashSet<RelId> = old.iter().copied().collect();
            self.read[dir.index()] = new.iter().take_while(|id| yielded.contains(id)).count();
        }
        self.set = set;
    }

    fn has_unread(&self, direction: Direction) -> bool {
        direction
            .chain_directions()
            .iter()
            .any(|dir| self.read[dir.index()] < self.set.block(*dir).len())
    }
}

/// Lazy walk over a node's relationships that loads chain batches as it goes.
///
/// Each type keeps its own read offsets per direction, so re-sampling a
/// newer set after a load or a concurrent commit continues where the walk
/// left off. Items are `Err` only when a load fails; the walk ends after that.
pub struct RelationshipIter<'a> {
    cache: &'a EntityCache,
    node: Arc<CachedNode>,
    direction: Direction,
    types: TypeSelector,
    cursors: Vec<Cursor>,
    current: usize,
    removed: FxHashSet<RelId>,
    added: std::vec::IntoIter<RelId>,
    committed_done: bool,
}

impl<'a> RelationshipIter<'a> {
    pub(crate) fn new(
        cache: &'a EntityCache,
        node: Arc<CachedNode>,
        direction: Direction,
        types: TypeSelector,
    ) -> Self {
        Self {
            cache,
            node,
            direction,
            types,
            cursors: Vec::new(),
            current: 0,
            removed: FxHashSet::default(),
            added: Vec::new().into_iter(),
            committed_done: false,
        }
    }

    /// Hides `removed` and appends `added` after the committed relationships.
    pub fn with_overlay(mut self, removed: FxHashSet<RelId>, added: Vec<RelId>) -> Self {
        self.removed = removed;
        self.added = added.into_iter();
        self
    }

    fn next_cached(&mut self) -> Option<RelId> {
        while self.current < self.cursors.len() {
            if let Some(id) = self.cursors[self.current].next(self.direction) {
                return Some(id);
            }
            self.current += 1;
        }
        None
    }

    /// Swaps in the newest set of every type; returns whether anything is left to read.
    fn resample(&mut self) -> bool {
        for set in self.node.rel_sets(&self.types) {
            match self.cursors.iter_mut().find(|c| c.set.ty() == set.ty()) {
                Some(cursor) => {
                    if !Arc::ptr_eq(&cursor.set, &set) {
                        cursor.rebase(set);
                    }
                }
                None => self.cursors.push(Cursor::new(set)),
            }
        }
        self.current = 0;
        self.cursors.iter().any(|c| c.has_unread(self.direction))
    }
}

impl Iterator for RelationshipIter<'_> {
    type Item = Result<RelId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.committed_done {
                return self.added.next().map(Ok);
            }
            while let Some(id) = self.next_cached() {
                if !self.removed.contains(&id) {
                    return Some(Ok(id));
                }
            }
            // Snapshot before sampling: a loader that finishes in between is
            // caught by the next round.
            let more = self.node.has_more(self.direction, &self.types);
            if self.resample() {
                continue;
            }
            if !more {
                trace!(node = self.node.id().0, "cache.iter.exhausted");
                self.committed_done = true;
                continue;
            }
            if let Err(err) = self.cache.load_more(&self.node, self.direction, &self.types) {
                self.committed_done = true;
                self.added = Vec::new().into_iter();
                return Some(Err(err));
            }
        }
    }
}

/// Lazy, non-restartable walk over a property array snapshot.
pub struct PropertyIter {
    array: Arc<PropertyArray>,
    next: usize,
}

impl PropertyIter {
    pub(crate) fn new(array: Arc<PropertyArray>) -> Self {
        Self { array, next: 0 }
    }
}

impl Iterator for PropertyIter {
    type Item = (PropKeyId, PropValue);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.array.entry(self.next)?.clone();
        self.next += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.array.len().saturating_sub(self.next);
        (left, Some(left))
    }
}
