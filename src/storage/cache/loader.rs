use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::storage::cache::position::ChainPosition;
use crate::storage::cache::rel_ids::RelIdSet;
use crate::storage::store::{ChainKey, ChainPage, EntityStore, StoreError};
use crate::storage::types::{Direction, RelDirection, RelationshipRecord, TypeSelector};
use crate::types::{CacheError, NodeId, Result, TypeId};

/// Relationships pulled from the store by one batch.
#[derive(Debug)]
pub struct ChainBatch {
    /// Newly seen relationship ids grouped by type and direction.
    pub sets: FxHashMap<TypeId, RelIdSet>,
    /// Light records of the same relationships, for the relationship cache.
    pub relationships: Vec<RelationshipRecord>,
    /// Position after the batch.
    pub next: ChainPosition,
}

impl ChainBatch {
    fn new(next: ChainPosition) -> Self {
        Self {
            sets: FxHashMap::default(),
            relationships: Vec::new(),
            next,
        }
    }

    fn push(&mut self, node: NodeId, record: RelationshipRecord) {
        let dir = record.direction_from(node);
        self.sets
            .entry(record.ty)
            .or_insert_with(|| RelIdSet::new(record.ty))
            .add(record.id, dir);
        self.relationships.push(record);
    }
}

/// Reads relationship chains from the store in bounded batches.
pub struct ChainLoader {
    store: Arc<dyn EntityStore>,
    batch_size: usize,
}

impl ChainLoader {
    /// Creates a loader reading at most `batch_size` relationships per call.
    pub fn new(store: Arc<dyn EntityStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Maximum relationships returned by one batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reads where the chains of `node` begin.
    pub fn initial_position(&self, node: NodeId) -> Result<ChainPosition> {
        let heads = self.store.chain_heads(node)?;
        Ok(ChainPosition::from_heads(heads))
    }

    /// Loads the next batch after `position` for a query over `direction` and `types`.
    ///
    /// Sparse chains are read in order regardless of the query. Dense nodes
    /// only read the sub-chains the query can see, loops first. A record that
    /// vanishes mid-walk is retried once before the call fails with
    /// [`CacheError::ConcurrentlyDeleted`].
    pub fn load_more(
        &self,
        node: NodeId,
        position: &ChainPosition,
        direction: Direction,
        types: &TypeSelector,
    ) -> Result<ChainBatch> {
        let batch = match position {
            ChainPosition::Empty => ChainBatch::new(ChainPosition::Empty),
            ChainPosition::Sparse(from) => self.load_sparse(node, *from)?,
            ChainPosition::Dense(partial) => self.load_dense(node, partial, direction, types)?,
        };
        trace!(
            node = node.0,
            loaded = batch.relationships.len(),
            exhausted = batch.next.is_empty(),
            "cache.chain.batch"
        );
        Ok(batch)
    }

    fn load_sparse(&self, node: NodeId, from: u64) -> Result<ChainBatch> {
        let page = self.scan(node, ChainKey::Sparse, from, self.batch_size)?;
        let next = match page.next {
            Some(ptr) => ChainPosition::Sparse(ptr),
            None => ChainPosition::Empty,
        };
        let mut batch = ChainBatch::new(next);
        for record in page.relationships {
            batch.push(node, record);
        }
        Ok(batch)
    }

    fn load_dense(
        &self,
        node: NodeId,
        partial: &BTreeMap<(TypeId, RelDirection), u64>,
        direction: Direction,
        types: &TypeSelector,
    ) -> Result<ChainBatch> {
        let mut remaining_chains = partial.clone();
        let mut records = Vec::new();
        let mut budget = self.batch_size;
        'dirs: for dir in RelDirection::LOAD_ORDER {
            if !direction.matches(dir) {
                continue;
            }
            for (&(ty, chain_dir), &from) in partial {
                if chain_dir != dir || !types.includes(ty) {
                    continue;
                }
                if budget == 0 {
                    break 'dirs;
                }
                let page = self.scan(node, ChainKey::Dense(ty, dir), from, budget)?;
                budget = budget.saturating_sub(page.relationships.len());
                match page.next {
                    Some(ptr) => {
                        remaining_chains.insert((ty, dir), ptr);
                    }
                    None => {
                        remaining_chains.remove(&(ty, dir));
                    }
                }
                records.extend(page.relationships);
            }
        }
        let next = if remaining_chains.is_empty() {
            ChainPosition::Empty
        } else {
            ChainPosition::Dense(remaining_chains)
        };
        let mut batch = ChainBatch::new(next);
        for record in records {
            batch.push(node, record);
        }
        Ok(batch)
    }

    fn scan(&self, node: NodeId, key: ChainKey, from: u64, limit: usize) -> Result<ChainPage> {
        match self.store.scan_chain(node, key, from, limit) {
            Err(StoreError::InvalidRecord(record)) => {
                trace!(node = node.0, record, "cache.chain.retry");
                match self.store.scan_chain(node, key, from, limit) {
                    Err(StoreError::InvalidRecord(record)) => {
                        warn!(node = node.0, record, "cache.chain.concurrently_deleted");
                        Err(CacheError::ConcurrentlyDeleted(node))
                    }
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }
}
