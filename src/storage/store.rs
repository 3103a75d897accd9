//! Contracts of the persistent store the cache sits on top of.
//!
//! The cache never looks at record formats. It asks for light records,
//! property lists and pages of a node's relationship chain, and hands
//! committed overlays to a [`StoreWriter`].

use rustc_hash::FxHashMap;

use crate::storage::overlay::TransactionOverlay;
use crate::storage::types::{NodeRecord, PropertyRecords, RelDirection, RelationshipRecord};
use crate::types::{LabelId, NodeId, RelId, TypeId};

/// Errors raised by store collaborators.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A record pointer led to a record that is no longer in use.
    #[error("record {0} is not in use")]
    InvalidRecord(u64),
    /// The store rejected the request.
    #[error("store unavailable: {0}")]
    Unavailable(&'static str),
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store collaborators.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identifies one on-disk relationship chain of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ChainKey {
    /// The single chain of a sparse node.
    Sparse,
    /// One per-(type, direction) chain of a dense node.
    Dense(TypeId, RelDirection),
}

/// Where a node's chains begin, as read from its record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainHeads {
    /// Sparse node; `None` when the node has no relationships.
    Sparse(Option<u64>),
    /// Dense node; one entry per non-empty group chain.
    Dense(Vec<((TypeId, RelDirection), u64)>),
}

/// One page of a relationship chain.
#[derive(Clone, Debug, Default)]
pub struct ChainPage {
    /// Relationships in chain order.
    pub relationships: Vec<RelationshipRecord>,
    /// Pointer to the next unread record, `None` when the chain ended.
    pub next: Option<u64>,
}

/// Read-side store API consumed by the cache.
pub trait EntityStore: Send + Sync {
    /// Loads the light record of a node.
    fn node(&self, id: NodeId) -> StoreResult<Option<NodeRecord>>;

    /// Loads the light record of a relationship.
    fn relationship(&self, id: RelId) -> StoreResult<Option<RelationshipRecord>>;

    /// Loads all properties of a node.
    fn node_properties(&self, id: NodeId) -> StoreResult<PropertyRecords>;

    /// Loads all properties of a relationship.
    fn relationship_properties(&self, id: RelId) -> StoreResult<PropertyRecords>;

    /// Loads the graph-level properties.
    fn graph_properties(&self) -> StoreResult<PropertyRecords>;

    /// Loads the labels of a node.
    fn node_labels(&self, id: NodeId) -> StoreResult<Vec<LabelId>>;

    /// Reads where the chains of `node` start.
    fn chain_heads(&self, node: NodeId) -> StoreResult<ChainHeads>;

    /// Reads up to `limit` relationships of one chain starting at pointer `from`.
    ///
    /// Fails with [`StoreError::InvalidRecord`] when the walk reaches a record
    /// that was deleted after the pointer was handed out.
    fn scan_chain(
        &self,
        node: NodeId,
        key: ChainKey,
        from: u64,
        limit: usize,
    ) -> StoreResult<ChainPage>;
}

/// A record unlinked from one of a node's chains by a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainHole {
    /// Chain the record was unlinked from.
    pub key: ChainKey,
    /// Pointer of the removed record.
    pub removed: u64,
    /// Pointer that followed it; `None` when it was the tail.
    pub next: Option<u64>,
}

/// Outcome of writing an overlay's records to the store.
#[derive(Clone, Debug, Default)]
pub struct AppliedChanges {
    /// Nodes whose sparse/dense layout is different after the write, with the new layout.
    pub layout_changes: FxHashMap<NodeId, bool>,
    /// Per node, the chain links removed by deletions, in the order they were unlinked.
    pub chain_holes: FxHashMap<NodeId, Vec<ChainHole>>,
}

impl AppliedChanges {
    /// Chain links removed from `node`'s chains.
    pub fn holes(&self, node: NodeId) -> &[ChainHole] {
        self.chain_holes.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Write-side store API: persists what a committing overlay describes.
pub trait StoreWriter: Send + Sync {
    /// Writes the records of `overlay`. Must be all-or-nothing.
    fn apply(&self, overlay: &TransactionOverlay) -> StoreResult<AppliedChanges>;
}
