use std::sync::Arc;

use tracing::{debug, trace};

use crate::storage::cache::{EntityCache, RelationshipCommit};
use crate::storage::overlay::{NodeDelta, TransactionOverlay};
use crate::storage::store::AppliedChanges;
use crate::types::{EntityRef, NodeId, TxId};

/// What a commit did to the shared cache.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CommitReport {
    /// Cached nodes whose state absorbed the commit.
    pub nodes_merged: usize,
    /// Cached nodes dropped because they were deleted or changed layout.
    pub nodes_evicted: usize,
    /// Cached relationships dropped because they were deleted.
    pub relationships_evicted: usize,
    /// Relationship blocks refused by the race filter.
    pub filter_skipped: usize,
}

/// Folds committed overlays into the shared entity cache.
///
/// Only entities that are already cached are touched; anything else is read
/// from the store on first access, where the committed records already live.
pub struct OverlayMerger {
    cache: Arc<EntityCache>,
}

impl OverlayMerger {
    /// Merger folding commits into `cache`.
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self { cache }
    }

    /// Applies `overlay` to the cache after the store accepted it.
    ///
    /// Must run while the transaction still holds its write locks.
    pub fn commit(&self, overlay: &TransactionOverlay, applied: &AppliedChanges) -> CommitReport {
        let mut report = CommitReport::default();
        for (id, delta) in overlay.node_deltas() {
            self.commit_node(id, delta, applied, &mut report);
        }
        for (id, delta) in overlay.relationship_deltas() {
            let Some(rel) = self.cache.relationship_if_cached(id) else {
                continue;
            };
            let entity = EntityRef::Relationship(id);
            if delta.entity().is_deleted() {
                if self.cache.evict(entity) {
                    report.relationships_evicted += 1;
                }
                continue;
            }
            if delta.entity().has_property_changes() {
                rel.commit_properties(
                    delta.entity().added_properties(),
                    delta.entity().removed_properties(),
                );
                self.cache.resized(entity, rel.size_in_bytes());
            }
        }
        if let Some(delta) = overlay.graph_delta() {
            if delta.has_property_changes() {
                let graph = self.cache.graph();
                graph.commit_properties(delta.added_properties(), delta.removed_properties());
                self.cache.resized(EntityRef::Graph, graph.size_in_bytes());
            }
        }
        self.cache.metrics().commit_merged();
        debug!(
            tx = overlay.tx().0,
            merged = report.nodes_merged,
            evicted = report.nodes_evicted,
            skipped = report.filter_skipped,
            "cache.commit.merged"
        );
        report
    }

    fn commit_node(
        &self,
        id: NodeId,
        delta: &NodeDelta,
        applied: &AppliedChanges,
        report: &mut CommitReport,
    ) {
        let Some(node) = self.cache.node_if_cached(id) else {
            return;
        };
        if delta.entity().is_deleted() {
            if self.cache.evict(EntityRef::Node(id)) {
                report.nodes_evicted += 1;
            }
            return;
        }
        let dense = applied
            .layout_changes
            .get(&id)
            .copied()
            .unwrap_or_else(|| node.is_dense());
        match node.commit_relationship_maps(
            delta.relationship_additions(),
            delta.relationship_removals(),
            delta.first_ids(),
            applied.holes(id),
            dense,
        ) {
            RelationshipCommit::Evict => {
                if self.cache.evict_for_layout(id) {
                    report.nodes_evicted += 1;
                }
                return;
            }
            RelationshipCommit::NotLoaded => {}
            RelationshipCommit::Merged { skipped } => {
                for _ in 0..skipped {
                    self.cache.metrics().filter_skipped();
                }
                report.filter_skipped += skipped;
            }
        }
        let props = delta.entity();
        if props.has_property_changes() {
            node.commit_properties(props.added_properties(), props.removed_properties());
        }
        if delta.has_label_changes() {
            node.commit_labels(delta.added_labels(), delta.removed_labels());
        }
        report.nodes_merged += 1;
        self.cache.resized(EntityRef::Node(id), node.size_in_bytes());
    }

    /// Discards `overlay`; the shared cache never saw its changes.
    pub fn rollback(&self, overlay: TransactionOverlay) -> TxId {
        trace!(tx = overlay.tx().0, "cache.commit.rollback");
        overlay.tx()
    }
}
