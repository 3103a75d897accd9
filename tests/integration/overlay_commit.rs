#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use penumbra::storage::store::StoreWriter;
use penumbra::storage::{
    CacheOptions, CounterMetrics, Direction, EntityCache, GraphKernel, MemoryStore, NodeRef,
    OverlayMerger, PropValue, RelationshipRecord, TransactionOverlay, TypeSelector,
};
use penumbra::types::{CacheError, EntityRef, NodeId, PropKeyId, RelId, Result, TxId, TypeId};

const T: TypeId = TypeId(4);

fn rel(id: u64, start: u64, end: u64) -> RelationshipRecord {
    RelationshipRecord {
        id: RelId(id),
        start: NodeId(start),
        end: NodeId(end),
        ty: T,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    cache: Arc<EntityCache>,
    merger: OverlayMerger,
    metrics: Arc<CounterMetrics>,
}

fn fixture() -> Result<Fixture> {
    let store = Arc::new(MemoryStore::new(50));
    store.insert_node(NodeId(1), false);
    store.insert_node(NodeId(2), false);
    store.insert_relationship(rel(1, 1, 2))?;
    let metrics = Arc::new(CounterMetrics::default());
    let cache = Arc::new(EntityCache::new(
        store.clone(),
        &CacheOptions::default().metrics(metrics.clone()),
    ));
    Ok(Fixture {
        merger: OverlayMerger::new(cache.clone()),
        store,
        cache,
        metrics,
    })
}

fn walk(cache: &EntityCache, node: NodeId) -> Result<Vec<RelId>> {
    let node = cache.get_node(node)?;
    cache
        .relationships(node, Direction::Outgoing, TypeSelector::All)
        .collect()
}

fn cardinality(cache: &EntityCache, node: NodeId) -> Result<usize> {
    let node = cache.get_node(node)?;
    Ok(node.cached_degree(Direction::Both, &TypeSelector::All))
}

#[test]
fn merge_appends_when_no_reader_raced() -> Result<()> {
    let fx = fixture()?;
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(1)]);

    let mut overlay = TransactionOverlay::new(TxId(1));
    overlay.relationship_created(rel(2, 1, 2))?;
    let applied = fx.store.apply(&overlay)?;
    let report = fx.merger.commit(&overlay, &applied);

    assert_eq!(report.filter_skipped, 0);
    assert_eq!(cardinality(&fx.cache, NodeId(1))?, 2);
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(1), RelId(2)]);
    Ok(())
}

#[test]
fn merge_skips_relationships_a_reader_already_loaded() -> Result<()> {
    let fx = fixture()?;
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(1)]);

    let mut overlay = TransactionOverlay::new(TxId(1));
    overlay.relationship_created(rel(2, 1, 2))?;
    let applied = fx.store.apply(&overlay)?;

    // A reader reloads the node between the store write and the merge.
    fx.cache.evict(EntityRef::Node(NodeId(1)));
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(2), RelId(1)]);
    let before = cardinality(&fx.cache, NodeId(1))?;

    let report = fx.merger.commit(&overlay, &applied);
    assert_eq!(report.filter_skipped, 1);
    assert_eq!(fx.metrics.filter_skips.load(Ordering::Relaxed), 1);
    assert_eq!(cardinality(&fx.cache, NodeId(1))?, before);
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(2), RelId(1)]);
    Ok(())
}

#[test]
fn merge_skips_relationships_the_next_load_will_read() -> Result<()> {
    let fx = fixture()?;
    let mut overlay = TransactionOverlay::new(TxId(1));
    overlay.relationship_created(rel(2, 1, 2))?;
    let applied = fx.store.apply(&overlay)?;

    // The reader found the new chain head but has not read a batch yet.
    let node = fx.cache.get_node(NodeId(1))?;
    node.ensure_relationships(fx.cache.loader())?;
    let report = fx.merger.commit(&overlay, &applied);
    assert_eq!(report.filter_skipped, 1);

    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(2), RelId(1)]);
    Ok(())
}

#[test]
fn removals_apply_to_cached_chains() -> Result<()> {
    let fx = fixture()?;
    fx.store.insert_relationship(rel(2, 1, 2))?;
    assert_eq!(walk(&fx.cache, NodeId(1))?, vec![RelId(2), RelId(1)]);

    let mut overlay = TransactionOverlay::new(TxId(1));
    overlay.relationship_deleted(rel(2, 1, 2))?;
    overlay.relationship_created(rel(3, 2, 1))?;
    let applied = fx.store.apply(&overlay)?;
    fx.merger.commit(&overlay, &applied);

    let node = fx.cache.get_node(NodeId(1))?;
    let all: Vec<RelId> = fx
        .cache
        .relationships(node, Direction::Both, TypeSelector::All)
        .collect::<Result<_>>()?;
    assert_eq!(all, vec![RelId(1), RelId(3)]);
    Ok(())
}

#[test]
fn rollback_leaves_shared_state_identical() -> Result<()> {
    let (kernel, _store) = GraphKernel::in_memory(CacheOptions::default())?;
    let mut setup = kernel.begin_overlay();
    let a = kernel.create_node(&mut setup)?;
    let b = kernel.create_node(&mut setup)?;
    kernel.create_relationship(&mut setup, a, b, T)?;
    kernel.set_property(&mut setup, EntityRef::Node(a), PropKeyId(1), PropValue::Int(7))?;
    kernel.commit(setup)?;

    let cache = kernel.cache();
    let props_before = cache.node_properties(a)?;
    let degree_before = kernel.degree(a, Direction::Both, &TypeSelector::All, None)?;
    let node = cache.get_node(a)?;
    let sets_before = node.rel_sets(&TypeSelector::All);
    let size_before = node.size_in_bytes();

    let mut tx = kernel.begin_overlay();
    kernel.set_property(&mut tx, EntityRef::Node(a), PropKeyId(1), PropValue::Int(8))?;
    kernel.create_relationship(&mut tx, b, a, T)?;
    let first = kernel
        .relationships(a, Direction::Both, TypeSelector::All, None)?
        .next()
        .transpose()?
        .expect("committed relationship");
    kernel.delete_relationship(&mut tx, first)?;
    kernel.rollback(tx);

    let node_after = cache.get_node(a)?;
    assert!(Arc::ptr_eq(&node, &node_after));
    assert!(Arc::ptr_eq(&props_before, &cache.node_properties(a)?));
    let sets_after = node_after.rel_sets(&TypeSelector::All);
    assert_eq!(sets_before.len(), sets_after.len());
    for (before, after) in sets_before.iter().zip(&sets_after) {
        assert!(Arc::ptr_eq(before, after));
    }
    assert_eq!(node_after.size_in_bytes(), size_before);
    assert_eq!(
        kernel.degree(a, Direction::Both, &TypeSelector::All, None)?,
        degree_before
    );
    Ok(())
}

#[test]
fn dense_transition_evicts_the_node() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let options = CacheOptions::default()
        .dense_node_threshold(3)
        .metrics(metrics.clone());
    let (kernel, store) = GraphKernel::in_memory(options)?;

    let mut setup = kernel.begin_overlay();
    let hub = kernel.create_node(&mut setup)?;
    let other = kernel.create_node(&mut setup)?;
    kernel.create_relationship(&mut setup, hub, other, T)?;
    kernel.create_relationship(&mut setup, other, hub, T)?;
    kernel.commit(setup)?;

    let NodeRef::Committed(sparse) = kernel.get_node(hub, None)? else {
        panic!("hub is committed");
    };
    assert!(!sparse.is_dense());
    assert_eq!(kernel.degree(hub, Direction::Both, &TypeSelector::All, None)?, 2);

    let mut tx = kernel.begin_overlay();
    kernel.create_relationship(&mut tx, hub, hub, T)?;
    let report = kernel.commit(tx)?;
    assert_eq!(store.is_dense(hub), Some(true));
    assert!(report.nodes_evicted >= 1);
    assert!(kernel.cache().node_if_cached(hub).is_none());
    assert!(metrics.layout_evictions.load(Ordering::Relaxed) >= 1);

    let NodeRef::Committed(dense) = kernel.get_node(hub, None)? else {
        panic!("hub is committed");
    };
    assert!(dense.is_dense());
    assert!(!Arc::ptr_eq(&sparse, &dense));
    assert_eq!(kernel.degree(hub, Direction::Both, &TypeSelector::All, None)?, 3);
    Ok(())
}

#[test]
fn mutations_after_delete_fail() -> Result<()> {
    let (kernel, _store) = GraphKernel::in_memory(CacheOptions::default())?;
    let mut setup = kernel.begin_overlay();
    let a = kernel.create_node(&mut setup)?;
    let b = kernel.create_node(&mut setup)?;
    let r = kernel.create_relationship(&mut setup, a, b, T)?;
    kernel.commit(setup)?;

    let mut tx = kernel.begin_overlay();
    kernel.delete_relationship(&mut tx, r)?;
    let err = kernel.delete_relationship(&mut tx, r).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyDeleted(EntityRef::Relationship(_))));
    let err = kernel
        .set_property(&mut tx, EntityRef::Relationship(r), PropKeyId(0), PropValue::Bool(true))
        .unwrap_err();
    assert!(matches!(err, CacheError::AlreadyDeleted(_)));
    assert!(matches!(
        kernel.get_relationship(r, Some(&tx)),
        Err(CacheError::NotFound(_))
    ));
    assert_eq!(kernel.degree(a, Direction::Both, &TypeSelector::All, Some(&tx))?, 0);
    kernel.commit(tx)?;
    assert_eq!(kernel.degree(a, Direction::Both, &TypeSelector::All, None)?, 0);
    Ok(())
}

#[test]
fn failed_store_write_leaves_the_cache_alone() -> Result<()> {
    let (kernel, store) = GraphKernel::in_memory(CacheOptions::default())?;
    let mut setup = kernel.begin_overlay();
    let a = kernel.create_node(&mut setup)?;
    kernel.commit(setup)?;
    let props = kernel.cache().node_properties(a)?;

    let mut tx = kernel.begin_overlay();
    kernel.set_property(&mut tx, EntityRef::Node(a), PropKeyId(3), PropValue::from("x"))?;
    store.fail_next_applies(1);
    let err = kernel.commit(tx).unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert!(Arc::ptr_eq(&props, &kernel.cache().node_properties(a)?));
    assert_eq!(kernel.get_property(EntityRef::Node(a), PropKeyId(3), None)?, None);
    Ok(())
}
