#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use penumbra::storage::cache::LoadStatus;
use penumbra::storage::{
    CacheOptions, Direction, EntityCache, GraphKernel, MemoryStore, RelDirection,
    RelationshipRecord, TypeSelector,
};
use penumbra::types::{CacheError, NodeId, RelId, Result, TypeId};

const KNOWS: TypeId = TypeId(1);
const LIKES: TypeId = TypeId(2);

fn rel(id: u64, start: u64, end: u64, ty: TypeId) -> RelationshipRecord {
    RelationshipRecord {
        id: RelId(id),
        start: NodeId(start),
        end: NodeId(end),
        ty,
    }
}

fn setup(dense_threshold: usize, batch: usize) -> (Arc<MemoryStore>, EntityCache) {
    let store = Arc::new(MemoryStore::new(dense_threshold));
    for id in 0..10 {
        store.insert_node(NodeId(id), false);
    }
    let cache = EntityCache::new(
        store.clone(),
        &CacheOptions::default().chain_batch_size(batch),
    );
    (store, cache)
}

#[test]
fn five_relationships_in_batches_of_two() -> Result<()> {
    let (store, cache) = setup(100, 2);
    for id in 1..=5 {
        store.insert_relationship(rel(id, 1, id + 1, KNOWS))?;
    }
    let node = cache.get_node(NodeId(1))?;
    let only_knows = TypeSelector::only(&[KNOWS]);
    assert!(node.has_more(Direction::Outgoing, &only_knows));

    let ids: Vec<RelId> = cache
        .relationships(node.clone(), Direction::Outgoing, only_knows.clone())
        .collect::<Result<_>>()?;
    let distinct: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(distinct.len(), 5);
    assert!(!node.has_more(Direction::Outgoing, &only_knows));
    assert_eq!(store.scans(), 3);

    // Fully loaded chains are served without touching the store again.
    let again: Vec<RelId> = cache
        .relationships(node, Direction::Outgoing, only_knows)
        .collect::<Result<_>>()?;
    assert_eq!(again, ids);
    assert_eq!(store.scans(), 3);
    Ok(())
}

#[test]
fn batches_populate_the_relationship_cache() -> Result<()> {
    let (store, cache) = setup(100, 10);
    store.insert_relationship(rel(1, 1, 2, KNOWS))?;
    store.insert_relationship(rel(2, 3, 1, LIKES))?;
    let node = cache.get_node(NodeId(1))?;
    assert_eq!(
        cache.load_more(&node, Direction::Both, &TypeSelector::All)?,
        LoadStatus::LoadedEnd
    );
    let cached = cache
        .relationship_if_cached(RelId(2))
        .expect("loaded by the chain batch");
    assert_eq!(cached.other_node(NodeId(1)), Some(NodeId(3)));
    assert_eq!(
        cache.load_more(&node, Direction::Both, &TypeSelector::All)?,
        LoadStatus::Nothing
    );
    Ok(())
}

#[test]
fn dense_nodes_resolve_loops_first() -> Result<()> {
    let (store, cache) = setup(3, 1);
    store.insert_relationship(rel(1, 1, 2, KNOWS))?;
    store.insert_relationship(rel(2, 3, 1, KNOWS))?;
    store.insert_relationship(rel(3, 1, 1, KNOWS))?;
    assert_eq!(store.is_dense(NodeId(1)), Some(true));

    let node = cache.get_node(NodeId(1))?;
    assert!(node.is_dense());
    assert_eq!(
        cache.load_more(&node, Direction::Both, &TypeSelector::All)?,
        LoadStatus::LoadedMore
    );
    let set = node.rel_set(KNOWS).expect("loop batch cached");
    assert_eq!(set.block(RelDirection::Loop), &[RelId(3)]);
    assert!(set.block(RelDirection::Outgoing).is_empty());
    assert!(set.block(RelDirection::Incoming).is_empty());

    // The wildcard selector still sees the partial incoming chain.
    assert!(node.has_more(Direction::Incoming, &TypeSelector::All));
    assert!(!node.has_more(Direction::Incoming, &TypeSelector::only(&[LIKES])));

    let outgoing: Vec<RelId> = cache
        .relationships(node.clone(), Direction::Outgoing, TypeSelector::All)
        .collect::<Result<_>>()?;
    assert_eq!(outgoing, vec![RelId(3), RelId(1)]);
    assert!(node.has_more(Direction::Incoming, &TypeSelector::All));
    assert_eq!(cache.degree(NodeId(1), Direction::Both, &TypeSelector::All)?, 3);
    Ok(())
}

#[test]
fn a_single_vanished_record_is_retried() -> Result<()> {
    let (store, cache) = setup(100, 2);
    for id in 1..=3 {
        store.insert_relationship(rel(id, 1, 2, KNOWS))?;
    }
    store.fail_next_scans(1);
    let node = cache.get_node(NodeId(1))?;
    let ids: Vec<RelId> = cache
        .relationships(node, Direction::Both, TypeSelector::All)
        .collect::<Result<_>>()?;
    assert_eq!(ids, vec![RelId(3), RelId(2), RelId(1)]);
    Ok(())
}

#[test]
fn deletion_mid_walk_surfaces_a_retryable_error() -> Result<()> {
    let (store, cache) = setup(100, 2);
    for id in 1..=4 {
        store.insert_relationship(rel(id, 1, 2, KNOWS))?;
    }
    let node = cache.get_node(NodeId(1))?;
    let mut walk = cache.relationships(node.clone(), Direction::Both, TypeSelector::All);
    assert_eq!(walk.next().transpose()?, Some(RelId(4)));
    assert_eq!(walk.next().transpose()?, Some(RelId(3)));

    // The next batch starts at relationship 2, which another writer removes.
    store.delete_relationship(RelId(2))?;
    let err = walk
        .next()
        .expect("walk reports the failure")
        .expect_err("record vanished twice");
    assert!(matches!(err, CacheError::ConcurrentlyDeleted(NodeId(1))));
    assert!(err.is_retryable());
    assert!(walk.next().is_none());

    // The stale entry is gone, so a retry reloads against the current chain.
    assert!(cache.node_if_cached(NodeId(1)).is_none());
    let fresh = cache.get_node(NodeId(1))?;
    assert!(!Arc::ptr_eq(&node, &fresh));
    let ids: Vec<RelId> = cache
        .relationships(fresh, Direction::Both, TypeSelector::All)
        .collect::<Result<_>>()?;
    assert_eq!(ids, vec![RelId(4), RelId(3), RelId(1)]);
    Ok(())
}

/// Kernel reading in batches of two, with node `a` holding four outgoing
/// relationships. Ids are returned newest first, which is chain order.
fn kernel_with_chain() -> Result<(GraphKernel, NodeId, Vec<RelId>)> {
    let (kernel, _store) = GraphKernel::in_memory(CacheOptions::default().chain_batch_size(2))?;
    let mut tx = kernel.begin_overlay();
    let a = kernel.create_node(&mut tx)?;
    let b = kernel.create_node(&mut tx)?;
    let mut rels = (0..4)
        .map(|_| kernel.create_relationship(&mut tx, a, b, KNOWS))
        .collect::<Result<Vec<_>>>()?;
    kernel.commit(tx)?;
    rels.sort_unstable_by(|x, y| y.cmp(x));
    Ok((kernel, a, rels))
}

#[test]
fn committed_delete_of_the_next_unread_record_keeps_walks_working() -> Result<()> {
    let (kernel, a, rels) = kernel_with_chain()?;
    let head: Vec<RelId> = kernel
        .relationships(a, Direction::Both, TypeSelector::All, None)?
        .take(2)
        .collect::<Result<_>>()?;
    assert_eq!(head, rels[..2]);

    let mut tx = kernel.begin_overlay();
    kernel.delete_relationship(&mut tx, rels[2])?;
    kernel.commit(tx)?;

    // The cached node stays and its position moved past the deleted record.
    assert!(kernel.cache().node_if_cached(a).is_some());
    for _ in 0..2 {
        let ids: Vec<RelId> = kernel
            .relationships(a, Direction::Both, TypeSelector::All, None)?
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![rels[0], rels[1], rels[3]]);
    }
    assert_eq!(kernel.degree(a, Direction::Both, &TypeSelector::All, None)?, 3);
    Ok(())
}

#[test]
fn committed_delete_of_the_tail_ends_the_chain() -> Result<()> {
    let (kernel, a, rels) = kernel_with_chain()?;
    let mut walk = kernel.relationships(a, Direction::Both, TypeSelector::All, None)?;
    assert_eq!(walk.next().transpose()?, Some(rels[0]));
    assert_eq!(walk.next().transpose()?, Some(rels[1]));

    let mut tx = kernel.begin_overlay();
    kernel.delete_relationship(&mut tx, rels[2])?;
    kernel.delete_relationship(&mut tx, rels[3])?;
    kernel.commit(tx)?;

    assert_eq!(walk.next().transpose()?, None);
    let node = kernel.cache().node_if_cached(a).expect("still cached");
    assert!(!node.has_more(Direction::Both, &TypeSelector::All));
    Ok(())
}

#[test]
fn committed_delete_behind_a_live_walk_skips_nothing() -> Result<()> {
    let (kernel, a, rels) = kernel_with_chain()?;
    let mut walk = kernel.relationships(a, Direction::Both, TypeSelector::All, None)?;
    let mut seen = vec![
        walk.next().transpose()?.expect("first"),
        walk.next().transpose()?.expect("second"),
    ];

    let mut tx = kernel.begin_overlay();
    kernel.delete_relationship(&mut tx, rels[0])?;
    kernel.commit(tx)?;

    for id in walk {
        seen.push(id?);
    }
    assert_eq!(seen, rels);
    let after: Vec<RelId> = kernel
        .relationships(a, Direction::Both, TypeSelector::All, None)?
        .collect::<Result<_>>()?;
    assert_eq!(after, rels[1..]);
    Ok(())
}

#[test]
fn missing_nodes_are_not_found() {
    let (_store, cache) = setup(100, 2);
    let err = cache.get_node(NodeId(99)).expect_err("node 99 does not exist");
    assert!(matches!(err, CacheError::NotFound(_)));
    assert!(!err.is_retryable());
}
