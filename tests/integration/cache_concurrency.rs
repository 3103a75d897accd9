#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use penumbra::storage::{
    CacheOptions, CounterMetrics, Direction, EntityCache, GraphKernel, MemoryStore, TypeSelector,
};
use penumbra::types::{NodeId, RelId, Result, TypeId};
use rand::Rng;
use tracing_subscriber::EnvFilter;

const THREADS: usize = 8;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn concurrent_misses_load_one_entry() -> Result<()> {
    init_tracing();
    let store = Arc::new(MemoryStore::new(50));
    store.insert_node(NodeId(42), false);
    let metrics = Arc::new(CounterMetrics::default());
    let options = CacheOptions::default().metrics(metrics.clone());
    let cache = Arc::new(EntityCache::new(store, &options));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_node(NodeId(42))
            })
        })
        .collect();
    let nodes = handles
        .into_iter()
        .map(|handle| handle.join().expect("loader thread"))
        .collect::<Result<Vec<_>>>()?;

    for node in &nodes[1..] {
        assert!(Arc::ptr_eq(&nodes[0], node), "every caller sees the same entry");
    }
    assert_eq!(metrics.node_misses.load(Ordering::Relaxed), 1);
    assert_eq!(
        metrics.node_hits.load(Ordering::Relaxed) as usize,
        THREADS - 1
    );
    assert_eq!(cache.cached_nodes(), 1);
    Ok(())
}

#[test]
fn readers_never_see_duplicates_while_writers_commit() -> Result<()> {
    init_tracing();
    let (kernel, _store) = GraphKernel::in_memory(CacheOptions::default().chain_batch_size(3))?;
    let kernel = Arc::new(kernel);
    let mut setup = kernel.begin_overlay();
    let hub = kernel.create_node(&mut setup)?;
    let spokes: Vec<NodeId> = (0..4)
        .map(|_| kernel.create_node(&mut setup))
        .collect::<Result<_>>()?;
    kernel.commit(setup)?;

    const COMMITS: usize = 60;
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<usize> {
                let mut walks = 0;
                while !done.load(Ordering::Acquire) {
                    let mut seen = HashSet::new();
                    for id in kernel.relationships(hub, Direction::Both, TypeSelector::All, None)? {
                        match id {
                            Ok(id) => assert!(seen.insert(id), "relationship yielded twice"),
                            // The node switched to dense chains under this walk.
                            Err(err) if err.is_retryable() => break,
                            Err(err) => return Err(err),
                        }
                    }
                    walks += 1;
                    if rand::thread_rng().gen_bool(0.2) {
                        kernel.evict(penumbra::types::EntityRef::Node(hub));
                    }
                }
                Ok(walks)
            })
        })
        .collect();

    let mut created = Vec::with_capacity(COMMITS);
    for i in 0..COMMITS {
        let mut tx = kernel.begin_overlay();
        let other = spokes[i % spokes.len()];
        let ty = TypeId((i % 3) as u32);
        let rel = if i % 2 == 0 {
            kernel.create_relationship(&mut tx, hub, other, ty)?
        } else {
            kernel.create_relationship(&mut tx, other, hub, ty)?
        };
        created.push(rel);
        kernel.commit(tx)?;
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader thread")?;
    }

    let mut final_walk: Vec<RelId> = kernel
        .relationships(hub, Direction::Both, TypeSelector::All, None)?
        .collect::<Result<_>>()?;
    final_walk.sort();
    created.sort();
    assert_eq!(final_walk, created);
    assert_eq!(
        kernel.degree(hub, Direction::Both, &TypeSelector::All, None)?,
        COMMITS
    );
    Ok(())
}
