use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

/// Id-keyed map split across independently locked shards.
pub(crate) struct ShardedMap<K, V> {
    shards: Vec<RwLock<FxHashMap<K, Arc<V>>>>,
}

impl<K: Hash + Eq + Copy, V> ShardedMap<K, V> {
    pub(crate) fn new(shards: usize) -> Self {
        let shard_count = shards.max(1);
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(RwLock::new(FxHashMap::default()));
        }
        Self { shards: shard_vec }
    }

    pub(crate) fn get(&self, key: K) -> Option<Arc<V>> {
        self.shard_for(key).read().get(&key).cloned()
    }

    /// Inserts `value` unless `key` is present; returns whichever entry ends up mapped.
    pub(crate) fn get_or_insert(&self, key: K, value: Arc<V>) -> (Arc<V>, bool) {
        let mut guard = self.shard_for(key).write();
        match guard.get(&key) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                guard.insert(key, Arc::clone(&value));
                (value, true)
            }
        }
    }

    pub(crate) fn remove(&self, key: K) -> Option<Arc<V>> {
        self.shard_for(key).write().remove(&key)
    }

    pub(crate) fn contains(&self, key: K) -> bool {
        self.shard_for(key).read().contains_key(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Empties every shard and returns the keys that were mapped.
    pub(crate) fn drain(&self) -> Vec<K> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.write().drain().map(|(key, _)| key));
        }
        keys
    }

    fn shard_for(&self, key: K) -> &RwLock<FxHashMap<K, Arc<V>>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}
