use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::types::EntityRef;

/// Size-driven eviction decisions plugged into the entity cache.
///
/// The cache reports every size change and asks for victims; it never decides
/// on its own which entries to drop.
pub trait EvictionHook: Send + Sync {
    /// Records that `entity` now retains `bytes`; returns entities to evict.
    fn on_resize(&self, entity: EntityRef, bytes: usize) -> Vec<EntityRef>;

    /// Records a cache hit on `entity`.
    fn on_access(&self, _entity: EntityRef) {}

    /// Records that `entity` left the cache.
    fn on_evict(&self, entity: EntityRef);
}

struct LruState {
    entries: LruCache<EntityRef, usize>,
    used: usize,
}

/// Byte-budgeted least-recently-used policy.
pub struct LruPolicy {
    budget: usize,
    state: Mutex<LruState>,
}

impl LruPolicy {
    /// Creates a policy that keeps tracked entities under `budget_bytes`.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget: budget_bytes,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    /// Byte budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes currently accounted to tracked entities.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    /// Number of tracked entities.
    pub fn tracked(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl EvictionHook for LruPolicy {
    fn on_resize(&self, entity: EntityRef, bytes: usize) -> Vec<EntityRef> {
        let mut state = self.state.lock();
        if let Some(previous) = state.entries.put(entity, bytes) {
            state.used -= previous;
        }
        state.used += bytes;
        // `entity` is the most recent entry, so it is never popped while others remain.
        let mut victims = Vec::new();
        while state.used > self.budget && state.entries.len() > 1 {
            let Some((victim, size)) = state.entries.pop_lru() else {
                break;
            };
            state.used -= size;
            victims.push(victim);
        }
        if !victims.is_empty() {
            debug!(count = victims.len(), used = state.used, budget = self.budget, "cache.policy.evict");
        }
        victims
    }

    fn on_access(&self, entity: EntityRef) {
        self.state.lock().entries.promote(&entity);
    }

    fn on_evict(&self, entity: EntityRef) {
        let mut state = self.state.lock();
        if let Some(size) = state.entries.pop(&entity) {
            state.used -= size;
        }
    }
}
