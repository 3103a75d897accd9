//! Lock manager contract, the in-process lock manager and striped load locks.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHasher};
use tracing::trace;

use crate::types::{CacheError, EntityRef, Result, TxId};

/// Lock strength requested on a resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockMode {
    /// Shared lock; compatible with other readers.
    Read,
    /// Exclusive lock.
    Write,
}

impl LockMode {
    fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

/// Entity-level lock coordinator used by transactions before they touch their overlay.
pub trait LockManager: Send + Sync {
    /// Blocks until `tx` holds `mode` on `resource`, or fails.
    fn acquire(&self, tx: TxId, resource: EntityRef, mode: LockMode) -> Result<()>;

    /// Releases one hold of `mode` on `resource` by `tx`.
    fn release(&self, tx: TxId, resource: EntityRef, mode: LockMode) -> Result<()>;
}

#[derive(Default, Debug)]
struct LockState {
    readers: FxHashMap<TxId, u32>,
    writer: Option<(TxId, u32)>,
}

impl LockState {
    fn grantable(&self, tx: TxId, mode: LockMode) -> bool {
        let writer_ok = self.writer.map_or(true, |(owner, _)| owner == tx);
        match mode {
            LockMode::Read => writer_ok,
            LockMode::Write => writer_ok && self.readers.keys().all(|reader| *reader == tx),
        }
    }

    fn grant(&mut self, tx: TxId, mode: LockMode) {
        match mode {
            LockMode::Read => *self.readers.entry(tx).or_insert(0) += 1,
            LockMode::Write => match &mut self.writer {
                Some((_, holds)) => *holds += 1,
                None => self.writer = Some((tx, 1)),
            },
        }
    }

    fn revoke(&mut self, tx: TxId, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => match self.readers.get_mut(&tx) {
                Some(holds) => {
                    *holds -= 1;
                    if *holds == 0 {
                        self.readers.remove(&tx);
                    }
                    true
                }
                None => false,
            },
            LockMode::Write => match &mut self.writer {
                Some((owner, holds)) if *owner == tx => {
                    *holds -= 1;
                    if *holds == 0 {
                        self.writer = None;
                    }
                    true
                }
                _ => false,
            },
        }
    }

    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

/// Snapshot of one resource's holders, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockSnapshot {
    /// Number of transactions holding a read lock.
    pub readers: usize,
    /// Whether a transaction holds the write lock.
    pub writer: bool,
}

/// In-process readers/writer lock manager.
///
/// Locks are re-entrant per transaction, and a transaction that is the only
/// reader may upgrade to a write lock. Waits are bounded by `timeout`.
pub struct LocalLockManager {
    table: Mutex<FxHashMap<EntityRef, LockState>>,
    released: Condvar,
    timeout: Duration,
}

impl LocalLockManager {
    /// Creates a lock manager whose waits give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(FxHashMap::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Returns the current holders of `resource`.
    pub fn snapshot(&self, resource: EntityRef) -> LockSnapshot {
        let table = self.table.lock();
        table
            .get(&resource)
            .map(|state| LockSnapshot {
                readers: state.readers.len(),
                writer: state.writer.is_some(),
            })
            .unwrap_or_default()
    }

    /// Number of resources with at least one holder.
    pub fn held_resources(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl LockManager for LocalLockManager {
    fn acquire(&self, tx: TxId, resource: EntityRef, mode: LockMode) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        loop {
            let state = table.entry(resource).or_default();
            if state.grantable(tx, mode) {
                state.grant(tx, mode);
                trace!(tx = tx.0, %resource, mode = mode.as_str(), "lock.acquire");
                return Ok(());
            }
            if self.released.wait_until(&mut table, deadline).timed_out() {
                let state = table.entry(resource).or_default();
                if state.grantable(tx, mode) {
                    state.grant(tx, mode);
                    return Ok(());
                }
                if state.is_free() {
                    table.remove(&resource);
                }
                return Err(CacheError::Lock {
                    resource: resource.to_string(),
                    reason: "timed out waiting for lock",
                });
            }
        }
    }

    fn release(&self, tx: TxId, resource: EntityRef, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        let Some(state) = table.get_mut(&resource) else {
            return Err(CacheError::Lock {
                resource: resource.to_string(),
                reason: "lock not held",
            });
        };
        if !state.revoke(tx, mode) {
            return Err(CacheError::Lock {
                resource: resource.to_string(),
                reason: "lock not held",
            });
        }
        if state.is_free() {
            table.remove(&resource);
        }
        drop(table);
        self.released.notify_all();
        trace!(tx = tx.0, %resource, mode = mode.as_str(), "lock.release");
        Ok(())
    }
}

/// Fixed set of mutexes that serialize first-time loads of the same entity.
pub struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedLocks {
    /// Creates `count` stripes (at least one).
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let mut stripes = Vec::with_capacity(count);
        for _ in 0..count {
            stripes.push(Mutex::new(()));
        }
        Self { stripes }
    }

    /// Locks the stripe owning `key`.
    pub fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].lock()
    }

    /// Number of stripes.
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Always false; a striped lock has at least one stripe.
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}
