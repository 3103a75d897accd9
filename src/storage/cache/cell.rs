use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::Result;

/// Lazily loaded, atomically replaced piece of cached state.
///
/// Readers clone the current `Arc` under a short read lock. The first load
/// runs under the owning entity's gate and re-checks the cell after taking
/// it, so concurrent first readers load once.
#[derive(Debug)]
pub struct LazyCell<T> {
    value: RwLock<Option<Arc<T>>>,
}

impl<T> Default for LazyCell<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }
}

impl<T> LazyCell<T> {
    /// An unloaded cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell holding `value`.
    pub fn loaded(value: T) -> Self {
        Self {
            value: RwLock::new(Some(Arc::new(value))),
        }
    }

    /// Current value, if loaded.
    pub fn get(&self) -> Option<Arc<T>> {
        self.value.read().clone()
    }

    /// Whether the cell holds a value.
    pub fn is_loaded(&self) -> bool {
        self.value.read().is_some()
    }

    /// Returns the value, running `load` under `gate` if the cell is empty.
    pub fn get_or_try_load<F>(&self, gate: &Mutex<()>, load: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let _gate = gate.lock();
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let value = Arc::new(load()?);
        *self.value.write() = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Replaces a loaded value with `f(current)`; an unloaded cell stays unloaded.
    ///
    /// Callers serialize updates through the entity gate.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let Some(current) = self.get() else {
            return false;
        };
        let next = Arc::new(f(&current));
        *self.value.write() = Some(next);
        true
    }
}
