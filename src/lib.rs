//! Penumbra: the in-process entity cache and transactional overlay of a
//! graph database kernel.
//!
//! Readers share one [`storage::EntityCache`]; writers stage changes in a
//! per-transaction [`storage::TransactionOverlay`] and fold them into the
//! cache on commit. Token namespaces resolve names to ids and create missing
//! tokens atomically.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{CacheOptions, GraphKernel};
pub use types::{CacheError, Result};
