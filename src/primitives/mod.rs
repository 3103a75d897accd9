//! Collaborator primitives the cache relies on.
//!
//! Includes the lock manager contract with an in-process implementation,
//! striped load locks, and id allocation.

/// Lock manager contract, in-process lock manager and striped load locks.
pub mod concurrency;

/// Id generators for entities and tokens.
pub mod ids;
