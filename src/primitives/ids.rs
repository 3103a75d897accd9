//! Id allocation for new entities and tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::TokenKind;

/// What an id is allocated for; each kind has its own id space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IdKind {
    /// Node ids.
    Node,
    /// Relationship ids.
    Relationship,
    /// Token ids of one namespace.
    Token(TokenKind),
}

impl IdKind {
    fn slot(self) -> usize {
        match self {
            IdKind::Node => 0,
            IdKind::Relationship => 1,
            IdKind::Token(TokenKind::PropertyKey) => 2,
            IdKind::Token(TokenKind::Label) => 3,
            IdKind::Token(TokenKind::RelationshipType) => 4,
        }
    }
}

/// Hands out fresh ids.
pub trait IdGenerator: Send + Sync {
    /// Allocates the next unused id of `kind`.
    fn next_id(&self, kind: IdKind) -> u64;
}

/// Monotonic counters, one per id space.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: [AtomicU64; 5],
}

impl SequentialIds {
    /// Counters that all start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure ids of `kind` are allocated above `used`.
    pub fn mark_used(&self, kind: IdKind, used: u64) {
        self.next[kind.slot()].fetch_max(used.saturating_add(1), Ordering::AcqRel);
    }

    /// Next id `kind` would hand out, without allocating it.
    pub fn peek(&self, kind: IdKind) -> u64 {
        self.next[kind.slot()].load(Ordering::Acquire)
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self, kind: IdKind) -> u64 {
        self.next[kind.slot()].fetch_add(1, Ordering::AcqRel)
    }
}
