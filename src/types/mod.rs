#![forbid(unsafe_code)]

//! Identifier newtypes and the crate-wide error type.

use std::fmt;

use crate::storage::store::StoreError;

/// Node identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
/// Relationship identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelId(pub u64);
/// Relationship type token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub u32);
/// Property key token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropKeyId(pub u32);
/// Label token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LabelId(pub u32);
/// Transaction identifier, unique per kernel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

/// Names one cacheable entity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EntityRef {
    /// A node.
    Node(NodeId),
    /// A relationship.
    Relationship(RelId),
    /// The graph-level property container.
    Graph,
}

/// Token namespaces; names and ids are unique within one kind.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum TokenKind {
    /// Property key names.
    PropertyKey,
    /// Node labels.
    Label,
    /// Relationship type names.
    RelationshipType,
}

impl TokenKind {
    /// Short name used in log events and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::PropertyKey => "property key",
            TokenKind::Label => "label",
            TokenKind::RelationshipType => "relationship type",
        }
    }
}

/// Boxed error produced by an injected collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by cache, overlay and token operations.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// The entity does not exist in the store.
    #[error("{0} not found")]
    NotFound(EntityRef),
    /// Chain records vanished under a partial load; retrying reloads the node.
    #[error(
        "unable to load relationships of node {0}: records were deleted concurrently, please try again"
    )]
    ConcurrentlyDeleted(NodeId),
    /// The transaction already deleted the entity.
    #[error("{0} has been deleted in this transaction")]
    AlreadyDeleted(EntityRef),
    /// A token name or id collided with an existing registration.
    #[error("non-unique {kind} token {name:?} with id {id}: {conflict}")]
    NonUniqueToken {
        /// Namespace of the token.
        kind: TokenKind,
        /// Name being registered.
        name: String,
        /// Id being registered.
        id: u32,
        /// What it collided with.
        conflict: String,
    },
    /// The token creator failed to allocate ids.
    #[error("failed to create {kind} tokens {names:?}: {source}")]
    TokenCreation {
        /// Namespace of the tokens.
        kind: TokenKind,
        /// Names that were requested.
        names: Vec<String>,
        /// Creator failure.
        #[source]
        source: BoxError,
    },
    /// Reading persisted tokens failed.
    #[error("failed to load persisted {kind} tokens: {source}")]
    TokenLoad {
        /// Namespace being loaded.
        kind: TokenKind,
        /// Store failure.
        #[source]
        source: BoxError,
    },
    /// The backing store rejected an operation.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// A transaction lock could not be taken.
    #[error("lock on {resource} not acquired: {reason}")]
    Lock {
        /// Locked entity, rendered.
        resource: String,
        /// Deadlock or timeout.
        reason: &'static str,
    },
    /// Cached state contradicts itself.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl CacheError {
    /// Whether the caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::ConcurrentlyDeleted(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Node(id) => write!(f, "Node[{id}]"),
            EntityRef::Relationship(id) => write!(f, "Relationship[{id}]"),
            EntityRef::Graph => write!(f, "Graph"),
        }
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<TypeId> for u32 {
    fn from(value: TypeId) -> Self {
        value.0
    }
}

impl From<u32> for PropKeyId {
    fn from(value: u32) -> Self {
        PropKeyId(value)
    }
}

impl From<PropKeyId> for u32 {
    fn from(value: PropKeyId) -> Self {
        value.0
    }
}

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<LabelId> for u32 {
    fn from(value: LabelId) -> Self {
        value.0
    }
}

impl From<NodeId> for EntityRef {
    fn from(value: NodeId) -> Self {
        EntityRef::Node(value)
    }
}

impl From<RelId> for EntityRef {
    fn from(value: RelId) -> Self {
        EntityRef::Relationship(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let err = CacheError::NonUniqueToken {
            kind: TokenKind::Label,
            name: "Person".into(),
            id: 3,
            conflict: "name already maps to id 7".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("label"));
        assert!(msg.contains("Person"));
        assert!(msg.contains('7'));

        let err = CacheError::AlreadyDeleted(EntityRef::Node(NodeId(12)));
        assert_eq!(err.to_string(), "Node[12] has been deleted in this transaction");
    }

    #[test]
    fn only_chain_races_are_retryable() {
        assert!(CacheError::ConcurrentlyDeleted(NodeId(1)).is_retryable());
        assert!(!CacheError::NotFound(EntityRef::Graph).is_retryable());
        assert!(!CacheError::Invalid("x").is_retryable());
    }
}
