use std::fmt;

use smallvec::SmallVec;

use crate::types::{NodeId, PropKeyId, RelId, TypeId};

/// Property value with owned data.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Homogeneous integer array.
    IntArray(Vec<i64>),
}

impl PropValue {
    /// Approximate heap footprint of the value, excluding the enum itself.
    pub fn heap_size(&self) -> usize {
        match self {
            PropValue::Str(s) => s.capacity(),
            PropValue::Bytes(b) => b.capacity(),
            PropValue::IntArray(v) => v.capacity() * std::mem::size_of::<i64>(),
            _ => 0,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "null"),
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            PropValue::IntArray(v) => write!(f, "int[](len={})", v.len()),
        }
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

/// Direction selector used by relationship queries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Relationships starting at the node (loops included).
    Outgoing,
    /// Relationships ending at the node (loops included).
    Incoming,
    /// Every relationship of the node.
    Both,
}

impl Direction {
    /// Chain directions a query in this direction has to visit, loops last.
    pub fn chain_directions(self) -> &'static [RelDirection] {
        match self {
            Direction::Outgoing => &[RelDirection::Outgoing, RelDirection::Loop],
            Direction::Incoming => &[RelDirection::Incoming, RelDirection::Loop],
            Direction::Both => &[
                RelDirection::Outgoing,
                RelDirection::Incoming,
                RelDirection::Loop,
            ],
        }
    }

    /// Whether relationships stored under `dir` are visible to this query.
    pub fn matches(self, dir: RelDirection) -> bool {
        match (self, dir) {
            (Direction::Both, _) | (_, RelDirection::Loop) => true,
            (Direction::Outgoing, RelDirection::Outgoing) => true,
            (Direction::Incoming, RelDirection::Incoming) => true,
            _ => false,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
            Direction::Both => "both",
        }
    }
}

/// How a relationship hangs off one particular node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RelDirection {
    /// The node is the start node.
    Outgoing,
    /// The node is the end node.
    Incoming,
    /// Start and end node are the same node.
    Loop,
}

impl RelDirection {
    /// All chain directions in loading order for dense nodes (loops first).
    pub const LOAD_ORDER: [RelDirection; 3] = [
        RelDirection::Loop,
        RelDirection::Outgoing,
        RelDirection::Incoming,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            RelDirection::Outgoing => 0,
            RelDirection::Incoming => 1,
            RelDirection::Loop => 2,
        }
    }
}

/// The relationship types a query is interested in.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub enum TypeSelector {
    /// Every type, including types not seen yet.
    #[default]
    All,
    /// Only the listed types.
    Only(SmallVec<[TypeId; 4]>),
}

impl TypeSelector {
    /// Builds a selector over `types`, dropping duplicates.
    pub fn only(types: &[TypeId]) -> Self {
        let mut list: SmallVec<[TypeId; 4]> = SmallVec::new();
        for ty in types {
            if !list.contains(ty) {
                list.push(*ty);
            }
        }
        TypeSelector::Only(list)
    }

    /// Whether `ty` is selected.
    pub fn includes(&self, ty: TypeId) -> bool {
        match self {
            TypeSelector::All => true,
            TypeSelector::Only(list) => list.contains(&ty),
        }
    }
}

/// Light relationship record as kept by the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelationshipRecord {
    /// Relationship id.
    pub id: RelId,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
    /// Relationship type.
    pub ty: TypeId,
}

impl RelationshipRecord {
    /// Direction of this relationship as seen from `node`.
    pub fn direction_from(&self, node: NodeId) -> RelDirection {
        if self.start == self.end {
            RelDirection::Loop
        } else if self.start == node {
            RelDirection::Outgoing
        } else {
            RelDirection::Incoming
        }
    }
}

/// Light node record as kept by the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeRecord {
    /// Node id.
    pub id: NodeId,
    /// Whether the node's relationships live in per-(type, direction) chains.
    pub dense: bool,
}

/// Property entries as handed out by the store: unsorted, possibly malformed.
pub type PropertyRecords = Vec<(PropKeyId, PropValue)>;
