use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;

use crate::storage::types::{PropValue, PropertyRecords};
use crate::types::{CacheError, PropKeyId, Result};

/// Property container of one cached entity, sorted by key id.
///
/// Instances are never mutated after construction; commits build a new array
/// and swap it in, so readers holding the old `Arc` keep a stable view.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyArray {
    entries: Vec<(PropKeyId, PropValue)>,
}

impl PropertyArray {
    /// An array with no properties.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorts store records by key, rejecting duplicate keys.
    pub fn from_records(mut records: PropertyRecords) -> Result<Self> {
        records.sort_by_key(|(key, _)| *key);
        if records.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(CacheError::Corruption("duplicate property key in record"));
        }
        records.shrink_to_fit();
        Ok(Self { entries: records })
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the array holds no properties.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary-searches `key`.
    pub fn get(&self, key: PropKeyId) -> Option<&PropValue> {
        self.entries
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: PropKeyId) -> bool {
        self.get(key).is_some()
    }

    /// Entry at `idx` in key order.
    pub fn entry(&self, idx: usize) -> Option<&(PropKeyId, PropValue)> {
        self.entries.get(idx)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &(PropKeyId, PropValue)> + '_ {
        self.entries.iter()
    }

    /// Returns a new array with `add` upserted and `remove` dropped.
    ///
    /// A key present in both maps ends up with the added value.
    pub fn with_changes(
        &self,
        add: &BTreeMap<PropKeyId, PropValue>,
        remove: &BTreeSet<PropKeyId>,
    ) -> Self {
        let mut merged = Vec::with_capacity(self.entries.len() + add.len());
        let mut adds = add.iter().peekable();
        for (key, value) in &self.entries {
            while let Some((add_key, add_value)) = adds.next_if(|(k, _)| *k < key) {
                merged.push((*add_key, add_value.clone()));
            }
            if let Some((_, add_value)) = adds.next_if(|(k, _)| *k == key) {
                merged.push((*key, add_value.clone()));
                continue;
            }
            if remove.contains(key) {
                continue;
            }
            merged.push((*key, value.clone()));
        }
        merged.extend(adds.map(|(k, v)| (*k, v.clone())));
        Self { entries: merged }
    }

    /// Bytes retained by the array, heap values included.
    pub fn size_in_bytes(&self) -> usize {
        let slots = self.entries.capacity() * size_of::<(PropKeyId, PropValue)>();
        let heap: usize = self.entries.iter().map(|(_, v)| v.heap_size()).sum();
        size_of::<Self>() + slots + heap
    }
}
