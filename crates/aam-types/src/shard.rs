//! Hash ranges and shard configuration sets (`spec.md` §3).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::AamError;

/// A closed interval `[start, end]` of 32-bit signed hash codes owned by one
/// shard group. `hash_code = start` and `hash_code = end` are both in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    /// Inclusive lower bound.
    pub start: i32,
    /// Inclusive upper bound.
    pub end: i32,
}

impl HashRange {
    /// Constructs a range, swapping `start`/`end` if given out of order.
    pub fn new(start: i32, end: i32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// The full 32-bit range, used by shard groups that are not split.
    pub const FULL: HashRange = HashRange { start: i32::MIN, end: i32::MAX };

    /// True iff `hash_code` lies within `[start, end]` inclusive.
    pub fn contains(&self, hash_code: i32) -> bool {
        self.start <= hash_code && hash_code <= self.end
    }

    /// True iff `other` is entirely contained within `self`.
    pub fn contains_range(&self, other: HashRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True iff `self` and `other` share no hash codes.
    pub fn is_disjoint_from(&self, other: HashRange) -> bool {
        self.end < other.start || other.end < self.start
    }
}

/// The data-element kind a shard configuration entry routes, per `spec.md`
/// §3 ("A set of `ShardConfiguration{data_element, operation, ...}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardDataElement {
    /// User shard group.
    User,
    /// Group shard group.
    Group,
    /// Group-to-group mapping shard group.
    GroupToGroupMapping,
}

/// Whether a configuration entry routes queries or event writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardOperation {
    /// Read-path routing.
    Query,
    /// Write-path routing.
    Event,
}

/// One routing entry: `(data_element, operation, hash_range_start)` is the
/// key; duplicates on that key are rejected by `ShardConfigurationSet::new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfiguration {
    /// Which data element this entry routes.
    pub data_element: ShardDataElement,
    /// Whether this entry routes queries or events.
    pub operation: ShardOperation,
    /// Inclusive lower bound of the hash range this entry owns.
    pub hash_range_start: i32,
    /// Inclusive upper bound of the hash range this entry owns.
    pub hash_range_end: i32,
    /// Network address of the shard-group node serving this range.
    pub client_endpoint: String,
}

impl ShardConfiguration {
    /// The `(data_element, operation, hash_range_start)` key used for
    /// duplicate detection and lookups.
    fn key(&self) -> (ShardDataElement, ShardOperation, i32) {
        (self.data_element, self.operation, self.hash_range_start)
    }

    /// The hash range this entry owns.
    pub fn hash_range(&self) -> HashRange {
        HashRange::new(self.hash_range_start, self.hash_range_end)
    }
}

/// A set of shard configurations. Construction rejects duplicate
/// `(data_element, operation, hash_range_start)` keys; two sets compare
/// equal iff they contain the same tuples, order-insensitive (`spec.md` §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardConfigurationSet {
    entries: Vec<ShardConfiguration>,
}

impl ShardConfigurationSet {
    /// Builds a configuration set from `entries`, rejecting duplicate keys.
    pub fn new(entries: Vec<ShardConfiguration>) -> Result<Self, AamError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.key()) {
                return Err(AamError::DuplicateShardConfiguration {
                    data_element: format!("{:?}", entry.data_element),
                    operation: format!("{:?}", entry.operation),
                    hash_range_start: entry.hash_range_start,
                });
            }
        }
        Ok(Self { entries })
    }

    /// All entries in this set.
    pub fn entries(&self) -> &[ShardConfiguration] {
        &self.entries
    }

    /// Finds the entry that owns `hash_code` for `data_element`/`operation`.
    pub fn lookup(&self, data_element: ShardDataElement, operation: ShardOperation, hash_code: i32) -> Option<&ShardConfiguration> {
        self.entries
            .iter()
            .filter(|e| e.data_element == data_element && e.operation == operation)
            .find(|e| e.hash_range().contains(hash_code))
    }

    /// Replaces the entry at `old_key` with `new_entry`, as performed by the
    /// splitter/merger when the config switch step runs (`spec.md` §4.7/4.8).
    pub fn replace(&mut self, old_key: (ShardDataElement, ShardOperation, i32), new_entry: ShardConfiguration) {
        self.entries.retain(|e| e.key() != old_key);
        self.entries.push(new_entry);
    }

    /// Appends a brand-new entry (used when a split introduces a target
    /// shard group that previously had no configuration entry at all).
    pub fn insert(&mut self, entry: ShardConfiguration) -> Result<(), AamError> {
        if self.entries.iter().any(|e| e.key() == entry.key()) {
            return Err(AamError::DuplicateShardConfiguration {
                data_element: format!("{:?}", entry.data_element),
                operation: format!("{:?}", entry.operation),
                hash_range_start: entry.hash_range_start,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Removes every entry whose key matches `old_key`.
    pub fn remove(&mut self, old_key: (ShardDataElement, ShardOperation, i32)) {
        self.entries.retain(|e| e.key() != old_key);
    }
}

impl PartialEq for ShardConfigurationSet {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        let mut mine: Vec<&ShardConfiguration> = self.entries.iter().collect();
        let mut theirs: Vec<&ShardConfiguration> = other.entries.iter().collect();
        let sort_key = |e: &&ShardConfiguration| (format!("{:?}", e.data_element), format!("{:?}", e.operation), e.hash_range_start);
        mine.sort_by_key(sort_key);
        theirs.sort_by_key(sort_key);
        mine == theirs
    }
}
