//! CONCLAVE - MemTable (In-Memory Sorted Map)
//! The write buffer of an LSM engine. Every accepted mutation lands here
//! right after its WAL record and stays until the next flush.

use std::collections::BTreeMap;

use crate::types::{Key, Record};

/// In-memory sorted table of records backed by a BTreeMap.
/// Tombstones are kept so a flush can shadow older segments.
#[derive(Debug, Default)]
pub struct MemTable {
    entries: BTreeMap<Key, Record>,
    /// Approximate size of keys and values in bytes.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a value, replacing whatever the key held before.
    pub fn insert(&mut self, key: Key, value: String) {
        self.apply(key, Record::Value(value));
    }

    /// Mark a key as deleted.
    pub fn delete(&mut self, key: Key) {
        self.apply(key, Record::Tombstone);
    }

    /// Store a record; the last write for a key wins.
    pub fn apply(&mut self, key: Key, record: Record) {
        let added = key.len() + record.size();
        if let Some(old) = self.entries.get(&key) {
            self.size_bytes = self.size_bytes.saturating_sub(key.len() + old.size());
        }
        self.size_bytes += added;
        self.entries.insert(key, record);
    }

    /// Look up the record for a key, tombstones included.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.entries.get(key)
    }

    /// Iterate over all records in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Record)> {
        self.entries.iter()
    }

    /// Drop every entry (after a successful flush).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut mt = MemTable::new();
        mt.insert("name".into(), "conclave".into());
        assert_eq!(mt.get("name"), Some(&Record::Value("conclave".into())));
        assert_eq!(mt.get("missing"), None);
    }

    #[test]
    fn test_tombstone_is_tracked() {
        let mut mt = MemTable::new();
        mt.insert("k".into(), "v".into());
        mt.delete("k".into());
        assert_eq!(mt.get("k"), Some(&Record::Tombstone));
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_size_accounting() {
        let mut mt = MemTable::new();
        mt.insert("ab".into(), "cde".into());
        assert_eq!(mt.size(), 5);
        mt.insert("ab".into(), "z".into());
        assert_eq!(mt.size(), 3);
        mt.delete("ab".into());
        assert_eq!(mt.size(), 2);
        mt.clear();
        assert_eq!(mt.size(), 0);
        assert!(mt.is_empty());
    }

    #[test]
    fn test_iteration_is_sorted() {
        let mut mt = MemTable::new();
        for key in ["c", "a", "b"] {
            mt.insert(key.into(), key.into());
        }
        let keys: Vec<&str> = mt.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
