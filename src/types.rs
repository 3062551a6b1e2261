//! CONCLAVE - Core Type Definitions
//! Defines fundamental types used across the storage engine and the cluster layer.

use std::fmt;
use std::str::FromStr;

use crate::error::{ConclaveError, Result};

/// Key type for the storage engine.
pub type Key = String;

/// Value type for the storage engine.
pub type Value = String;

/// A single mutation as tracked by the memtable and written to disk.
/// `Tombstone` records a deletion that must shadow older segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Value(Value),
    Tombstone,
}

impl Record {
    /// Returns true if this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Record::Tombstone)
    }

    /// Returns the live value, if any.
    pub fn value(&self) -> Option<&str> {
        match self {
            Record::Value(value) => Some(value),
            Record::Tombstone => None,
        }
    }

    /// Approximate in-memory size of the payload.
    pub fn size(&self) -> usize {
        self.value().map_or(0, str::len)
    }
}

/// Result of a point lookup against a single segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The segment has no record for the key.
    Absent,
    /// The segment records the key as deleted.
    Tombstone,
    /// The segment holds a live value.
    Value(Value),
}

/// Existence-only variant of [`Lookup`]; never decodes the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Tombstone,
    Present,
}

/// Isolation key selecting an independent storage keyspace.
///
/// Only `[A-Za-z0-9_-]` characters are accepted; the empty namespace is valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    /// Parse and validate a namespace identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConclaveError::InvalidNamespace(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File stem used for this namespace's WAL and segments.
    /// The empty namespace maps to `.default`, which no valid namespace can spell.
    pub fn file_stem(&self) -> &str {
        if self.0.is_empty() {
            ".default"
        } else {
            &self.0
        }
    }
}

impl FromStr for Namespace {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a node identifies itself to peers: its id plus the address its
/// point-to-point listener is reachable on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_accepts_valid_characters() {
        let ns = Namespace::parse("Users_2024-eu").unwrap();
        assert_eq!(ns.as_str(), "Users_2024-eu");
        assert_eq!(ns.file_stem(), "Users_2024-eu");
    }

    #[test]
    fn test_namespace_rejects_invalid_characters() {
        for raw in ["a/b", "a.b", "with space", "../etc", "ünïcode"] {
            assert!(
                matches!(Namespace::parse(raw), Err(ConclaveError::InvalidNamespace(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_namespace_has_reserved_stem() {
        let ns: Namespace = "".parse().unwrap();
        assert_eq!(ns.file_stem(), ".default");
        assert_eq!(ns.to_string(), "");
    }

    #[test]
    fn test_record_accessors() {
        let live = Record::Value("abc".to_string());
        assert_eq!(live.value(), Some("abc"));
        assert_eq!(live.size(), 3);
        assert!(!live.is_tombstone());
        assert!(Record::Tombstone.is_tombstone());
        assert_eq!(Record::Tombstone.value(), None);
    }
}
