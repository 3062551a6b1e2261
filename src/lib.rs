//! CONCLAVE - Self-Organizing Key-Value Peer
//!
//! Every node keeps its own LSM-Tree storage and joins its peers in a
//! leader election; writes are routed through the elected leader, which
//! applies them locally and replicates them to everyone it is connected to.
//!
//! ## Features
//! - **Write-Ahead Log (WAL)**: base64 line records, replayed on open
//! - **MemTable**: In-memory BTreeMap with tombstones
//! - **SSTable**: Immutable sorted segments with a lazy sparse index
//! - **Compaction**: Oldest-pair linear merge, newer record wins
//! - **Namespaces**: One engine per namespace, opened on first use
//! - **Leader Quorum**: Epoch-numbered random-vote elections
//! - **Replication**: Leader fan-out over length-prefixed TCP frames
//! - **Discovery**: UDP broadcast of `Hello` records
//!
//! ## Example
//! ```no_run
//! use conclave::{config::Config, engine::LsmTree};
//!
//! let engine = LsmTree::open(Config::default(), "users").unwrap();
//!
//! engine.put("key", "value").unwrap();
//! assert_eq!(engine.get("key").unwrap(), Some("value".to_string()));
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use error::{ConclaveError, Result};
