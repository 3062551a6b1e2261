//! CONCLAVE - Configuration
//! Tunable parameters for the storage engine and for a cluster node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a storage engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding WAL and segment files.
    pub data_dir: PathBuf,

    /// Fraction of a segment's size between two sparse index samples.
    /// `0.1` samples roughly every 10% of the file.
    pub index_ratio: f64,

    /// Whether to sync WAL writes to disk immediately (fsync).
    pub sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            index_ratio: 0.1,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the sparse index sampling ratio.
    pub fn with_index_ratio(mut self, ratio: f64) -> Self {
        self.index_ratio = ratio;
        self
    }

    /// Enable or disable fsync on every WAL append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifier to assign on first start; a UUID is generated when absent.
    pub identifier: Option<String>,

    /// Version string announced in `Hello` records.
    pub version: String,

    /// Root directory for namespace storage.
    pub data_store_path: PathBuf,

    /// Directory of the node's own system store (identity, lifecycle).
    pub system_store_path: PathBuf,

    /// Address the point-to-point listener binds and advertises.
    pub system_address: String,

    /// Port of the point-to-point listener; `0` picks an ephemeral port.
    pub system_port: u16,

    /// Local socket receiving broadcast datagrams.
    pub broadcast_bind: SocketAddr,

    /// Destinations of outgoing broadcasts (a multicast group or a peer list).
    pub broadcast_targets: Vec<SocketAddr>,

    /// Time a voting round may take before it is abandoned.
    pub election_timeout: Duration,

    /// Reconnect attempts after a peer drops.
    pub reconnect_attempts: u32,

    /// Delay before the first reconnect attempt; doubled after each failure.
    pub reconnect_delay: Duration,

    /// Size of the worker pool used for connection attempts.
    pub worker_threads: usize,

    /// Fsync WAL appends for namespace and system stores.
    pub sync_writes: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_store_path: PathBuf::from("./data/namespaces"),
            system_store_path: PathBuf::from("./data/system"),
            system_address: "127.0.0.1".to_string(),
            system_port: 21000,
            broadcast_bind: SocketAddr::from(([0, 0, 0, 0], 21012)),
            broadcast_targets: vec![SocketAddr::from(([239, 255, 42, 99], 21012))],
            election_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            worker_threads: 4,
            sync_writes: true,
        }
    }
}

impl NodeConfig {
    /// Create a node configuration rooted at `root` (`root/namespaces`, `root/system`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_store_path: root.join("namespaces"),
            system_store_path: root.join("system"),
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = Some(id.into());
        self
    }

    pub fn with_system_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.system_address = address.into();
        self.system_port = port;
        self
    }

    pub fn with_broadcast(mut self, bind: SocketAddr, targets: Vec<SocketAddr>) -> Self {
        self.broadcast_bind = bind;
        self.broadcast_targets = targets;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Storage configuration for namespace engines.
    pub fn storage(&self) -> Config {
        Config::new(&self.data_store_path).with_sync_writes(self.sync_writes)
    }

    /// Storage configuration for the system store.
    pub fn system_storage(&self) -> Config {
        Config::new(&self.system_store_path).with_sync_writes(self.sync_writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_paths_follow_root() {
        let config = NodeConfig::new("/tmp/node-a");
        assert_eq!(config.storage().data_dir, PathBuf::from("/tmp/node-a/namespaces"));
        assert_eq!(config.system_storage().data_dir, PathBuf::from("/tmp/node-a/system"));
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.election_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_attempts, 5);
        assert!(Config::default().sync_writes);
        assert!((Config::default().index_ratio - 0.1).abs() < f64::EPSILON);
    }
}
