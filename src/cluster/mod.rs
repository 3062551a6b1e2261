//! CONCLAVE - Cluster Module
//! Peer discovery, leader election and leader-routed replication.
//!
//! ## Layers
//! ```text
//! Node ── StorageAgent ──┐
//!      └─ QuorumAgent ───┴─ Transport ── ConnectionDirectory (TCP frames)
//!                                     └─ BroadcastChannel    (UDP datagrams)
//! ```

pub mod broadcast;
pub mod connection;
pub mod message;
pub mod node;
pub mod pool;
pub mod quorum;
pub mod replication;
pub mod system;
pub mod transport;

pub use message::Message;
pub use node::{Node, NodeFault};
pub use quorum::{Event, LeaderQuorum, QuorumAgent, QuorumState, QuorumStatus};
pub use replication::StorageAgent;
pub use transport::Transport;
