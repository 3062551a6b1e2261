//! CONCLAVE - Transport Contract
//! What the election protocol and the replication path need from the network.

use std::sync::Arc;

use crate::error::Result;

use super::broadcast::BroadcastChannel;
use super::connection::ConnectionDirectory;
use super::message::Message;

/// Reliable point-to-point sends plus best-effort broadcast.
pub trait Transport: Send + Sync {
    /// Best effort; failures are logged, never returned.
    fn broadcast(&self, message: &Message);

    /// Send to one connected peer.
    fn send(&self, node_id: &str, message: &Message) -> Result<()>;

    /// Ids of currently connected peers.
    fn connected_peers(&self) -> Vec<String>;

    fn is_connected(&self, node_id: &str) -> bool;
}

/// Transport over the node's TCP connections and UDP broadcast channel.
pub struct NetworkTransport {
    connections: Arc<ConnectionDirectory>,
    broadcast: Arc<BroadcastChannel>,
}

impl NetworkTransport {
    pub fn new(connections: Arc<ConnectionDirectory>, broadcast: Arc<BroadcastChannel>) -> Self {
        Self {
            connections,
            broadcast,
        }
    }
}

impl Transport for NetworkTransport {
    fn broadcast(&self, message: &Message) {
        if let Err(e) = self.broadcast.send(message) {
            log::warn!("broadcast of {} failed: {}", message.kind(), e);
        }
    }

    fn send(&self, node_id: &str, message: &Message) -> Result<()> {
        self.connections.send(node_id, message)
    }

    fn connected_peers(&self) -> Vec<String> {
        self.connections.connected_ids()
    }

    fn is_connected(&self, node_id: &str) -> bool {
        self.connections.is_connected(node_id)
    }
}
