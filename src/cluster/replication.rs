//! CONCLAVE - Replicated Storage
//! Leader-routed writes on top of the namespace storage directory.
//!
//! The leader applies a mutation locally and fans it out to every connected
//! peer without waiting for acknowledgement. A follower forwards the request
//! to the leader. Replicated mutations from any peer are applied as received.

use std::sync::Arc;

use crate::engine::directory::StorageDirectory;
use crate::error::{ConclaveError, Result};
use crate::types::Namespace;

use super::message::Message;
use super::quorum::StatusHandle;
use super::transport::Transport;

/// A mutation routed through the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mutation {
    Set(String),
    Delete,
}

pub struct StorageAgent {
    local_id: String,
    storage: Arc<StorageDirectory>,
    transport: Arc<dyn Transport>,
    quorum: StatusHandle,
}

impl StorageAgent {
    pub fn new(
        local_id: impl Into<String>,
        storage: Arc<StorageDirectory>,
        transport: Arc<dyn Transport>,
        quorum: StatusHandle,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            storage,
            transport,
            quorum,
        }
    }

    pub fn storage(&self) -> &Arc<StorageDirectory> {
        &self.storage
    }

    /// Read from local storage.
    pub fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<String>> {
        self.storage.get(namespace, key)
    }

    pub fn set(&self, namespace: &Namespace, key: &str, value: &str) -> Result<()> {
        self.route(namespace, key, Mutation::Set(value.to_string()), None)
    }

    pub fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        self.route(namespace, key, Mutation::Delete, None)
    }

    /// Apply locally if we lead, else forward to the leader.
    /// `origin` is the peer that forwarded the request to us, if any.
    fn route(
        &self,
        namespace: &Namespace,
        key: &str,
        mutation: Mutation,
        origin: Option<&str>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(ConclaveError::InvalidKey("key must not be empty".into()));
        }
        let leader = self.quorum.leader().ok_or(ConclaveError::NoLeader)?;

        if leader == self.local_id {
            self.apply(namespace, key, &mutation)?;
            self.fan_out(namespace, key, &mutation);
            return Ok(());
        }
        if origin == Some(leader.as_str()) {
            return Err(ConclaveError::Protocol(format!(
                "{leader} forwarded a write to us but we believe it leads"
            )));
        }

        let request = match &mutation {
            Mutation::Set(value) => Message::RequestStorageSet {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.clone(),
                from_node_id: self.local_id.clone(),
            },
            Mutation::Delete => Message::RequestStorageDelete {
                namespace: namespace.to_string(),
                key: key.to_string(),
                from_node_id: self.local_id.clone(),
            },
        };
        log::debug!("forwarding {} {}/{} to leader {}", request.kind(), namespace, key, leader);
        self.transport.send(&leader, &request)
    }

    fn apply(&self, namespace: &Namespace, key: &str, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Set(value) => self.storage.set(namespace, key, value),
            Mutation::Delete => self.storage.delete(namespace, key),
        }
    }

    /// Fire-and-forget replication to every connected peer.
    fn fan_out(&self, namespace: &Namespace, key: &str, mutation: &Mutation) {
        let message = match mutation {
            Mutation::Set(value) => Message::StorageSet {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.clone(),
                from_node_id: self.local_id.clone(),
            },
            Mutation::Delete => Message::StorageDelete {
                namespace: namespace.to_string(),
                key: key.to_string(),
                from_node_id: self.local_id.clone(),
            },
        };
        for peer in self.transport.connected_peers() {
            if let Err(e) = self.transport.send(&peer, &message) {
                log::warn!("replicating {} to {} failed: {}", message.kind(), peer, e);
            }
        }
    }

    /// Handle a storage record from a peer. Returns false for non-storage records.
    ///
    /// Replicated writes are applied without checking that the sender leads.
    pub fn handle_message(&self, message: &Message) -> bool {
        let (namespace, key, mutation, request) = match message {
            Message::StorageSet {
                namespace,
                key,
                value,
                ..
            } => (namespace, key, Mutation::Set(value.clone()), false),
            Message::StorageDelete { namespace, key, .. } => (namespace, key, Mutation::Delete, false),
            Message::RequestStorageSet {
                namespace,
                key,
                value,
                ..
            } => (namespace, key, Mutation::Set(value.clone()), true),
            Message::RequestStorageDelete { namespace, key, .. } => {
                (namespace, key, Mutation::Delete, true)
            }
            _ => return false,
        };

        let namespace = match Namespace::parse(namespace) {
            Ok(namespace) => namespace,
            Err(e) => {
                log::warn!("dropping {} from {}: {}", message.kind(), message.sender(), e);
                return true;
            }
        };
        let result = if request {
            self.route(&namespace, key, mutation, Some(message.sender()))
        } else {
            self.apply(&namespace, key, &mutation)
        };
        if let Err(e) = result {
            log::error!(
                "{} {}/{} from {} failed: {}",
                message.kind(),
                namespace,
                key,
                message.sender(),
                e
            );
        }
        true
    }
}
