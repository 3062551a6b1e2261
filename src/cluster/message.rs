//! CONCLAVE - Wire Messages
//! Records exchanged between nodes, plus their two encodings.
//!
//! ## Stream Frame (point-to-point)
//! ```text
//! [len: 4 bytes (LE)][bincode payload: len bytes]
//! ```
//!
//! ## Datagram (broadcast)
//! ```text
//! [crc32 of payload: 4 bytes (LE)][bincode payload]
//! ```

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};
use crate::types::NodeIdentity;

/// Largest payload accepted on a stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest payload that fits a UDP datagram after the checksum.
pub const MAX_DATAGRAM_LEN: usize = 65_507 - 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello {
        node_id: String,
        address: String,
        port: u16,
        version: String,
    },
    RequestLeader {
        node_id: String,
        address: String,
        port: u16,
    },
    RequestLeaderVote {
        epoch: u64,
        node_id: String,
        address: String,
        port: u16,
    },
    LeaderVote {
        vote: u64,
        epoch: u64,
        node_id: String,
        address: String,
        port: u16,
    },
    LeaderElected {
        epoch: u64,
        node_id: String,
        address: String,
        port: u16,
    },
    LeaderAnnouncement {
        leader_node_id: String,
        from_node_id: String,
    },
    StorageSet {
        namespace: String,
        key: String,
        value: String,
        from_node_id: String,
    },
    RequestStorageSet {
        namespace: String,
        key: String,
        value: String,
        from_node_id: String,
    },
    StorageDelete {
        namespace: String,
        key: String,
        from_node_id: String,
    },
    RequestStorageDelete {
        namespace: String,
        key: String,
        from_node_id: String,
    },
}

impl Message {
    pub fn hello(identity: &NodeIdentity, version: &str) -> Self {
        Message::Hello {
            node_id: identity.id.clone(),
            address: identity.address.clone(),
            port: identity.port,
            version: version.to_string(),
        }
    }

    pub fn request_leader(identity: &NodeIdentity) -> Self {
        Message::RequestLeader {
            node_id: identity.id.clone(),
            address: identity.address.clone(),
            port: identity.port,
        }
    }

    pub fn request_vote(identity: &NodeIdentity, epoch: u64) -> Self {
        Message::RequestLeaderVote {
            epoch,
            node_id: identity.id.clone(),
            address: identity.address.clone(),
            port: identity.port,
        }
    }

    pub fn vote(identity: &NodeIdentity, epoch: u64, vote: u64) -> Self {
        Message::LeaderVote {
            vote,
            epoch,
            node_id: identity.id.clone(),
            address: identity.address.clone(),
            port: identity.port,
        }
    }

    pub fn elected(identity: &NodeIdentity, epoch: u64) -> Self {
        Message::LeaderElected {
            epoch,
            node_id: identity.id.clone(),
            address: identity.address.clone(),
            port: identity.port,
        }
    }

    /// Short record name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::RequestLeader { .. } => "RequestLeader",
            Message::RequestLeaderVote { .. } => "RequestLeaderVote",
            Message::LeaderVote { .. } => "LeaderVote",
            Message::LeaderElected { .. } => "LeaderElected",
            Message::LeaderAnnouncement { .. } => "LeaderAnnouncement",
            Message::StorageSet { .. } => "StorageSet",
            Message::RequestStorageSet { .. } => "RequestStorageSet",
            Message::StorageDelete { .. } => "StorageDelete",
            Message::RequestStorageDelete { .. } => "RequestStorageDelete",
        }
    }

    /// Identifier of the node that produced this record.
    pub fn sender(&self) -> &str {
        match self {
            Message::Hello { node_id, .. }
            | Message::RequestLeader { node_id, .. }
            | Message::RequestLeaderVote { node_id, .. }
            | Message::LeaderVote { node_id, .. }
            | Message::LeaderElected { node_id, .. } => node_id,
            Message::LeaderAnnouncement { from_node_id, .. }
            | Message::StorageSet { from_node_id, .. }
            | Message::RequestStorageSet { from_node_id, .. }
            | Message::StorageDelete { from_node_id, .. }
            | Message::RequestStorageDelete { from_node_id, .. } => from_node_id,
        }
    }

    /// Advertised listener address of the sender, for records that carry one.
    pub fn source(&self) -> Option<(&str, u16)> {
        match self {
            Message::Hello { address, port, .. }
            | Message::RequestLeader { address, port, .. }
            | Message::RequestLeaderVote { address, port, .. }
            | Message::LeaderVote { address, port, .. }
            | Message::LeaderElected { address, port, .. } => Some((address.as_str(), *port)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Encode a message as a length-prefixed frame.
pub fn encode_frame(message: &Message) -> Result<BytesMut> {
    let payload = message.encode()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ConclaveError::Protocol(format!(
            "{} record of {} bytes exceeds frame limit",
            message.kind(),
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

pub fn write_frame(writer: &mut impl Write, message: &Message) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `None` when the stream ends before a new frame starts.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Message>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut cursor = &header[..];
    let len = cursor.get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(ConclaveError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Message::decode(&payload).map(Some)
}

/// Encode a message as a checksummed broadcast datagram.
pub fn encode_datagram(message: &Message) -> Result<Vec<u8>> {
    let payload = message.encode()?;
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(ConclaveError::Protocol(format!(
            "{} record of {} bytes does not fit a datagram",
            message.kind(),
            payload.len()
        )));
    }
    let mut datagram = BytesMut::with_capacity(4 + payload.len());
    datagram.put_u32_le(crc32fast::hash(&payload));
    datagram.put_slice(&payload);
    Ok(datagram.to_vec())
}

pub fn decode_datagram(datagram: &[u8]) -> Result<Message> {
    if datagram.len() < 4 {
        return Err(ConclaveError::Corruption(format!(
            "datagram of {} bytes is too short",
            datagram.len()
        )));
    }
    let (mut header, payload) = datagram.split_at(4);
    let expected = header.get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(ConclaveError::Corruption(format!(
            "datagram checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    Message::decode(payload)
}
