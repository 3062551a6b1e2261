//! CONCLAVE - Custom Error Types
//! Defines the error hierarchy shared by the storage engine and the cluster layer.

use thiserror::Error;

/// Custom Result type for the Conclave node.
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Error types for the Conclave node.
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// I/O errors from file or socket operations (WAL, segments, connections).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire record encoding/decoding errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Data corruption detected (unparsable line, bad checksum, bad base64).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// A key was rejected before touching the WAL.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A namespace identifier contained characters outside `[A-Za-z0-9_-]`.
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),

    /// Unexpected or malformed message on a connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No live connection to the named node.
    #[error("No connection to node {0}")]
    NotConnected(String),

    /// A mutation was requested before any leader was elected.
    #[error("No leader has been elected")]
    NoLeader,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fault that requires the whole node to shut down.
    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),
}
