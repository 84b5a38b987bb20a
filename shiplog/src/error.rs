//! Error types for log and cluster operations.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, LogError>;

/// Errors that can occur in log and cluster operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// The requested offset is not present in the local log.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The offset that was requested.
        offset: u64,
    },

    /// Read past the last index entry (or from an empty index).
    #[error("end of index")]
    EndOfIndex,

    /// Configuration-change attempted on a non-leader.
    #[error("not the leader, leader is node {leader:?}")]
    NotLeader {
        /// The current leader if known.
        leader: Option<u64>,
    },

    /// The subject is not permitted to perform the action.
    #[error("{subject} not permitted to {action} to {object}")]
    PermissionDenied {
        /// Authenticated subject.
        subject: String,
        /// Target object.
        object: String,
        /// Attempted action.
        action: String,
    },

    /// Consensus submission did not complete in time.
    #[error("apply timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Raft consensus error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Dial/accept/TLS failure on the replication plane.
    #[error("transport error: {0}")]
    Transport(String),

    /// Record or metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for LogError {
    fn from(e: prost::DecodeError) -> Self {
        LogError::Serialization(e.to_string())
    }
}

impl From<LogError> for tonic::Status {
    fn from(e: LogError) -> Self {
        match e {
            LogError::OffsetOutOfRange { .. } => tonic::Status::out_of_range(e.to_string()),
            LogError::PermissionDenied { .. } => tonic::Status::permission_denied(e.to_string()),
            LogError::NotLeader { .. } => tonic::Status::failed_precondition(e.to_string()),
            LogError::Timeout(_) => tonic::Status::deadline_exceeded(e.to_string()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

impl LogError {
    /// Whether this error means the offset has simply not arrived locally
    /// yet, so a streaming reader should wait and retry.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, LogError::OffsetOutOfRange { .. })
    }
}
