//! Type definitions for the OpenRaft integration.
//!
//! OpenRaft requires a type configuration naming the concrete application
//! data and response types; everything else (node id, entry, snapshot data)
//! uses the defaults.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Node ID type for the cluster.
pub type NodeId = u64;

/// Commands replicated through consensus. The enum tag is the request-kind
/// discriminant; `Append` carries the raw record payload, and the offset is
/// assigned by the state machine when the entry is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogCommand {
    Append {
        /// Record payload bytes.
        value: Vec<u8>,
    },
}

/// Response produced by applying a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Offset assigned to an appended record.
    pub offset: Option<u64>,
}

openraft::declare_raft_types!(
    /// OpenRaft type configuration for the replicated log.
    pub TypeConfig:
        D = LogCommand,
        R = CommandResponse,
);

/// Type alias for the Raft instance.
pub type LogRaft = openraft::Raft<TypeConfig>;

/// Type alias for a log entry.
pub type RaftEntry = openraft::Entry<TypeConfig>;

/// Type alias for a log ID.
pub type RaftLogId = openraft::LogId<NodeId>;

/// Type alias for a vote.
pub type RaftVote = openraft::Vote<NodeId>;

/// Type alias for stored membership.
pub type RaftStoredMembership = openraft::StoredMembership<NodeId, openraft::BasicNode>;

/// Type alias for snapshot metadata.
pub type RaftSnapshotMeta = openraft::SnapshotMeta<NodeId, openraft::BasicNode>;

/// Type alias for a snapshot.
pub type RaftSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for storage errors.
pub type StorageErr = openraft::StorageError<NodeId>;

/// Type alias for client write errors.
pub type WriteError = openraft::error::ClientWriteError<NodeId, openraft::BasicNode>;

/// Type alias for raft errors carrying a client write error.
pub type RaftWriteError = openraft::error::RaftError<NodeId, WriteError>;

/// Derive the numeric node id from a cluster-unique node name. Decimal names
/// map directly; anything else hashes with FNV-1a so every node computes the
/// same id without coordination.
pub fn node_id_for(name: &str) -> NodeId {
    if let Ok(id) = name.parse::<u64>() {
        return id;
    }
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for b in name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
