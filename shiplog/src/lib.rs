//! Distributed, replicated commit log service.
//!
//! A cluster of nodes jointly holds an ordered sequence of binary records.
//! Writes replicate through Raft consensus (OpenRaft) and land in a
//! segmented, append-only local log; reads are served locally and may lag on
//! followers. One TCP port carries both planes, split by a leading byte.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Agent ────────────────────────────┐
//! │                                                               │
//! │    TCP :rpc_port ──► Mux ──┬─► byte 1: raft stream layer      │
//! │                            └─► else:   gRPC Log service       │
//! │                                                               │
//! │    DistributedLog ──► OpenRaft ──► StateMachine ──► Log       │
//! │         ▲                              (log/ segments)        │
//! │         │ join/leave                                          │
//! │    Membership (UDP gossip)                                    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Produce routes to the leader (the client-side picker handles that),
//! Consume balances across followers. See the `shiplog-client` crate for
//! the resolver and picker.

pub mod agent;
pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod log;
pub mod raft;
pub mod server;
pub mod tls;

// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("shiplog.v1");
}

pub use agent::Agent;
pub use config::{AgentConfig, RaftTuning};
pub use error::{LogError, Result};
pub use log::{Log, SegmentConfig};
pub use raft::DistributedLog;
