//! The replicated log: a local [`Log`] driven by an OpenRaft instance.
//!
//! Writes go through consensus and are applied to every node's local log in
//! the committed order; reads are served locally without a consensus
//! round-trip and may lag the leader.

mod log_store;
mod state_machine;
pub mod stable;
pub mod stream;
pub mod types;

pub use log_store::LogStore;
pub use state_machine::StateMachine;

use crate::config::{AgentConfig, RaftTuning};
use crate::error::{LogError, Result};
use crate::log::{Log, SegmentConfig};
use crate::proto::{Record, Server};
use crate::raft::stream::{
    read_frame, write_frame, RaftNetworkClient, RaftReply, RaftRequest, StreamLayer,
};
use crate::raft::types::{
    node_id_for, LogCommand, LogRaft, NodeId, RaftWriteError, WriteError,
};
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, Config, Raft, SnapshotPolicy};
use stable::StableStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Timeout applied to every consensus submission.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A commit log whose appends are replicated by consensus.
pub struct DistributedLog {
    node_id: NodeId,
    node_name: String,
    log: Arc<Log>,
    raft_log: Arc<Log>,
    raft: LogRaft,
}

impl DistributedLog {
    /// Build the consensus stack under `data_dir`: the application log at
    /// `log/`, the consensus write-ahead log at `raft/log/`, the stable
    /// store at `raft/stable/`, snapshots at `raft/snapshots/`, and a raft
    /// RPC server consuming connections routed by the multiplexer.
    pub async fn new(
        config: &AgentConfig,
        raft_incoming: mpsc::Receiver<TcpStream>,
    ) -> Result<Arc<Self>> {
        let data_dir = &config.data_dir;
        let node_id = node_id_for(&config.node_name);

        let log = Arc::new(Log::open(data_dir.join("log"), config.segment.clone())?);

        // The consensus log is an independent offset space; OpenRaft assigns
        // the first entry index 0.
        let raft_log_config = SegmentConfig {
            initial_offset: 0,
            ..config.segment.clone()
        };
        let raft_log = Arc::new(Log::open(data_dir.join("raft").join("log"), raft_log_config)?);
        let stable = Arc::new(StableStore::open(data_dir.join("raft").join("stable"))?);
        let log_store = LogStore::new(Arc::clone(&raft_log), stable);

        let state_machine = Arc::new(StateMachine::open(
            Arc::clone(&log),
            data_dir.join("raft"),
        )?);

        let layer = Arc::new(StreamLayer::new(
            config.server_tls.clone(),
            config.peer_tls.clone(),
        ));
        let network = RaftNetworkClient::new(Arc::clone(&layer));

        let raft_config = Arc::new(
            raft_tuning_to_config(&config.raft)
                .validate()
                .map_err(|e| LogError::Config(e.to_string()))?,
        );

        let raft = Raft::new(
            node_id,
            raft_config,
            network,
            log_store,
            Arc::clone(&state_machine),
        )
        .await
        .map_err(|e| LogError::Raft(format!("failed to create raft: {:?}", e)))?;

        let this = Arc::new(Self {
            node_id,
            node_name: config.node_name.clone(),
            log,
            raft_log,
            raft,
        });

        this.serve_raft_rpc(layer, raft_incoming);

        if config.bootstrap {
            this.bootstrap(config.rpc_addr()?).await?;
        }

        Ok(this)
    }

    /// Serve consensus RPC over connections the multiplexer identified by
    /// their discriminator byte.
    fn serve_raft_rpc(
        self: &Arc<Self>,
        layer: Arc<StreamLayer>,
        mut incoming: mpsc::Receiver<TcpStream>,
    ) {
        let raft = self.raft.clone();
        tokio::spawn(async move {
            while let Some(tcp) = incoming.recv().await {
                let raft = raft.clone();
                let layer = Arc::clone(&layer);
                tokio::spawn(async move {
                    let mut stream = match layer.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::debug!(error = %e, "raft accept failed");
                            return;
                        }
                    };
                    loop {
                        let req: RaftRequest = match read_frame(stream.as_mut()).await {
                            Ok(req) => req,
                            Err(_) => break,
                        };
                        let reply = match req {
                            RaftRequest::AppendEntries(req) => raft
                                .append_entries(req)
                                .await
                                .map(RaftReply::AppendEntries)
                                .unwrap_or_else(|e| RaftReply::Error(e.to_string())),
                            RaftRequest::Vote(req) => raft
                                .vote(req)
                                .await
                                .map(RaftReply::Vote)
                                .unwrap_or_else(|e| RaftReply::Error(e.to_string())),
                            RaftRequest::InstallSnapshot(req) => raft
                                .install_snapshot(req)
                                .await
                                .map(RaftReply::InstallSnapshot)
                                .unwrap_or_else(|e| RaftReply::Error(e.to_string())),
                        };
                        if write_frame(stream.as_mut(), &reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    /// Boot a fresh single-voter cluster containing only this node. A node
    /// with prior state reports already-initialized, which is not an error.
    async fn bootstrap(&self, rpc_addr: String) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(self.node_id, BasicNode { addr: rpc_addr });
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
            Err(e) => Err(LogError::Raft(format!("bootstrap: {:?}", e))),
        }
    }

    /// Append a record value through consensus and return its offset.
    pub async fn append(&self, value: Vec<u8>) -> Result<u64> {
        let write = self.raft.client_write(LogCommand::Append { value });
        let response = tokio::time::timeout(APPLY_TIMEOUT, write)
            .await
            .map_err(|_| LogError::Timeout(APPLY_TIMEOUT))?
            .map_err(map_write_error)?;
        response
            .data
            .offset
            .ok_or_else(|| LogError::Raft("apply returned no offset".to_string()))
    }

    /// Read the record at `offset` from the local log. Relaxed consistency:
    /// a follower may not have the offset yet.
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Add a voting member. Only the leader can effect the change; other
    /// nodes surface [`LogError::NotLeader`].
    pub async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        let id = node_id_for(name);
        let node = BasicNode {
            addr: rpc_addr.to_string(),
        };

        // Re-joining with the same address is a no-op.
        let metrics = self.raft.metrics().borrow().clone();
        if metrics
            .membership_config
            .nodes()
            .any(|(existing, n)| *existing == id && n.addr == rpc_addr)
        {
            return Ok(());
        }

        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(map_write_error)?;

        let mut voters: BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .collect();
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;

        tracing::info!(name, rpc_addr, "server joined cluster");
        Ok(())
    }

    /// Remove a member. Only the leader can effect the change.
    pub async fn leave(&self, name: &str) -> Result<()> {
        let id = node_id_for(name);
        let current: BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .collect();
        if !current.contains(&id) {
            return Ok(());
        }
        let voters: BTreeSet<NodeId> = current.into_iter().filter(|v| *v != id).collect();
        if voters.is_empty() {
            return Err(LogError::Config(
                "cannot remove the last cluster member".to_string(),
            ));
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;

        tracing::info!(name, "server left cluster");
        Ok(())
    }

    /// Block until some node is leader, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.raft.metrics().borrow().current_leader {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LogError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// The current cluster view for client-side load balancing.
    pub fn get_servers(&self) -> Vec<Server> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;
        let mut servers: Vec<Server> = metrics
            .membership_config
            .nodes()
            .map(|(id, node)| Server {
                id: if *id == self.node_id {
                    self.node_name.clone()
                } else {
                    id.to_string()
                },
                rpc_addr: node.addr.clone(),
                is_leader: Some(*id) == leader,
            })
            .collect();
        servers.sort_by(|a, b| a.rpc_addr.cmp(&b.rpc_addr));
        servers
    }

    /// Whether this node currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Offsets currently present in the local log.
    pub fn offsets(&self) -> (u64, u64) {
        (self.log.lowest_offset(), self.log.highest_offset())
    }

    /// Stop the consensus instance.
    pub async fn shutdown(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| LogError::Raft(format!("shutdown: {:?}", e)))
    }

    /// Flush and close both logs.
    pub fn close(&self) -> Result<()> {
        self.log.close()?;
        self.raft_log.close()?;
        Ok(())
    }
}

// Gossip events drive consensus configuration changes; membership holds the
// replicated log only through this handler surface.
#[async_trait::async_trait]
impl crate::discovery::Handler for DistributedLog {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        DistributedLog::join(self, name, rpc_addr).await
    }

    async fn leave(&self, name: &str) -> Result<()> {
        DistributedLog::leave(self, name).await
    }
}

fn raft_tuning_to_config(tuning: &RaftTuning) -> Config {
    Config {
        cluster_name: "shiplog".to_string(),
        election_timeout_min: tuning.election_timeout_ms.0,
        election_timeout_max: tuning.election_timeout_ms.1,
        heartbeat_interval: tuning.heartbeat_interval_ms,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(tuning.snapshot_threshold),
        ..Default::default()
    }
}

/// Writes rejected on a non-leader become [`LogError::NotLeader`] carrying
/// whatever leader hint the consensus layer had; the caller re-resolves and
/// retries through the picker rather than being forwarded server-side.
fn map_write_error(e: RaftWriteError) -> LogError {
    match e {
        RaftError::APIError(WriteError::ForwardToLeader(forward)) => LogError::NotLeader {
            leader: forward.leader_id,
        },
        other => LogError::Raft(format!("{:?}", other)),
    }
}
