//! Node configuration.

use crate::error::{LogError, Result};
use crate::log::SegmentConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one service node.
#[derive(Clone)]
pub struct AgentConfig {
    /// Root for on-disk state (`log/` and `raft/` live under it).
    pub data_dir: PathBuf,
    /// Address the gossip layer binds to (host:port).
    pub bind_addr: String,
    /// Port for the multiplexed TCP listener (consensus + client RPC).
    pub rpc_port: u16,
    /// Cluster-unique node name.
    pub node_name: String,
    /// Gossip seed addresses for joining an existing cluster.
    pub start_join_addrs: Vec<String>,
    /// True iff this node boots a fresh single-voter cluster.
    pub bootstrap: bool,
    /// ACL model file (the authorizer's matching model).
    pub acl_model_file: Option<PathBuf>,
    /// ACL policy file (subject/object/action grants).
    pub acl_policy_file: Option<PathBuf>,
    /// TLS material served to clients and raft peers dialing in.
    pub server_tls: Option<Arc<rustls::ServerConfig>>,
    /// TLS material used when dialing raft peers.
    pub peer_tls: Option<Arc<rustls::ClientConfig>>,
    /// Segment sizing for the application log.
    pub segment: SegmentConfig,
    /// Consensus timing.
    pub raft: RaftTuning,
}

/// Consensus timing configuration.
#[derive(Debug, Clone)]
pub struct RaftTuning {
    /// Election timeout range (min, max) in milliseconds.
    pub election_timeout_ms: (u64, u64),
    /// Leader heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Trigger a snapshot after this many log entries since the last one.
    pub snapshot_threshold: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
            snapshot_threshold: 8192,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./shiplog-data"),
            bind_addr: "127.0.0.1:8401".to_string(),
            rpc_port: 8400,
            node_name: "shiplog-0".to_string(),
            start_join_addrs: Vec::new(),
            bootstrap: false,
            acl_model_file: None,
            acl_policy_file: None,
            server_tls: None,
            peer_tls: None,
            segment: SegmentConfig::default(),
            raft: RaftTuning::default(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// The RPC address advertised to peers and clients: the gossip bind host
    /// paired with the RPC port.
    pub fn rpc_addr(&self) -> Result<String> {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .ok_or_else(|| LogError::Config(format!("bind_addr {} has no port", self.bind_addr)))?;
        Ok(format!("{}:{}", host, self.rpc_port))
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(LogError::Config("node_name is required".to_string()));
        }
        if self.bind_addr.rsplit_once(':').is_none() {
            return Err(LogError::Config("bind_addr must be host:port".to_string()));
        }
        let (min, max) = self.raft.election_timeout_ms;
        if min == 0 || max < min {
            return Err(LogError::Config(
                "election_timeout_ms must be a non-empty range".to_string(),
            ));
        }
        if self.raft.heartbeat_interval_ms >= min {
            return Err(LogError::Config(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min
            )));
        }
        Ok(())
    }
}

/// Builder for [`AgentConfig`].
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.config.rpc_port = port;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    pub fn start_join_addrs(mut self, addrs: impl IntoIterator<Item = String>) -> Self {
        self.config.start_join_addrs = addrs.into_iter().collect();
        self
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    pub fn acl_model_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.acl_model_file = Some(path.into());
        self
    }

    pub fn acl_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.acl_policy_file = Some(path.into());
        self
    }

    pub fn server_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.config.server_tls = Some(config);
        self
    }

    pub fn peer_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.peer_tls = Some(config);
        self
    }

    pub fn segment(mut self, segment: SegmentConfig) -> Self {
        self.config.segment = segment;
        self
    }

    pub fn raft(mut self, raft: RaftTuning) -> Self {
        self.config.raft = raft;
        self
    }

    pub fn build(self) -> Result<AgentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_addr_pairs_bind_host_with_rpc_port() {
        let config = AgentConfig {
            bind_addr: "10.0.0.7:8401".to_string(),
            rpc_port: 9000,
            ..Default::default()
        };
        assert_eq!(config.rpc_addr().expect("rpc addr"), "10.0.0.7:9000");
    }

    #[test]
    fn validate_rejects_tight_heartbeat() {
        let mut config = AgentConfig::default();
        config.raft.heartbeat_interval_ms = 500;
        assert!(config.validate().is_err());
    }
}
