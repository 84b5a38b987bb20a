//! Common test utilities for agent integration tests.

use shiplog::proto::log_client::LogClient as GrpcLogClient;
use shiplog::{Agent, AgentConfig};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tonic::transport::Channel;

/// Atomic counter for allocating unique ports.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

/// Get a unique port for testing.
pub fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// One running agent plus the temp directory backing it.
#[allow(dead_code)]
pub struct TestNode {
    pub agent: Arc<Agent>,
    pub bind_addr: String,
    pub rpc_addr: String,
    _data_dir: TempDir,
}

#[allow(dead_code)]
impl TestNode {
    /// Start an agent. `seeds` are gossip addresses of nodes to join;
    /// `policy` is an optional ACL policy table (no policy = allow all).
    pub async fn start(
        name: &str,
        bootstrap: bool,
        seeds: Vec<String>,
        policy: Option<&str>,
    ) -> Self {
        let gossip_port = get_test_port();
        let rpc_port = get_test_port();
        let bind_addr = format!("127.0.0.1:{}", gossip_port);

        let data_dir = TempDir::new().expect("create temp dir");
        let mut builder = AgentConfig::builder()
            .data_dir(data_dir.path())
            .bind_addr(bind_addr.clone())
            .rpc_port(rpc_port)
            .node_name(name)
            .start_join_addrs(seeds)
            .bootstrap(bootstrap);

        if let Some(policy) = policy {
            let path = data_dir.path().join("policy.csv");
            std::fs::write(&path, policy).expect("write policy");
            builder = builder.acl_policy_file(path);
        }

        let config = builder.build().expect("valid config");
        let rpc_addr = config.rpc_addr().expect("rpc addr");
        let agent = Agent::new(config).await.expect("start agent");

        Self {
            agent,
            bind_addr,
            rpc_addr,
            _data_dir: data_dir,
        }
    }

    /// A raw gRPC client pinned to this node.
    pub async fn rpc_client(&self) -> GrpcLogClient<Channel> {
        let endpoint = format!("http://{}", self.rpc_addr);
        let channel = Channel::from_shared(endpoint)
            .expect("valid endpoint")
            .connect()
            .await
            .expect("connect");
        GrpcLogClient::new(channel)
    }

    pub async fn shutdown(&self) {
        self.agent.shutdown().await.expect("shutdown");
    }
}
