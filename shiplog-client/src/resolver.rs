//! Cluster topology discovery.

use crate::error::{ClientError, Result};
use crate::proto::log_client::LogClient as GrpcLogClient;
use crate::proto::GetServersRequest;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tonic::transport::{Channel, Endpoint};

/// One server as the cluster reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

/// Learns the cluster topology by calling `GetServers` on a bootstrap
/// target, and hands out (cached) channels to the discovered backends.
pub struct Resolver {
    resolver_conn: tokio::sync::Mutex<GrpcLogClient<Channel>>,
    servers: RwLock<Vec<ServerInfo>>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Resolver {
    /// Dial the bootstrap target and run an initial resolve.
    pub async fn new(target: &str) -> Result<Self> {
        let channel = connect(target).await?;
        let resolver = Self {
            resolver_conn: tokio::sync::Mutex::new(GrpcLogClient::new(channel)),
            servers: RwLock::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
        };
        resolver.resolve_now().await?;
        Ok(resolver)
    }

    /// Refresh the topology from the cluster.
    pub async fn resolve_now(&self) -> Result<Vec<ServerInfo>> {
        let response = {
            let mut client = self.resolver_conn.lock().await;
            client.get_servers(GetServersRequest {}).await?
        };
        let servers: Vec<ServerInfo> = response
            .into_inner()
            .servers
            .into_iter()
            .map(|s| ServerInfo {
                id: s.id,
                rpc_addr: s.rpc_addr,
                is_leader: s.is_leader,
            })
            .collect();
        *self.servers.write() = servers.clone();
        Ok(servers)
    }

    /// Last resolved topology.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.servers.read().clone()
    }

    /// Channel to a discovered backend, connecting lazily and caching.
    pub async fn channel(&self, rpc_addr: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.lock().get(rpc_addr) {
            return Ok(channel.clone());
        }
        let channel = connect(rpc_addr).await?;
        self.channels.lock().insert(rpc_addr.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drop the cached channel for a backend that failed.
    pub fn forget(&self, rpc_addr: &str) {
        self.channels.lock().remove(rpc_addr);
    }
}

async fn connect(addr: &str) -> Result<Channel> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let endpoint =
        Endpoint::from_shared(uri).map_err(|e| ClientError::Config(e.to_string()))?;
    Ok(endpoint.connect().await?)
}
