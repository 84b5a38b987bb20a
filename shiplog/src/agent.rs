//! The agent runs on every service instance and wires the components
//! together: multiplexer, replicated log, RPC server, and membership.

use crate::auth::Authorizer;
use crate::config::AgentConfig;
use crate::discovery::{Membership, MembershipConfig, TAG_RPC_ADDR};
use crate::error::Result;
use crate::raft::DistributedLog;
use crate::server::mux::Mux;
use crate::server::{serve, LogService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// One running service node.
pub struct Agent {
    config: AgentConfig,
    mux: Mutex<Mux>,
    log: Arc<DistributedLog>,
    membership: Membership,
    rpc_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    shut_down: Mutex<bool>,
}

impl Agent {
    /// Boot a node: bind the shared listener, start the replicated log with
    /// the consensus sub-listener, serve client RPC on the rest, and join
    /// the gossip ring.
    pub async fn new(config: AgentConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let rpc_addr = config.rpc_addr()?;

        let (mux, raft_rx, rpc_rx) = Mux::bind(&rpc_addr).await?;
        tracing::info!(node = %config.node_name, %rpc_addr, "listener bound");

        let log = DistributedLog::new(&config, raft_rx).await?;
        if config.bootstrap {
            log.wait_for_leader(Duration::from_secs(3)).await?;
        }

        let authorizer = Arc::new(Authorizer::new(
            config.acl_model_file.as_deref(),
            config.acl_policy_file.as_deref(),
        )?);
        let service = LogService::new(log.clone(), log.clone(), authorizer);

        let (rpc_shutdown_tx, rpc_shutdown_rx) = oneshot::channel();
        let server_tls = config.server_tls.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(service, rpc_rx, server_tls, rpc_shutdown_rx).await {
                tracing::error!(error = %e, "rpc server exited");
            }
        });

        let mut tags = HashMap::new();
        tags.insert(TAG_RPC_ADDR.to_string(), rpc_addr);
        let membership = Membership::new(
            log.clone(),
            MembershipConfig {
                node_name: config.node_name.clone(),
                bind_addr: config.bind_addr.clone(),
                tags,
                start_join_addrs: config.start_join_addrs.clone(),
            },
        )
        .await?;

        Ok(Arc::new(Self {
            config,
            mux: Mutex::new(mux),
            log,
            membership,
            rpc_shutdown: Mutex::new(Some(rpc_shutdown_tx)),
            shut_down: Mutex::new(false),
        }))
    }

    /// The replicated log this agent serves.
    pub fn log(&self) -> Arc<DistributedLog> {
        Arc::clone(&self.log)
    }

    /// Address clients connect to.
    pub fn rpc_addr(&self) -> Result<String> {
        self.config.rpc_addr()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Stop the node: leave the gossip ring so peers see a graceful exit,
    /// stop serving RPC, shut down consensus, and close the log.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return Ok(());
            }
            *shut_down = true;
        }

        self.membership.leave().await?;
        if let Some(tx) = self.rpc_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.mux.lock().shutdown();
        self.log.shutdown().await?;
        self.log.close()?;
        tracing::info!(node = %self.config.node_name, "agent shut down");
        Ok(())
    }
}
