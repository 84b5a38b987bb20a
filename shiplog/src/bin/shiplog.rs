//! The shiplog server binary.

use clap::Parser;
use shiplog::config::AgentConfig;
use shiplog::tls::TlsFiles;
use shiplog::Agent;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Distributed commit log node.
#[derive(Parser)]
#[command(name = "shiplog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory for on-disk state.
    #[arg(long, default_value = "./shiplog-data")]
    data_dir: PathBuf,

    /// Address the gossip layer binds to.
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: String,

    /// Port for the multiplexed TCP listener.
    #[arg(long, default_value_t = 8400)]
    rpc_port: u16,

    /// Cluster-unique node name.
    #[arg(long)]
    node_name: String,

    /// Gossip addresses of existing members to join.
    #[arg(long)]
    start_join_addrs: Vec<String>,

    /// Bootstrap a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,

    /// ACL model file.
    #[arg(long)]
    acl_model_file: Option<PathBuf>,

    /// ACL policy file.
    #[arg(long)]
    acl_policy_file: Option<PathBuf>,

    /// Server certificate (PEM), serving both planes.
    #[arg(long, requires = "server_tls_key_file")]
    server_tls_cert_file: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long)]
    server_tls_key_file: Option<PathBuf>,

    /// CA bundle for verifying clients and peers (enables mutual auth).
    #[arg(long)]
    server_tls_ca_file: Option<PathBuf>,

    /// Certificate presented when dialing peers (PEM).
    #[arg(long, requires = "peer_tls_key_file")]
    peer_tls_cert_file: Option<PathBuf>,

    /// Private key for the peer certificate (PEM).
    #[arg(long)]
    peer_tls_key_file: Option<PathBuf>,

    /// CA bundle for verifying peer servers.
    #[arg(long)]
    peer_tls_ca_file: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> shiplog::Result<AgentConfig> {
        let mut builder = AgentConfig::builder()
            .data_dir(self.data_dir)
            .bind_addr(self.bind_addr)
            .rpc_port(self.rpc_port)
            .node_name(self.node_name)
            .start_join_addrs(self.start_join_addrs)
            .bootstrap(self.bootstrap);

        if let Some(path) = self.acl_model_file {
            builder = builder.acl_model_file(path);
        }
        if let Some(path) = self.acl_policy_file {
            builder = builder.acl_policy_file(path);
        }
        if let (Some(cert), Some(key)) = (self.server_tls_cert_file, self.server_tls_key_file) {
            let files = TlsFiles {
                cert_file: cert,
                key_file: key,
                ca_file: self.server_tls_ca_file,
            };
            builder = builder.server_tls(files.server_config()?);
        }
        if let (Some(cert), Some(key)) = (self.peer_tls_cert_file, self.peer_tls_key_file) {
            let files = TlsFiles {
                cert_file: cert,
                key_file: key,
                ca_file: self.peer_tls_ca_file,
            };
            builder = builder.peer_tls(files.client_config()?);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> shiplog::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let agent = Agent::new(cli.into_config()?).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    agent.shutdown().await?;
    Ok(())
}
