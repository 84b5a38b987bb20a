//! Stream layer for inter-node consensus RPC over the shared port.
//!
//! Outgoing connections write a single discriminator byte before upgrading
//! to TLS, which is how the multiplexer tells consensus traffic apart from
//! client RPC on one listener. The byte is consumed on both sides; the
//! framing that follows is length-prefixed serde_json, the same encoding the
//! rest of the consensus plane uses for OpenRaft messages.

use crate::error::{LogError, Result};
use crate::raft::types::{NodeId, TypeConfig};
use openraft::error::{InstallSnapshotError, NetworkError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Discriminator byte identifying a consensus connection.
pub const RAFT_RPC: u8 = 1;

/// Dial timeout for peer connections.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Any duplex byte stream the layer can run over.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> RawStream for T {}

/// Consensus RPC request frame.
#[derive(Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Consensus RPC reply frame.
#[derive(Serialize, Deserialize)]
pub enum RaftReply {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Error(String),
}

/// TLS material for both directions of the consensus plane.
#[derive(Clone, Default)]
pub struct StreamLayer {
    server_tls: Option<Arc<rustls::ServerConfig>>,
    peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl StreamLayer {
    pub fn new(
        server_tls: Option<Arc<rustls::ServerConfig>>,
        peer_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            server_tls,
            peer_tls,
        }
    }

    /// Open an outgoing consensus connection: TCP dial, discriminator byte,
    /// then a TLS client handshake when peer TLS is configured.
    pub async fn dial(&self, addr: &str) -> Result<Box<dyn RawStream>> {
        let mut tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LogError::Transport(format!("dial {} timed out", addr)))??;
        tcp.write_all(&[RAFT_RPC]).await?;

        match &self.peer_tls {
            Some(config) => {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| LogError::Transport(format!("invalid server name: {}", e)))?;
                let connector = TlsConnector::from(Arc::clone(config));
                let tls = connector.connect(name, tcp).await?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Take over an inbound connection routed by the multiplexer: consume
    /// and verify the discriminator byte, then a TLS server handshake when
    /// server TLS is configured.
    pub async fn accept(&self, mut tcp: TcpStream) -> Result<Box<dyn RawStream>> {
        let mut b = [0u8; 1];
        tcp.read_exact(&mut b).await?;
        if b[0] != RAFT_RPC {
            return Err(LogError::Transport("not a raft rpc".to_string()));
        }
        match &self.server_tls {
            Some(config) => {
                let acceptor = TlsAcceptor::from(Arc::clone(config));
                let tls = acceptor.accept(tcp).await?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

/// Write one length-prefixed serde_json frame.
pub async fn write_frame<T: Serialize>(stream: &mut (impl RawStream + ?Sized), msg: &T) -> Result<()> {
    let buf = serde_json::to_vec(msg)?;
    stream.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed serde_json frame.
pub async fn read_frame<T: DeserializeOwned>(stream: &mut (impl RawStream + ?Sized)) -> Result<T> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(LogError::Transport(format!("frame of {} bytes", len)));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Type alias for OpenRaft raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;

/// Type alias for OpenRaft RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, BasicNode, RaftError<E>>;

/// Factory handing OpenRaft one framed connection per peer.
#[derive(Clone)]
pub struct RaftNetworkClient {
    layer: Arc<StreamLayer>,
}

impl RaftNetworkClient {
    pub fn new(layer: Arc<StreamLayer>) -> Self {
        Self { layer }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkClient {
    type Network = RaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        RaftConnection {
            target,
            addr: node.addr.clone(),
            layer: Arc::clone(&self.layer),
            stream: None,
        }
    }
}

/// A cached connection to one peer. Dropped on any I/O failure so the next
/// RPC redials; OpenRaft retries unreachable peers on its own schedule.
pub struct RaftConnection {
    target: NodeId,
    addr: String,
    layer: Arc<StreamLayer>,
    stream: Option<Box<dyn RawStream>>,
}

impl RaftConnection {
    async fn call(&mut self, req: &RaftRequest) -> Result<RaftReply> {
        if self.stream.is_none() {
            self.stream = Some(self.layer.dial(&self.addr).await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(LogError::Transport("peer connection unavailable".to_string()));
        };
        let result = async {
            write_frame(stream.as_mut(), req).await?;
            read_frame::<RaftReply>(stream.as_mut()).await
        }
        .await;
        if result.is_err() {
            self.stream = None;
            tracing::debug!(target = self.target, addr = %self.addr, "peer connection dropped");
        }
        result
    }
}

fn unreachable_err(e: &LogError) -> openraft::error::RPCError<NodeId, BasicNode, RaftError> {
    openraft::error::RPCError::Unreachable(Unreachable::new(e))
}

fn reply_mismatch() -> LogError {
    LogError::Transport("mismatched raft reply".to_string())
}

impl RaftNetwork<TypeConfig> for RaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<AppendEntriesResponse<NodeId>, RPCError> {
        match self.call(&RaftRequest::AppendEntries(req)).await {
            Ok(RaftReply::AppendEntries(resp)) => Ok(resp),
            Ok(RaftReply::Error(e)) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &LogError::Raft(e),
            ))),
            Ok(_) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &reply_mismatch(),
            ))),
            Err(e) => Err(unreachable_err(&e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<InstallSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        match self.call(&RaftRequest::InstallSnapshot(req)).await {
            Ok(RaftReply::InstallSnapshot(resp)) => Ok(resp),
            Ok(RaftReply::Error(e)) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &LogError::Raft(e),
            ))),
            Ok(_) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &reply_mismatch(),
            ))),
            Err(e) => Err(openraft::error::RPCError::Unreachable(Unreachable::new(&e))),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError> {
        match self.call(&RaftRequest::Vote(req)).await {
            Ok(RaftReply::Vote(resp)) => Ok(resp),
            Ok(RaftReply::Error(e)) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &LogError::Raft(e),
            ))),
            Ok(_) => Err(openraft::error::RPCError::Network(NetworkError::new(
                &reply_mismatch(),
            ))),
            Err(e) => Err(unreachable_err(&e)),
        }
    }
}
