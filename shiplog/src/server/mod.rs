//! Client RPC server facade.
//!
//! Thin handlers over the commit log and topology source: Produce appends
//! through consensus, Consume reads locally, the stream variants loop over
//! the unary paths, and GetServers feeds client-side resolvers. Every call
//! is authorized against the subject taken from the client certificate's
//! Common Name (or the anonymous subject without TLS).

pub mod mux;

use crate::auth::{Authorizer, ANONYMOUS, WILDCARD};
use crate::error::Result;
use crate::proto::log_server::{Log as LogRpc, LogServer};
use crate::proto::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse, Record, Server,
};
use crate::raft::stream::RawStream;
use crate::raft::DistributedLog;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::server::Connected;
use tonic::{Request, Response, Status, Streaming};

/// Action names checked against the ACL.
pub const ACTION_PRODUCE: &str = "produce";
pub const ACTION_CONSUME: &str = "consume";

/// Poll interval when a consume stream has caught up with the log tail.
const TAIL_POLL: Duration = Duration::from_secs(1);

/// The log the server appends to and reads from.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    /// Append a record value; returns the assigned offset.
    async fn append(&self, value: Vec<u8>) -> Result<u64>;
    /// Read the record at `offset` from the local log.
    fn read(&self, offset: u64) -> Result<Record>;
}

/// Source of the cluster view handed to resolvers.
pub trait TopologySource: Send + Sync + 'static {
    fn get_servers(&self) -> Vec<Server>;
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, value: Vec<u8>) -> Result<u64> {
        DistributedLog::append(self, value).await
    }

    fn read(&self, offset: u64) -> Result<Record> {
        DistributedLog::read(self, offset)
    }
}

impl TopologySource for DistributedLog {
    fn get_servers(&self) -> Vec<Server> {
        DistributedLog::get_servers(self)
    }
}

#[async_trait]
impl CommitLog for crate::log::Log {
    async fn append(&self, value: Vec<u8>) -> Result<u64> {
        let mut record = Record {
            value,
            ..Default::default()
        };
        crate::log::Log::append(self, &mut record)
    }

    fn read(&self, offset: u64) -> Result<Record> {
        crate::log::Log::read(self, offset)
    }
}

/// Per-connection info exposed to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct RpcConnectInfo {
    pub peer_addr: Option<SocketAddr>,
    /// Common Name of the client certificate, if the peer presented one.
    pub subject: Option<String>,
}

/// A client connection routed by the multiplexer, optionally TLS-wrapped.
pub struct RpcStream {
    inner: Box<dyn RawStream>,
    info: RpcConnectInfo,
}

impl AsyncRead for RpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.inner.as_mut()).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_shutdown(cx)
    }
}

impl Connected for RpcStream {
    type ConnectInfo = RpcConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

/// Pull the Common Name out of the client's leaf certificate.
fn subject_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

/// Upgrade a routed client connection: TLS handshake when configured, then
/// capture the peer address and certificate subject.
async fn accept_client(
    tcp: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> std::io::Result<RpcStream> {
    let peer_addr = tcp.peer_addr().ok();
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(tcp).await?;
            let subject = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| subject_from_der(cert.as_ref()));
            Ok(RpcStream {
                inner: Box::new(tls),
                info: RpcConnectInfo { peer_addr, subject },
            })
        }
        None => Ok(RpcStream {
            inner: Box::new(tcp),
            info: RpcConnectInfo {
                peer_addr,
                subject: None,
            },
        }),
    }
}

/// The gRPC Log service.
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    topology: Arc<dyn TopologySource>,
    authorizer: Arc<Authorizer>,
}

impl LogService {
    pub fn new(
        commit_log: Arc<dyn CommitLog>,
        topology: Arc<dyn TopologySource>,
        authorizer: Arc<Authorizer>,
    ) -> Self {
        Self {
            commit_log,
            topology,
            authorizer,
        }
    }

    fn subject<T>(request: &Request<T>) -> String {
        request
            .extensions()
            .get::<RpcConnectInfo>()
            .and_then(|info| info.subject.clone())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    fn authorize<T>(&self, request: &Request<T>, action: &str) -> std::result::Result<(), Status> {
        self.authorizer
            .authorize(&Self::subject(request), WILDCARD, action)
            .map_err(Status::from)
    }
}

#[tonic::async_trait]
impl LogRpc for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> std::result::Result<Response<ProduceResponse>, Status> {
        self.authorize(&request, ACTION_PRODUCE)?;
        let record = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;
        let offset = self.commit_log.append(record.value).await?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> std::result::Result<Response<ConsumeResponse>, Status> {
        self.authorize(&request, ACTION_CONSUME)?;
        let record = self.commit_log.read(request.into_inner().offset)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<std::result::Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> std::result::Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, ACTION_PRODUCE)?;
        let commit_log = Arc::clone(&self.commit_log);
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let request = match requests.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };
                let Some(record) = request.record else {
                    let _ = tx
                        .send(Err(Status::invalid_argument("record is required")))
                        .await;
                    break;
                };
                let result = commit_log
                    .append(record.value)
                    .await
                    .map(|offset| ProduceResponse { offset })
                    .map_err(Status::from);
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<std::result::Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> std::result::Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, ACTION_CONSUME)?;
        let commit_log = Arc::clone(&self.commit_log);
        let mut offset = request.into_inner().offset;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match commit_log.read(offset) {
                    Ok(record) => {
                        let response = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                        offset += 1;
                    }
                    // Caught up with the tail: poll until new records land.
                    Err(e) if e.is_out_of_range() => {
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(TAIL_POLL).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::from(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> std::result::Result<Response<GetServersResponse>, Status> {
        Ok(Response::new(GetServersResponse {
            servers: self.topology.get_servers(),
        }))
    }
}

/// Serve the Log service over connections routed by the multiplexer,
/// TLS-terminating them when configured, until `shutdown` fires.
pub async fn serve(
    service: LogService,
    incoming: mpsc::Receiver<TcpStream>,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let acceptor = tls.map(TlsAcceptor::from);
    let incoming = ReceiverStream::new(incoming)
        .then(move |tcp| {
            let acceptor = acceptor.clone();
            async move { accept_client(tcp, acceptor).await }
        })
        .filter_map(|result| match result {
            Ok(stream) => Some(Ok::<_, std::io::Error>(stream)),
            Err(e) => {
                tracing::warn!(error = %e, "client handshake failed");
                None
            }
        });

    tonic::transport::Server::builder()
        .add_service(LogServer::new(service))
        .serve_with_incoming_shutdown(incoming, async {
            let _ = shutdown.await;
        })
        .await
        .map_err(|e| crate::error::LogError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Log, SegmentConfig};
    use tempfile::TempDir;

    fn service_with_policy(dir: &TempDir, policy: Option<&str>) -> LogService {
        let log = Arc::new(
            Log::open(dir.path().join("log"), SegmentConfig::default()).expect("open log"),
        );
        let authorizer = match policy {
            Some(content) => {
                let path = dir.path().join("policy.csv");
                std::fs::write(&path, content).expect("write policy");
                Arc::new(Authorizer::new(None, Some(&path)).expect("load authorizer"))
            }
            None => Arc::new(Authorizer::new(None, None).expect("permissive authorizer")),
        };
        struct NoTopology;
        impl TopologySource for NoTopology {
            fn get_servers(&self) -> Vec<Server> {
                Vec::new()
            }
        }
        LogService::new(log.clone(), Arc::new(NoTopology), authorizer)
    }

    fn produce_request(value: &[u8]) -> Request<ProduceRequest> {
        Request::new(ProduceRequest {
            record: Some(Record {
                value: value.to_vec(),
                ..Default::default()
            }),
        })
    }

    #[tokio::test]
    async fn produce_then_consume_roundtrips() {
        let dir = TempDir::new().expect("create temp dir");
        // No policy configured: permissive.
        let service = service_with_policy(&dir, None);

        let offset = service
            .produce(produce_request(b"hello world"))
            .await
            .expect("produce")
            .into_inner()
            .offset;
        assert_eq!(offset, 0);

        let response = service
            .consume(Request::new(ConsumeRequest { offset }))
            .await
            .expect("consume")
            .into_inner();
        assert_eq!(response.record.expect("record").value, b"hello world");
    }

    #[tokio::test]
    async fn consume_past_boundary_is_out_of_range() {
        let dir = TempDir::new().expect("create temp dir");
        let service = service_with_policy(&dir, None);
        service
            .produce(produce_request(b"only"))
            .await
            .expect("produce");

        let status = service
            .consume(Request::new(ConsumeRequest { offset: 1 }))
            .await
            .err()
            .expect("must fail");
        assert_eq!(status.code(), tonic::Code::OutOfRange);
    }

    #[tokio::test]
    async fn anonymous_subject_is_denied_by_policy() {
        let dir = TempDir::new().expect("create temp dir");
        let service = service_with_policy(&dir, Some("p, root, *, produce\np, root, *, consume\n"));

        let status = service
            .produce(produce_request(b"nope"))
            .await
            .err()
            .expect("must be denied");
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status = service
            .consume(Request::new(ConsumeRequest { offset: 0 }))
            .await
            .err()
            .expect("must be denied");
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn subject_comes_from_connection_info() {
        let dir = TempDir::new().expect("create temp dir");
        let service = service_with_policy(&dir, Some("p, root, *, produce\n"));

        let mut request = produce_request(b"authorized");
        request.extensions_mut().insert(RpcConnectInfo {
            peer_addr: None,
            subject: Some("root".to_string()),
        });
        assert!(service.produce(request).await.is_ok());
    }
}
