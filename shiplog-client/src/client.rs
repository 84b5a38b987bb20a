//! High-level log client: pick, call, and re-resolve on routing errors.

use crate::error::{ClientError, Result};
use crate::picker::Picker;
use crate::proto::log_client::LogClient as GrpcLogClient;
use crate::proto::{ConsumeRequest, ConsumeResponse, ProduceRequest, Record};
use crate::resolver::Resolver;
use parking_lot::RwLock;
use std::time::Duration;
use tonic::Streaming;

/// How long a call keeps retrying while the topology stabilizes.
const CALL_DEADLINE: Duration = Duration::from_secs(10);
/// Pause between retries when no backend is available.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// A topology-aware client for the Log service.
pub struct LogClient {
    resolver: Resolver,
    picker: RwLock<Picker>,
}

impl LogClient {
    /// Connect to any cluster member and discover the rest.
    pub async fn connect(target: &str) -> Result<Self> {
        let resolver = Resolver::new(target).await?;
        let picker = RwLock::new(Picker::new(&resolver.servers()));
        Ok(Self { resolver, picker })
    }

    /// Append a record value; returns the assigned offset. Routed to the
    /// leader, following leadership moves as the resolver re-learns them.
    pub async fn produce(&self, value: Vec<u8>) -> Result<u64> {
        let request = ProduceRequest {
            record: Some(Record {
                value,
                ..Default::default()
            }),
        };
        self.call("/shiplog.v1.Log/Produce", |mut client| {
            let request = request.clone();
            async move {
                client
                    .produce(request)
                    .await
                    .map(|response| response.into_inner().offset)
            }
        })
        .await
    }

    /// Stream several record values to the leader, returning the offset
    /// assigned to each.
    pub async fn produce_stream(&self, values: Vec<Vec<u8>>) -> Result<Vec<u64>> {
        self.call("/shiplog.v1.Log/ProduceStream", move |mut client| {
            let values = values.clone();
            async move {
                let requests = tokio_stream::iter(values.into_iter().map(|value| ProduceRequest {
                    record: Some(Record {
                        value,
                        ..Default::default()
                    }),
                }));
                let mut responses = client.produce_stream(requests).await?.into_inner();
                let mut offsets = Vec::new();
                while let Some(response) = responses.message().await? {
                    offsets.push(response.offset);
                }
                Ok(offsets)
            }
        })
        .await
    }

    /// Read the record at `offset` from some follower (or the leader when
    /// the cluster has no followers).
    pub async fn consume(&self, offset: u64) -> Result<Record> {
        self.call("/shiplog.v1.Log/Consume", move |mut client| async move {
            let response = client.consume(ConsumeRequest { offset }).await?;
            response
                .into_inner()
                .record
                .ok_or_else(|| tonic::Status::internal("response without record"))
        })
        .await
    }

    /// Stream records from `offset` forward; the server follows the tail.
    pub async fn consume_stream(&self, offset: u64) -> Result<Streaming<ConsumeResponse>> {
        self.call(
            "/shiplog.v1.Log/ConsumeStream",
            move |mut client| async move {
                client
                    .consume_stream(ConsumeRequest { offset })
                    .await
                    .map(|response| response.into_inner())
            },
        )
        .await
    }

    /// The cluster topology as currently resolved.
    pub async fn get_servers(&self) -> Result<Vec<crate::resolver::ServerInfo>> {
        self.refresh().await?;
        Ok(self.resolver.servers())
    }

    /// Re-resolve and rebuild the picker.
    async fn refresh(&self) -> Result<()> {
        let servers = self.resolver.resolve_now().await?;
        *self.picker.write() = Picker::new(&servers);
        Ok(())
    }

    /// Run one RPC against the picked backend, refreshing the topology and
    /// retrying on routing errors until the deadline.
    async fn call<F, Fut, T>(&self, method: &str, mut op: F) -> Result<T>
    where
        F: FnMut(GrpcLogClient<tonic::transport::Channel>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, tonic::Status>>,
    {
        let deadline = tokio::time::Instant::now() + CALL_DEADLINE;
        loop {
            let attempt: Result<T> = async {
                let addr = self.picker.read().pick(method)?;
                let channel = self.resolver.channel(&addr).await.map_err(|e| {
                    self.resolver.forget(&addr);
                    e
                })?;
                op(GrpcLogClient::new(channel))
                    .await
                    .map_err(ClientError::from)
            }
            .await;

            match attempt {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::DeadlineExceeded(e.to_string()));
                    }
                    tracing::debug!(method, error = %e, "retrying after topology refresh");
                    tokio::time::sleep(RETRY_PAUSE).await;
                    let _ = self.refresh().await;
                }
            }
        }
    }
}

/// Routing errors worth a topology refresh: no backend yet, a stale leader,
/// or a connection-level failure.
fn retryable(e: &ClientError) -> bool {
    match e {
        ClientError::NoServerAvailable | ClientError::Transport(_) => true,
        ClientError::Rpc(status) => matches!(
            status.code(),
            tonic::Code::FailedPrecondition | tonic::Code::Unavailable
        ),
        _ => false,
    }
}
