//! Client error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No backend fits the call right now; callers wait for topology to
    /// stabilize rather than failing outright.
    #[error("no sub-conn available")]
    NoServerAvailable,

    /// The server rejected the call.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Bad target or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Retries exhausted without a usable backend.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}
