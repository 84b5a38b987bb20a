//! Single-listener connection multiplexer.
//!
//! One TCP port carries both replication traffic and client RPC. The mux
//! peeks (never consumes) the first byte of each accepted connection: the
//! consensus discriminator routes to the raft plane, where the stream layer
//! consumes the byte; anything else (a TLS ClientHello, an h2 preface) is
//! client RPC and reaches the gRPC server with its bytes intact.

use crate::error::Result;
use crate::raft::stream::RAFT_RPC;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Handle to the running multiplexer.
pub struct Mux {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Mux {
    /// Bind `addr` and start routing. Returns the mux handle plus the two
    /// sub-listeners: consensus connections and client RPC connections.
    pub async fn bind(
        addr: &str,
    ) -> Result<(Self, mpsc::Receiver<TcpStream>, mpsc::Receiver<TcpStream>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (rpc_tx, rpc_rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let raft_tx = raft_tx.clone();
                        let rpc_tx = rpc_tx.clone();
                        tokio::spawn(async move {
                            match route(&stream).await {
                                Ok(Plane::Raft) => {
                                    let _ = raft_tx.send(stream).await;
                                }
                                Ok(Plane::Rpc) => {
                                    let _ = rpc_tx.send(stream).await;
                                }
                                Err(e) => {
                                    tracing::debug!(%peer, error = %e, "dropping connection");
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok((
            Self {
                local_addr,
                shutdown: Some(shutdown_tx),
            },
            raft_rx,
            rpc_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Connections already routed keep running.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Plane {
    Raft,
    Rpc,
}

async fn route(stream: &TcpStream) -> std::io::Result<Plane> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "closed before first byte",
        ));
    }
    if first[0] == RAFT_RPC {
        Ok(Plane::Raft)
    } else {
        Ok(Plane::Rpc)
    }
}
