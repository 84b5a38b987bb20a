//! Client for the shiplog distributed commit log.
//!
//! The server exposes cluster topology through `GetServers`; this crate
//! turns that into role-aware routing: the [`Resolver`] keeps the server
//! list fresh, the [`Picker`] sends Produce calls to the leader and spreads
//! Consume calls round-robin across followers, and [`LogClient`] wraps both
//! with re-resolve-and-retry on leadership changes.

mod client;
mod error;
mod picker;
mod resolver;

// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("shiplog.v1");
}

pub use client::LogClient;
pub use error::{ClientError, Result};
pub use picker::Picker;
pub use resolver::{Resolver, ServerInfo};
