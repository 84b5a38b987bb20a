//! Role-aware backend selection.

use crate::error::ClientError;
use crate::resolver::ServerInfo;
use std::sync::atomic::{AtomicU64, Ordering};

/// Picks the backend for each call from one topology snapshot: Produce
/// calls go to the leader, Consume calls rotate through followers, and
/// anything else (or a followerless cluster) falls back to the leader.
pub struct Picker {
    leader: Option<String>,
    followers: Vec<String>,
    current: AtomicU64,
}

impl Picker {
    /// Split a topology snapshot into the leader and its followers.
    pub fn new(servers: &[ServerInfo]) -> Self {
        let leader = servers
            .iter()
            .find(|s| s.is_leader)
            .map(|s| s.rpc_addr.clone());
        let followers = servers
            .iter()
            .filter(|s| !s.is_leader)
            .map(|s| s.rpc_addr.clone())
            .collect();
        Self {
            leader,
            followers,
            current: AtomicU64::new(0),
        }
    }

    /// Address to send a call to, by (full) method name.
    pub fn pick(&self, method: &str) -> Result<String, ClientError> {
        let choice = if method.contains("Produce") || self.followers.is_empty() {
            self.leader.clone()
        } else if method.contains("Consume") {
            Some(self.next_follower())
        } else {
            self.leader.clone()
        };
        choice.ok_or(ClientError::NoServerAvailable)
    }

    fn next_follower(&self) -> String {
        let cur = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        let idx = (cur % self.followers.len() as u64) as usize;
        self.followers[idx].clone()
    }
}
