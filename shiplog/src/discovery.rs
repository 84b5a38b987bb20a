//! Gossip-based peer discovery and failure detection.
//!
//! A SWIM-style heartbeat gossip over UDP: every tick the node bumps its own
//! heartbeat and sends its full member table to a few random live peers.
//! Tables merge by incarnation, then status precedence (left beats failed
//! beats alive), then heartbeat. A member whose heartbeat goes stale past
//! the suspicion window is marked failed.
//!
//! Membership transitions drive a [`Handler`], in production the replicated
//! log, so gossip events become consensus configuration changes. Handler
//! errors from non-leaders are expected and logged at debug; only the leader
//! effects configuration changes.

use crate::error::{LogError, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Gossip fan-out per tick.
const FANOUT: usize = 3;
/// Heartbeat/gossip interval.
const GOSSIP_INTERVAL: Duration = Duration::from_millis(250);
/// An alive member silent for this long is marked failed.
const SUSPICION_TIMEOUT: Duration = Duration::from_millis(2_500);
/// Tag carrying the address the member serves RPC on.
pub const TAG_RPC_ADDR: &str = "rpc_addr";

/// A component that needs to know when servers join or leave the cluster.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<()>;
    async fn leave(&self, name: &str) -> Result<()>;
}

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

impl MemberStatus {
    /// Precedence when two views of the same incarnation disagree.
    fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Failed => 1,
            MemberStatus::Left => 2,
        }
    }
}

/// One member's gossiped state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique name.
    pub name: String,
    /// Gossip address (where this table can be sent).
    pub addr: String,
    /// Metadata, including [`TAG_RPC_ADDR`].
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    /// Bumped by the member itself to refute stale claims about it.
    pub incarnation: u64,
    /// Monotonic liveness counter, bumped every local tick.
    pub heartbeat: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    Sync { members: Vec<Member> },
}

/// Membership configuration.
#[derive(Debug, Clone, Default)]
pub struct MembershipConfig {
    pub node_name: String,
    /// UDP address gossip binds to.
    pub bind_addr: String,
    pub tags: HashMap<String, String>,
    /// Gossip addresses of existing members to join through.
    pub start_join_addrs: Vec<String>,
}

enum Event {
    Join { name: String, rpc_addr: String },
    Leave { name: String },
}

struct Entry {
    member: Member,
    last_seen: Instant,
}

struct State {
    local_name: String,
    socket: UdpSocket,
    members: parking_lot::Mutex<HashMap<String, Entry>>,
    handler: Arc<dyn Handler>,
    shutdown: Notify,
}

/// Gossip membership: discovery plus failure detection for every node.
pub struct Membership {
    state: Arc<State>,
}

impl Membership {
    /// Bind the gossip socket, seed the member table with ourselves, start
    /// the gossip loop, and reach out to the configured join addresses.
    pub async fn new(handler: Arc<dyn Handler>, config: MembershipConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr).await?;
        let local_addr = socket.local_addr()?.to_string();

        let local = Member {
            name: config.node_name.clone(),
            addr: local_addr,
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
            incarnation: 0,
            heartbeat: 0,
        };
        let mut members = HashMap::new();
        members.insert(
            config.node_name.clone(),
            Entry {
                member: local,
                last_seen: Instant::now(),
            },
        );

        let state = Arc::new(State {
            local_name: config.node_name.clone(),
            socket,
            members: parking_lot::Mutex::new(members),
            handler,
            shutdown: Notify::new(),
        });

        let looped = Arc::clone(&state);
        tokio::spawn(async move {
            looped.run().await;
        });

        // First contact with the cluster we are joining.
        for seed in &config.start_join_addrs {
            state.send_sync_to(seed).await;
        }

        Ok(Self { state })
    }

    /// A snapshot of the current member table.
    pub fn members(&self) -> Vec<Member> {
        self.state
            .members
            .lock()
            .values()
            .map(|e| e.member.clone())
            .collect()
    }

    /// Announce departure and stop gossiping.
    pub async fn leave(&self) -> Result<()> {
        let targets: Vec<String> = {
            let mut members = self.state.members.lock();
            if let Some(entry) = members.get_mut(&self.state.local_name) {
                entry.member.status = MemberStatus::Left;
                entry.member.incarnation += 1;
            }
            members
                .values()
                .filter(|e| {
                    e.member.name != self.state.local_name
                        && e.member.status == MemberStatus::Alive
                })
                .map(|e| e.member.addr.clone())
                .collect()
        };
        for addr in targets {
            self.state.send_sync_to(&addr).await;
        }
        self.state.shutdown.notify_one();
        Ok(())
    }
}

impl State {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = ticker.tick() => {
                    let events = self.tick();
                    self.dispatch(events).await;
                    self.gossip().await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let Ok((n, _)) = received else { continue };
                    let Ok(GossipMessage::Sync { members }) =
                        serde_json::from_slice::<GossipMessage>(&buf[..n])
                    else {
                        continue;
                    };
                    let mut events = Vec::new();
                    {
                        let mut table = self.members.lock();
                        for member in members {
                            merge(&self.local_name, &mut table, member, &mut events);
                        }
                    }
                    self.dispatch(events).await;
                }
            }
        }
    }

    /// Bump our heartbeat and fail members that have gone silent.
    fn tick(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let mut members = self.members.lock();
        if let Some(local) = members.get_mut(&self.local_name) {
            local.member.heartbeat += 1;
            local.last_seen = Instant::now();
        }
        for entry in members.values_mut() {
            if entry.member.name != self.local_name
                && entry.member.status == MemberStatus::Alive
                && entry.last_seen.elapsed() > SUSPICION_TIMEOUT
            {
                entry.member.status = MemberStatus::Failed;
                events.push(Event::Leave {
                    name: entry.member.name.clone(),
                });
            }
        }
        events
    }

    /// Send the member table to a few random live peers.
    async fn gossip(&self) {
        let targets: Vec<String> = {
            let members = self.members.lock();
            let mut peers: Vec<String> = members
                .values()
                .filter(|e| {
                    e.member.name != self.local_name && e.member.status == MemberStatus::Alive
                })
                .map(|e| e.member.addr.clone())
                .collect();
            peers.shuffle(&mut rand::thread_rng());
            peers.truncate(FANOUT);
            peers
        };
        for addr in targets {
            self.send_sync_to(&addr).await;
        }
    }

    async fn send_sync_to(&self, addr: &str) {
        let message = {
            let members = self.members.lock();
            GossipMessage::Sync {
                members: members.values().map(|e| e.member.clone()).collect(),
            }
        };
        let Ok(bytes) = serde_json::to_vec(&message) else {
            return;
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            tracing::debug!(addr, error = %e, "gossip send failed");
        }
    }

    async fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            let result = match &event {
                Event::Join { name, rpc_addr } => self.handler.join(name, rpc_addr).await,
                Event::Leave { name } => self.handler.leave(name).await,
            };
            if let Err(e) = result {
                let name = match &event {
                    Event::Join { name, .. } | Event::Leave { name } => name.as_str(),
                };
                // Only the leader can change the configuration.
                if matches!(e, LogError::NotLeader { .. }) {
                    tracing::debug!(name, error = %e, "membership change deferred to leader");
                } else {
                    tracing::error!(name, error = %e, "membership handler failed");
                }
            }
        }
    }
}

/// Fold one gossiped member into the table, recording join/leave
/// transitions for every member except the local node.
fn merge(
    local_name: &str,
    table: &mut HashMap<String, Entry>,
    incoming: Member,
    events: &mut Vec<Event>,
) {
    if incoming.name == local_name {
        // Refute stale claims about ourselves.
        if incoming.status != MemberStatus::Alive {
            if let Some(local) = table.get_mut(local_name) {
                if local.member.status == MemberStatus::Alive
                    && incoming.incarnation >= local.member.incarnation
                {
                    local.member.incarnation = incoming.incarnation + 1;
                }
            }
        }
        return;
    }

    match table.get_mut(&incoming.name) {
        None => {
            if incoming.status == MemberStatus::Alive {
                events.push(Event::Join {
                    name: incoming.name.clone(),
                    rpc_addr: incoming
                        .tags
                        .get(TAG_RPC_ADDR)
                        .cloned()
                        .unwrap_or_default(),
                });
            }
            table.insert(
                incoming.name.clone(),
                Entry {
                    member: incoming,
                    last_seen: Instant::now(),
                },
            );
        }
        Some(entry) => {
            if !supersedes(&incoming, &entry.member) {
                return;
            }
            let was = entry.member.status;
            let now = incoming.status;
            if incoming.heartbeat > entry.member.heartbeat {
                entry.last_seen = Instant::now();
            }
            entry.member = incoming;
            match (was, now) {
                (MemberStatus::Alive, MemberStatus::Left)
                | (MemberStatus::Alive, MemberStatus::Failed) => {
                    events.push(Event::Leave {
                        name: entry.member.name.clone(),
                    });
                }
                (MemberStatus::Left, MemberStatus::Alive)
                | (MemberStatus::Failed, MemberStatus::Alive) => {
                    events.push(Event::Join {
                        name: entry.member.name.clone(),
                        rpc_addr: entry
                            .member
                            .tags
                            .get(TAG_RPC_ADDR)
                            .cloned()
                            .unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
    }
}

/// Whether `incoming` is a newer view than `current`.
fn supersedes(incoming: &Member, current: &Member) -> bool {
    if incoming.incarnation != current.incarnation {
        return incoming.incarnation > current.incarnation;
    }
    if incoming.status != current.status {
        return incoming.status.rank() > current.status.rank();
    }
    incoming.heartbeat > current.heartbeat
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        joins: Mutex<Vec<(String, String)>>,
        leaves: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
            self.joins
                .lock()
                .push((name.to_string(), rpc_addr.to_string()));
            Ok(())
        }

        async fn leave(&self, name: &str) -> Result<()> {
            self.leaves.lock().push(name.to_string());
            Ok(())
        }
    }

    async fn member(
        name: &str,
        handler: Arc<dyn Handler>,
        seeds: Vec<String>,
    ) -> Membership {
        let mut tags = HashMap::new();
        tags.insert(TAG_RPC_ADDR.to_string(), format!("{}.rpc", name));
        Membership::new(
            handler,
            MembershipConfig {
                node_name: name.to_string(),
                bind_addr: "127.0.0.1:0".to_string(),
                tags,
                start_join_addrs: seeds,
            },
        )
        .await
        .expect("start membership")
    }

    fn gossip_addr(m: &Membership, name: &str) -> String {
        m.members()
            .into_iter()
            .find(|member| member.name == name)
            .expect("member present")
            .addr
    }

    #[tokio::test]
    async fn joins_and_graceful_leave_reach_the_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let noop = Arc::new(RecordingHandler::default());

        let first = member("0", handler.clone(), Vec::new()).await;
        let seed = gossip_addr(&first, "0");
        let second = member("1", noop.clone(), vec![seed.clone()]).await;
        let third = member("2", noop.clone(), vec![seed]).await;

        // Let gossip converge.
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert_eq!(first.members().len(), 3);
        {
            let joins = handler.joins.lock();
            let mut names: Vec<&str> = joins.iter().map(|(n, _)| n.as_str()).collect();
            names.sort_unstable();
            assert_eq!(names, ["1", "2"]);
            assert!(joins.iter().all(|(_, rpc)| rpc.ends_with(".rpc")));
        }

        third.leave().await.expect("leave");
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert_eq!(handler.leaves.lock().as_slice(), ["2".to_string()]);
        let status = first
            .members()
            .into_iter()
            .find(|m| m.name == "2")
            .expect("departed member still listed")
            .status;
        assert_eq!(status, MemberStatus::Left);

        second.leave().await.expect("leave");
        first.leave().await.expect("leave");
    }

    #[test]
    fn supersedes_prefers_incarnation_then_status_then_heartbeat() {
        let base = Member {
            name: "m".into(),
            addr: "a".into(),
            tags: HashMap::new(),
            status: MemberStatus::Alive,
            incarnation: 1,
            heartbeat: 5,
        };
        let mut newer = base.clone();
        newer.heartbeat = 6;
        assert!(supersedes(&newer, &base));
        assert!(!supersedes(&base, &newer));

        let mut left = base.clone();
        left.status = MemberStatus::Left;
        assert!(supersedes(&left, &base));

        let mut refuted = base.clone();
        refuted.incarnation = 2;
        assert!(supersedes(&refuted, &left));
    }
}
