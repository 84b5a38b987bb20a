//! The state machine applying committed entries to the application log.
//!
//! Every node applies the same committed sequence, so the application log's
//! offset order is identical cluster-wide. Applied-state metadata persists
//! so a restart does not re-apply entries already on disk, and the current
//! snapshot persists under `raft/snapshots` (one retained).

use crate::error::Result;
use crate::log::{Log, LEN_WIDTH};
use crate::proto::Record;
use crate::raft::types::{
    CommandResponse, LogCommand, RaftEntry, RaftLogId, RaftSnapshot, RaftSnapshotMeta,
    RaftStoredMembership, StorageErr, TypeConfig,
};
use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Applied-state metadata persisted alongside the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedState {
    last_applied_log: Option<RaftLogId>,
    last_membership: RaftStoredMembership,
}

/// A snapshot held in memory and mirrored to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub meta: RaftSnapshotMeta,
    pub data: Vec<u8>,
}

/// The Raft state machine wrapping the application commit log.
pub struct StateMachine {
    log: Arc<Log>,
    applied: RwLock<AppliedState>,
    meta_path: PathBuf,
    snapshot_dir: PathBuf,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl StateMachine {
    /// Open the state machine, reloading applied state and the retained
    /// snapshot if present.
    pub fn open(log: Arc<Log>, raft_dir: impl AsRef<Path>) -> Result<Self> {
        let raft_dir = raft_dir.as_ref();
        let snapshot_dir = raft_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)?;
        let meta_path = raft_dir.join("fsm.json");

        let applied = if meta_path.exists() {
            serde_json::from_reader(BufReader::new(File::open(&meta_path)?))?
        } else {
            AppliedState::default()
        };

        let snapshot_path = snapshot_dir.join("current.json");
        let current_snapshot = if snapshot_path.exists() {
            Some(serde_json::from_reader(BufReader::new(File::open(
                &snapshot_path,
            )?))?)
        } else {
            None
        };

        Ok(Self {
            log,
            applied: RwLock::new(applied),
            meta_path,
            snapshot_dir,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(current_snapshot),
        })
    }

    fn persist_applied(&self, state: &AppliedState) -> Result<()> {
        write_json_atomic(&self.meta_path, state)
    }

    fn persist_snapshot(&self, snapshot: &StoredSnapshot) -> Result<()> {
        write_json_atomic(&self.snapshot_dir.join("current.json"), snapshot)
    }

    /// Append one record to the application log, preserving its consensus
    /// metadata, and return the assigned offset.
    fn apply_append(&self, mut record: Record) -> Result<u64> {
        self.log.append(&mut record)
    }

    /// Rebuild the application log from length-prefixed record frames. The
    /// first record's offset becomes the log's initial offset, so a restored
    /// follower's offset space matches the leader's.
    fn restore_from_frames(&self, data: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(data);
        let mut first = true;
        loop {
            let mut len = [0u8; LEN_WIDTH as usize];
            match cursor.read_exact(&mut len) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut payload = vec![0u8; u64::from_be_bytes(len) as usize];
            cursor.read_exact(&mut payload)?;
            let record = Record::decode(payload.as_slice())?;
            if first {
                self.log.reset_with_initial(record.offset)?;
                first = false;
            }
            self.apply_append(record)?;
        }
        Ok(())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachine> {
    async fn build_snapshot(&mut self) -> std::result::Result<RaftSnapshot, StorageErr> {
        let mut data = Vec::new();
        self.log
            .reader()
            .read_to_end(&mut data)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let applied = self.applied.read().await.clone();
        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = applied.last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = RaftSnapshotMeta {
            last_log_id: applied.last_applied_log,
            last_membership: applied.last_membership,
            snapshot_id,
        };

        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&snapshot)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        *self.current_snapshot.write().await = Some(snapshot);

        Ok(RaftSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<RaftLogId>, RaftStoredMembership), StorageErr> {
        let applied = self.applied.read().await;
        Ok((applied.last_applied_log, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<CommandResponse>, StorageErr>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.write().await;

        for entry in entries {
            tracing::debug!(log_id = %entry.log_id, "applying entry");
            applied.last_applied_log = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(CommandResponse::default()),
                EntryPayload::Normal(LogCommand::Append { value }) => {
                    let record = Record {
                        offset: 0,
                        term: entry.log_id.leader_id.term,
                        record_type: 0,
                        value,
                    };
                    let offset = self
                        .apply_append(record)
                        .map_err(|e| StorageIOError::write_state_machine(&e))?;
                    responses.push(CommandResponse {
                        offset: Some(offset),
                    });
                }
                EntryPayload::Membership(membership) => {
                    applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(CommandResponse::default());
                }
            }
        }

        self.persist_applied(&applied)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, StorageErr> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> std::result::Result<(), StorageErr> {
        tracing::info!(
            snapshot_size = snapshot.get_ref().len(),
            snapshot_id = %meta.snapshot_id,
            "installing snapshot"
        );

        let data = snapshot.into_inner();
        self.restore_from_frames(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        let mut applied = self.applied.write().await;
        applied.last_applied_log = meta.last_log_id;
        applied.last_membership = meta.last_membership.clone();
        self.persist_applied(&applied)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        drop(applied);

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.persist_snapshot(&stored)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        *self.current_snapshot.write().await = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<RaftSnapshot>, StorageErr> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(RaftSnapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::SegmentConfig;
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;

    fn open_machine(dir: &Path) -> (Arc<Log>, Arc<StateMachine>) {
        let log = Arc::new(
            Log::open(dir.join("log"), SegmentConfig::default()).expect("open log"),
        );
        let sm = Arc::new(
            StateMachine::open(Arc::clone(&log), dir.join("raft")).expect("open state machine"),
        );
        (log, sm)
    }

    fn append_entry(term: u64, index: u64, value: &[u8]) -> RaftEntry {
        RaftEntry {
            log_id: RaftLogId::new(CommittedLeaderId::new(term, 0), index),
            payload: EntryPayload::Normal(LogCommand::Append {
                value: value.to_vec(),
            }),
        }
    }

    #[tokio::test]
    async fn apply_appends_to_log() {
        let dir = TempDir::new().expect("create temp dir");
        let (log, sm) = open_machine(dir.path());
        let mut sm = sm;

        let responses = sm
            .apply(vec![
                append_entry(1, 0, b"first"),
                append_entry(1, 1, b"second"),
            ])
            .await
            .expect("apply");

        assert_eq!(responses[0].offset, Some(0));
        assert_eq!(responses[1].offset, Some(1));
        assert_eq!(log.read(1).expect("read").value, b"second");

        let (last, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(last.map(|l| l.index), Some(1));
    }

    #[tokio::test]
    async fn applied_state_survives_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let (_log, sm) = open_machine(dir.path());
            let mut sm = sm;
            sm.apply(vec![append_entry(1, 0, b"persisted")])
                .await
                .expect("apply");
        }
        let (_log, sm) = open_machine(dir.path());
        let mut sm = sm;
        let (last, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(last.map(|l| l.index), Some(0));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_resets_offset_space() {
        let dir = TempDir::new().expect("create temp dir");
        let (_log, sm) = open_machine(dir.path());
        let mut sm = sm;
        sm.apply((0..4).map(|i| append_entry(1, i, b"snap")).collect::<Vec<_>>())
            .await
            .expect("apply");

        let snapshot = sm.build_snapshot().await.expect("build snapshot");

        // A fresh node installs the snapshot and ends up with the same records.
        let dir2 = TempDir::new().expect("create temp dir");
        let (log2, sm2) = open_machine(dir2.path());
        let mut sm2 = sm2;
        sm2.install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .expect("install");

        assert_eq!(log2.lowest_offset(), 0);
        assert_eq!(log2.highest_offset(), 3);
        assert_eq!(log2.read(2).expect("read").value, b"snap");

        let restored = sm2.get_current_snapshot().await.expect("get snapshot");
        assert!(restored.is_some());
    }
}
