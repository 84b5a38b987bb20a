//! The segmented log presented to OpenRaft as its write-ahead log.
//!
//! Consensus entries live in their own offset space under `raft/log`,
//! independent of the application log. Each entry is stored as a record
//! whose value is the serde_json encoding of the whole entry; the record
//! offset must equal the entry index, which holds because OpenRaft appends
//! indexes sequentially from 0 and conflict truncation rewinds the log to
//! the cut before re-appending.

use crate::error::{LogError, Result};
use crate::log::Log;
use crate::proto::Record;
use crate::raft::stable::StableStore;
use crate::raft::types::{RaftEntry, RaftLogId, RaftVote, StorageErr, TypeConfig};
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{EntryPayload, LogState, RaftLogReader, StorageIOError};
use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

/// Record-type tags for stored consensus entries.
const ENTRY_BLANK: u32 = 0;
const ENTRY_NORMAL: u32 = 1;
const ENTRY_MEMBERSHIP: u32 = 2;

/// Persistent OpenRaft log storage over a [`Log`] plus a stable store for
/// vote and purge metadata.
#[derive(Clone)]
pub struct LogStore {
    log: Arc<Log>,
    stable: Arc<StableStore>,
}

impl LogStore {
    pub fn new(log: Arc<Log>, stable: Arc<StableStore>) -> Self {
        Self { log, stable }
    }

    /// The backing log, so the owner can flush and close it on shutdown.
    pub fn log(&self) -> Arc<Log> {
        Arc::clone(&self.log)
    }

    fn decode_entry(record: &Record) -> Result<RaftEntry> {
        Ok(serde_json::from_slice(&record.value)?)
    }

    fn encode_entry(entry: &RaftEntry) -> Result<Record> {
        let kind = match entry.payload {
            EntryPayload::Blank => ENTRY_BLANK,
            EntryPayload::Normal(_) => ENTRY_NORMAL,
            EntryPayload::Membership(_) => ENTRY_MEMBERSHIP,
        };
        Ok(Record {
            offset: 0,
            term: entry.log_id.leader_id.term,
            record_type: kind,
            value: serde_json::to_vec(entry)?,
        })
    }

    fn last_entry(&self) -> Result<Option<RaftEntry>> {
        if self.log.is_empty() {
            return Ok(None);
        }
        let record = self.log.read(self.log.highest_offset())?;
        Ok(Some(Self::decode_entry(&record)?))
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<RaftEntry>, StorageErr> {
        if self.log.is_empty() {
            return Ok(Vec::new());
        }
        let lowest = self.log.lowest_offset();
        let highest = self.log.highest_offset();
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => lowest,
        }
        .max(lowest);
        let end = match range.end_bound() {
            Bound::Included(&n) => n.saturating_add(1),
            Bound::Excluded(&n) => n,
            Bound::Unbounded => highest + 1,
        }
        .min(highest + 1);

        let mut entries = Vec::new();
        let mut offset = start;
        while offset < end {
            let record = self
                .log
                .read(offset)
                .map_err(|e| StorageIOError::read_logs(&e))?;
            entries.push(Self::decode_entry(&record).map_err(|e| StorageIOError::read_logs(&e))?);
            offset += 1;
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> std::result::Result<LogState<TypeConfig>, StorageErr> {
        let last_purged = self
            .stable
            .read_last_purged()
            .map_err(|e| StorageIOError::read_logs(&e))?;
        let last_log_id = self
            .last_entry()
            .map_err(|e| StorageIOError::read_logs(&e))?
            .map(|e| e.log_id)
            .or(last_purged);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<RaftLogId>,
    ) -> std::result::Result<(), StorageErr> {
        self.stable
            .save_committed(committed)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> std::result::Result<Option<RaftLogId>, StorageErr> {
        let committed = self
            .stable
            .read_committed()
            .map_err(|e| StorageIOError::read_logs(&e))?;
        Ok(committed)
    }

    async fn save_vote(&mut self, vote: &RaftVote) -> std::result::Result<(), StorageErr> {
        self.stable
            .save_vote(vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<RaftVote>, StorageErr> {
        let vote = self
            .stable
            .read_vote()
            .map_err(|e| StorageIOError::read_vote(&e))?;
        Ok(vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> std::result::Result<(), StorageErr>
    where
        I: IntoIterator<Item = RaftEntry>,
    {
        for entry in entries {
            let mut record =
                Self::encode_entry(&entry).map_err(|e| StorageIOError::write_logs(&e))?;
            let offset = self
                .log
                .append(&mut record)
                .map_err(|e| StorageIOError::write_logs(&e))?;
            if offset != entry.log_id.index {
                let e = LogError::Storage(format!(
                    "log index {} landed at offset {}",
                    entry.log_id.index, offset
                ));
                return Err(StorageIOError::write_logs(&e).into());
            }
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: RaftLogId) -> std::result::Result<(), StorageErr> {
        self.log
            .truncate_from(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: RaftLogId) -> std::result::Result<(), StorageErr> {
        self.stable
            .save_last_purged(Some(log_id))
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.log
            .truncate(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::SegmentConfig;
    use crate::raft::types::LogCommand;
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;

    fn open_store(dir: &std::path::Path) -> LogStore {
        let config = SegmentConfig {
            max_store_bytes: 4096,
            max_index_bytes: 4096,
            initial_offset: 0,
        };
        let log = Arc::new(Log::open(dir.join("log"), config).expect("open log"));
        let stable = Arc::new(StableStore::open(dir.join("stable")).expect("open stable"));
        LogStore::new(log, stable)
    }

    fn entry(term: u64, index: u64) -> RaftEntry {
        RaftEntry {
            log_id: RaftLogId::new(CommittedLeaderId::new(term, 0), index),
            payload: EntryPayload::Normal(LogCommand::Append {
                value: format!("entry-{}", index).into_bytes(),
            }),
        }
    }

    async fn append_all(store: &mut LogStore, entries: Vec<RaftEntry>) {
        for e in entries {
            let mut record = LogStore::encode_entry(&e).expect("encode");
            let offset = store.log.append(&mut record).expect("append");
            assert_eq!(offset, e.log_id.index);
        }
    }

    #[tokio::test]
    async fn entries_roundtrip() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = open_store(dir.path());

        append_all(&mut store, (0..5).map(|i| entry(1, i)).collect()).await;

        let got = store.try_get_log_entries(1..4).await.expect("read range");
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].log_id.index, 1);
        assert_eq!(got[2].log_id.index, 3);

        let state = store.get_log_state().await.expect("state");
        assert_eq!(state.last_log_id.map(|l| l.index), Some(4));
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn truncate_discards_conflicting_suffix() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = open_store(dir.path());
        append_all(&mut store, (0..6).map(|i| entry(1, i)).collect()).await;

        store
            .truncate(RaftLogId::new(CommittedLeaderId::new(1, 0), 3))
            .await
            .expect("truncate");

        let state = store.get_log_state().await.expect("state");
        assert_eq!(state.last_log_id.map(|l| l.index), Some(2));

        // Re-append at the cut, as a new leader would.
        append_all(&mut store, vec![entry(2, 3)]).await;
        let got = store.try_get_log_entries(3..=3).await.expect("read");
        assert_eq!(got[0].log_id.leader_id.term, 2);
    }

    #[tokio::test]
    async fn purge_keeps_state_via_stable_store() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = open_store(dir.path());
        append_all(&mut store, (0..4).map(|i| entry(1, i)).collect()).await;

        let purge_id = RaftLogId::new(CommittedLeaderId::new(1, 0), 3);
        store.purge(purge_id).await.expect("purge");

        let state = store.get_log_state().await.expect("state");
        assert_eq!(state.last_purged_log_id, Some(purge_id));
        assert_eq!(state.last_log_id, Some(purge_id));
        assert!(store
            .try_get_log_entries(0..4)
            .await
            .expect("read")
            .is_empty());
    }
}
