//! Stable store for consensus metadata.
//!
//! Vote, committed, and last-purged log ids persist as JSON files under the
//! stable directory, written to a tmp file and renamed into place.

use crate::error::Result;
use crate::raft::types::{RaftLogId, RaftVote};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedVote {
    term: u64,
    node_id: u64,
    committed: bool,
}

/// Key-value store for cluster metadata the consensus layer must not lose.
pub struct StableStore {
    dir: PathBuf,
}

impl StableStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn save_vote(&self, vote: &RaftVote) -> Result<()> {
        self.save(
            "vote.json",
            &PersistedVote {
                term: vote.leader_id().term,
                node_id: vote.leader_id().node_id,
                committed: vote.is_committed(),
            },
        )
    }

    pub fn read_vote(&self) -> Result<Option<RaftVote>> {
        Ok(self.load::<PersistedVote>("vote.json")?.map(|p| {
            let mut vote = RaftVote::new(p.term, p.node_id);
            if p.committed {
                vote.commit();
            }
            vote
        }))
    }

    pub fn save_committed(&self, committed: Option<RaftLogId>) -> Result<()> {
        self.save("committed.json", &committed)
    }

    pub fn read_committed(&self) -> Result<Option<RaftLogId>> {
        Ok(self.load::<Option<RaftLogId>>("committed.json")?.flatten())
    }

    pub fn save_last_purged(&self, purged: Option<RaftLogId>) -> Result<()> {
        self.save("purged.json", &purged)
    }

    pub fn read_last_purged(&self) -> Result<Option<RaftLogId>> {
        Ok(self.load::<Option<RaftLogId>>("purged.json")?.flatten())
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn vote_roundtrips_across_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let stable = StableStore::open(dir.path()).expect("open");
            stable
                .save_vote(&RaftVote::new(5, 3))
                .expect("save vote");
        }
        let stable = StableStore::open(dir.path()).expect("reopen");
        let vote = stable.read_vote().expect("read vote").expect("vote exists");
        assert_eq!(vote.leader_id().term, 5);
        assert_eq!(vote.leader_id().node_id, 3);
    }

    #[test]
    fn missing_keys_read_as_none() {
        let dir = TempDir::new().expect("create temp dir");
        let stable = StableStore::open(dir.path()).expect("open");
        assert!(stable.read_vote().expect("read").is_none());
        assert!(stable.read_committed().expect("read").is_none());
        assert!(stable.read_last_purged().expect("read").is_none());
    }
}
