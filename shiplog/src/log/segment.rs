//! A segment pairs a store file with its index.

use crate::error::{LogError, Result};
use crate::log::config::SegmentConfig;
use crate::log::index::Index;
use crate::log::store::Store;
use crate::proto::Record;
use prost::Message;
use std::path::Path;
use std::sync::Arc;

/// A contiguous slice of the log: `<base_offset>.store` + `<base_offset>.index`.
///
/// `base_offset` is the absolute offset of the first record this segment
/// holds; `next_offset` is assigned to the next appended record.
pub struct Segment {
    pub(crate) store: Arc<Store>,
    pub(crate) index: Index,
    pub(crate) base_offset: u64,
    pub(crate) next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    /// Open (creating if absent) the segment files in `dir`, then derive
    /// `next_offset` from the last index entry.
    pub fn open(dir: impl AsRef<Path>, base_offset: u64, config: SegmentConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Arc::new(Store::open(dir.join(format!("{}.store", base_offset)))?);
        let index = Index::open(
            dir.join(format!("{}.index", base_offset)),
            config.max_index_bytes,
        )?;
        let next_offset = match index.read(-1) {
            Ok((relative, _)) => base_offset + relative as u64 + 1,
            Err(LogError::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };
        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Append a record, assigning it the segment's next offset. The index
    /// entry is written after the store bytes; if the index write fails the
    /// store bytes are left behind unreferenced.
    pub fn append(&mut self, record: &mut Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;
        let bytes = record.encode_to_vec();
        let (_, pos) = self.store.append(&bytes)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at absolute offset `off`.
    pub fn read(&self, off: u64) -> Result<Record> {
        let (_, pos) = self.index.read((off - self.base_offset) as i64)?;
        let bytes = self.store.read(pos)?;
        Ok(Record::decode(bytes.as_slice())?)
    }

    /// Whether the store or the index has reached its configured cap.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
            || self.index.is_maxed()
    }

    /// Close and delete both files.
    pub fn remove(&self) -> Result<()> {
        self.index.remove()?;
        self.store.remove()?;
        Ok(())
    }

    /// Flush and close both files.
    pub fn close(&self) -> Result<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Shared handle to the store, used to build multi-segment readers.
    pub(crate) fn store_handle(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}
