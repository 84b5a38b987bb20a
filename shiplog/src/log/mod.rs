//! The local commit log: an ordered set of segments over one directory.
//!
//! Only the last (active) segment accepts appends. Offsets are assigned
//! under the log's exclusive lock and are strictly increasing with no gaps
//! across segment rotations.

mod config;
mod index;
mod segment;
mod store;

pub use config::SegmentConfig;
pub use index::{ENT_WIDTH, OFF_WIDTH, POS_WIDTH};
pub use store::LEN_WIDTH;

use crate::error::{LogError, Result};
use crate::proto::Record;
use parking_lot::RwLock;
use segment::Segment;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::Store;

struct LogInner {
    segments: Vec<Segment>,
    config: SegmentConfig,
}

impl LogInner {
    fn active(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("log always has a segment")
    }

    fn highest_offset(&self) -> u64 {
        let next = self.segments.last().map(|s| s.next_offset).unwrap_or(0);
        next.saturating_sub(1)
    }
}

/// An ordered collection of segments plus the active-segment pointer.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

impl Log {
    /// Open the log at `dir`, scanning for existing segments. A fresh
    /// directory gets one segment at `config.initial_offset`.
    pub fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let segments = Self::scan(&dir, &config)?;
        Ok(Self {
            dir,
            inner: RwLock::new(LogInner { segments, config }),
        })
    }

    /// Collect base offsets from segment filenames (each segment contributes
    /// a `.store` and an `.index` file), open them ascending, and create the
    /// initial segment if the directory holds none.
    fn scan(dir: &Path, config: &SegmentConfig) -> Result<Vec<Segment>> {
        let mut base_offsets = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            if let Some(off) = stem.and_then(|s| s.parse::<u64>().ok()) {
                base_offsets.push(off);
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::open(dir, base, config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(dir, config.initial_offset, config.clone())?);
        }
        Ok(segments)
    }

    /// Append a record, rotating in a new segment when the active one is
    /// maxed. Returns the assigned offset.
    pub fn append(&self, record: &mut Record) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner.active().is_maxed() {
            let base = inner.highest_offset() + 1;
            let config = inner.config.clone();
            let segment = Segment::open(&self.dir, base, config)?;
            inner.segments.push(segment);
        }
        inner.active().append(record)
    }

    /// Read the record stored at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let inner = self.inner.read();
        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset <= offset && offset < s.next_offset);
        match segment {
            Some(s) => s.read(offset),
            None => Err(LogError::OffsetOutOfRange { offset }),
        }
    }

    /// Whether the log holds no records. A log is empty when its only
    /// segment has not been appended to (truncation always leaves a fresh
    /// segment behind).
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        let first = inner.segments.first().map(|s| s.base_offset).unwrap_or(0);
        let next = inner.segments.last().map(|s| s.next_offset).unwrap_or(0);
        next == first
    }

    /// Offset of the oldest record.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.first().map(|s| s.base_offset).unwrap_or(0)
    }

    /// Offset of the newest record, or 0 when the log is empty.
    pub fn highest_offset(&self) -> u64 {
        self.inner.read().highest_offset()
    }

    /// Remove every segment whose records all fall at or below `lowest`.
    /// If nothing survives, a fresh segment is allocated at `lowest + 1` so
    /// the offset space continues gap-free.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let mut kept = Vec::with_capacity(inner.segments.len());
        for segment in inner.segments.drain(..) {
            if segment.next_offset <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, lowest + 1, inner.config.clone())?);
        }
        inner.segments = kept;
        Ok(())
    }

    /// Remove every record at or above `offset` (conflict truncation for the
    /// consensus write-ahead log). Whole segments past the cut are deleted;
    /// a segment straddling it is rebuilt from its surviving records.
    pub fn truncate_from(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let config = inner.config.clone();
        let mut kept = Vec::with_capacity(inner.segments.len());
        for segment in inner.segments.drain(..) {
            if segment.base_offset >= offset {
                segment.remove()?;
            } else if segment.next_offset > offset {
                let mut survivors = Vec::with_capacity((offset - segment.base_offset) as usize);
                for off in segment.base_offset..offset {
                    survivors.push(segment.read(off)?);
                }
                let base = segment.base_offset;
                segment.remove()?;
                let mut rebuilt = Segment::open(&self.dir, base, config.clone())?;
                for mut record in survivors {
                    rebuilt.append(&mut record)?;
                }
                kept.push(rebuilt);
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, offset, config)?);
        }
        inner.segments = kept;
        Ok(())
    }

    /// Delete all data and start over at the configured initial offset.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.drain(..) {
            segment.remove()?;
        }
        let config = inner.config.clone();
        inner
            .segments
            .push(Segment::open(&self.dir, config.initial_offset, config)?);
        Ok(())
    }

    /// Delete all data and start over at `initial_offset`. Used when
    /// restoring from a snapshot whose first record dictates the base.
    pub fn reset_with_initial(&self, initial_offset: u64) -> Result<()> {
        self.inner.write().config.initial_offset = initial_offset;
        self.reset()
    }

    /// A reader over the raw store bytes of every segment in order, each
    /// starting at byte 0. Used to stream snapshots.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        LogReader {
            stores: inner.segments.iter().map(|s| s.store_handle()).collect(),
            current: 0,
            pos: 0,
        }
    }

    /// Flush and close every segment.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.read();
        for segment in inner.segments.iter() {
            segment.close()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Concatenated read over the store files of every segment.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.stores.len() {
            let store = &self.stores[self.current];
            let n = store
                .read_at(buf, self.pos)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.pos = 0;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn small_config() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENT_WIDTH * 3,
            initial_offset: 0,
        }
    }

    #[test]
    fn append_reads_back_in_order() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), SegmentConfig::default()).expect("open");

        for want in 0u64..3 {
            let off = log.append(&mut record(b"hello world")).expect("append");
            assert_eq!(off, want);
            let got = log.read(off).expect("read");
            assert_eq!(got.offset, want);
            assert_eq!(got.value, b"hello world");
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
    }

    #[test]
    fn out_of_range_read_fails() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), SegmentConfig::default()).expect("open");
        log.append(&mut record(b"only one")).expect("append");
        match log.read(1) {
            Err(LogError::OffsetOutOfRange { offset }) => assert_eq!(offset, 1),
            other => panic!("expected out of range, got {:?}", other.map(|r| r.offset)),
        }
    }

    #[test]
    fn rotation_keeps_offsets_gap_free() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");

        // Three entries fill a segment; ten appends force rotations.
        for want in 0u64..10 {
            let off = log.append(&mut record(b"x")).expect("append");
            assert_eq!(off, want);
        }
        for off in 0u64..10 {
            assert_eq!(log.read(off).expect("read").offset, off);
        }
    }

    #[test]
    fn reopen_recovers_existing_state() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let log = Log::open(dir.path(), small_config()).expect("open");
            for _ in 0..7 {
                log.append(&mut record(b"persisted")).expect("append");
            }
            log.close().expect("close");
        }
        let log = Log::open(dir.path(), small_config()).expect("reopen");
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 6);
        assert_eq!(log.read(6).expect("read").value, b"persisted");
    }

    #[test]
    fn truncate_removes_old_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");
        for _ in 0..9 {
            log.append(&mut record(b"x")).expect("append");
        }
        log.truncate(5).expect("truncate");
        assert!(log.read(2).is_err());
        assert!(log.lowest_offset() >= 6);
        assert_eq!(log.read(8).expect("read").offset, 8);
    }

    #[test]
    fn truncate_past_highest_continues_gap_free() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");
        for _ in 0..4 {
            log.append(&mut record(b"x")).expect("append");
        }
        log.truncate(10).expect("truncate");
        let off = log.append(&mut record(b"resumed")).expect("append");
        assert_eq!(off, 11);
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");
        for _ in 0..8 {
            log.append(&mut record(b"x")).expect("append");
        }
        log.truncate_from(5).expect("truncate_from");
        assert_eq!(log.highest_offset(), 4);
        assert!(log.read(5).is_err());
        assert_eq!(log.read(4).expect("read").offset, 4);
        // Appends continue at the cut.
        assert_eq!(log.append(&mut record(b"y")).expect("append"), 5);
    }

    #[test]
    fn reader_streams_every_frame() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");
        let mut want = 0u64;
        for _ in 0..5 {
            let mut rec = record(b"snapshot me");
            log.append(&mut rec).expect("append");
            want += LEN_WIDTH + rec.encode_to_vec().len() as u64;
        }
        let mut all = Vec::new();
        log.reader().read_to_end(&mut all).expect("read_to_end");
        assert_eq!(all.len() as u64, want);
    }

    #[test]
    fn reset_with_initial_restarts_offset_space() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_config()).expect("open");
        log.append(&mut record(b"x")).expect("append");
        log.reset_with_initial(42).expect("reset");
        assert_eq!(log.append(&mut record(b"y")).expect("append"), 42);
        assert_eq!(log.lowest_offset(), 42);
    }
}
