//! Memory-mapped offset index.
//!
//! Each entry is fixed width: a 4-byte big-endian offset relative to the
//! segment's base, followed by the 8-byte big-endian store position. The
//! backing file is truncated up to the configured maximum before mapping
//! (a mapped region cannot grow), and truncated back down to the real data
//! size on close so the last entry is the last bytes of the file.
//!
//! After an unclean exit the file is left at its mapped size with a
//! zero-padded tail; `size` is re-derived from the on-disk length, so reads
//! never interpret the padding as entries once the file was clean-closed.

use crate::error::{LogError, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Width of the relative-offset column.
pub const OFF_WIDTH: u64 = 4;
/// Width of the store-position column.
pub const POS_WIDTH: u64 = 8;
/// Width of a full index entry.
pub const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

struct IndexInner {
    file: File,
    /// None once the index has been closed.
    mmap: Option<MmapMut>,
    /// Bytes of real entries; also the write position for the next entry.
    size: u64,
}

/// Index maps relative record offsets to positions in the store file.
pub struct Index {
    path: PathBuf,
    inner: Mutex<IndexInner>,
}

impl Index {
    /// Open (creating if absent) the index file at `path`, growing it to
    /// `max_index_bytes` and mapping the full range read/write.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(max_index_bytes as usize)
                .map_mut(&file)
                .map_err(|e| LogError::Storage(format!("mmap {}: {}", path.display(), e)))?
        };
        Ok(Self {
            path,
            inner: Mutex::new(IndexInner {
                file,
                mmap: Some(mmap),
                size,
            }),
        })
    }

    /// Append an entry. Fails with [`LogError::EndOfIndex`] when the mapped
    /// region has no room for another entry.
    pub fn write(&self, off: u32, pos: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        let mmap = inner.mmap.as_mut().ok_or(LogError::EndOfIndex)?;
        if (mmap.len() as u64) < size + ENT_WIDTH {
            return Err(LogError::EndOfIndex);
        }
        let at = size as usize;
        mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize].copy_from_slice(&pos.to_be_bytes());
        inner.size += ENT_WIDTH;
        Ok(())
    }

    /// Read entry `i`, or the last entry when `i == -1`. Returns the relative
    /// offset and the store position.
    pub fn read(&self, i: i64) -> Result<(u32, u64)> {
        let inner = self.inner.lock();
        if inner.size == 0 {
            return Err(LogError::EndOfIndex);
        }
        let mmap = inner.mmap.as_ref().ok_or(LogError::EndOfIndex)?;
        let slot = if i == -1 {
            (inner.size / ENT_WIDTH) - 1
        } else {
            i as u64
        };
        let at = slot * ENT_WIDTH;
        if inner.size < at + ENT_WIDTH {
            return Err(LogError::EndOfIndex);
        }
        let at = at as usize;
        let mut off = [0u8; OFF_WIDTH as usize];
        off.copy_from_slice(&mmap[at..at + OFF_WIDTH as usize]);
        let mut pos = [0u8; POS_WIDTH as usize];
        pos.copy_from_slice(&mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]);
        Ok((u32::from_be_bytes(off), u64::from_be_bytes(pos)))
    }

    /// Whether another entry would overflow the mapped region.
    pub fn is_maxed(&self) -> bool {
        let inner = self.inner.lock();
        match &inner.mmap {
            Some(mmap) => (mmap.len() as u64) < inner.size + ENT_WIDTH,
            None => true,
        }
    }

    /// Bytes of real entries written.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Sync the map, unmap, and truncate the file back to the data size so a
    /// reopen derives the correct entry count.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mmap) = inner.mmap.take() {
            mmap.flush()
                .map_err(|e| LogError::Storage(format!("mmap flush: {}", e)))?;
            drop(mmap);
            inner.file.sync_all()?;
            let size = inner.size;
            inner.file.set_len(size)?;
        }
        Ok(())
    }

    /// Close and delete the index file.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX_INDEX_BYTES: u64 = 1024;

    #[test]
    fn write_read() {
        let dir = TempDir::new().expect("create temp dir");
        let index = Index::open(dir.path().join("0.index"), MAX_INDEX_BYTES).expect("open");

        assert!(matches!(index.read(-1), Err(LogError::EndOfIndex)));

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).expect("write");
        }
        for (i, (off, pos)) in entries.iter().enumerate() {
            let (got_off, got_pos) = index.read(i as i64).expect("read");
            assert_eq!(got_off, *off);
            assert_eq!(got_pos, *pos);
        }

        let (last_off, last_pos) = index.read(-1).expect("read last");
        assert_eq!((last_off, last_pos), entries[entries.len() - 1]);

        assert!(matches!(
            index.read(entries.len() as i64),
            Err(LogError::EndOfIndex)
        ));
    }

    #[test]
    fn rejects_writes_when_full() {
        let dir = TempDir::new().expect("create temp dir");
        let index = Index::open(dir.path().join("0.index"), ENT_WIDTH * 2).expect("open");
        index.write(0, 0).expect("write");
        index.write(1, 12).expect("write");
        assert!(index.is_maxed());
        assert!(matches!(index.write(2, 24), Err(LogError::EndOfIndex)));
    }

    #[test]
    fn size_survives_close_and_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("0.index");
        {
            let index = Index::open(&path, MAX_INDEX_BYTES).expect("open");
            index.write(0, 0).expect("write");
            index.write(1, 10).expect("write");
            index.close().expect("close");
        }
        // Clean close truncates the file to exactly two entries.
        assert_eq!(
            std::fs::metadata(&path).expect("stat").len(),
            2 * ENT_WIDTH
        );
        let index = Index::open(&path, MAX_INDEX_BYTES).expect("reopen");
        let (off, pos) = index.read(-1).expect("read last");
        assert_eq!((off, pos), (1, 10));
    }
}
