//! Append-only payload file.
//!
//! Records are framed as an 8-byte big-endian length followed by the payload
//! bytes. Appends go through a buffered writer so small records coalesce into
//! one syscall; reads flush the buffer first so buffered data is visible.

use crate::error::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Width of the length prefix on every stored record.
pub const LEN_WIDTH: u64 = 8;

struct StoreInner {
    buf: BufWriter<File>,
    /// Bytes on disk plus bytes still sitting in the writer buffer.
    size: u64,
}

/// A store holds a file and appends and reads raw record frames.
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Open (creating if absent) the store file at `path`. An existing file's
    /// size is picked up so appends continue where the last run stopped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                buf: BufWriter::new(file),
                size,
            }),
        })
    }

    /// Append `p` as a length-prefixed frame. Returns the number of bytes
    /// written (prefix included) and the position the frame starts at.
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.buf.write_all(&(p.len() as u64).to_be_bytes())?;
        inner.buf.write_all(p)?;
        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the record frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        let file = inner.buf.get_ref();
        let mut len = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len, pos)?;
        let mut payload = vec![0u8; u64::from_be_bytes(len) as usize];
        file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Random read of raw bytes at `off` into `dst`. Returns bytes read.
    pub fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        Ok(inner.buf.get_ref().read_at(dst, off)?)
    }

    /// Current size in bytes (on disk + buffered).
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Flush buffered data and sync the file.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.buf.get_ref().sync_all()?;
        Ok(())
    }

    /// Close and delete the store file.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"hello world";

    #[test]
    fn append_read() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("0.store");
        let store = Store::open(&path).expect("open store");

        let mut positions = Vec::new();
        for _ in 0..3 {
            let (n, pos) = store.append(PAYLOAD).expect("append");
            assert_eq!(n, LEN_WIDTH + PAYLOAD.len() as u64);
            positions.push(pos);
        }

        for (i, pos) in positions.iter().enumerate() {
            assert_eq!(*pos, i as u64 * (LEN_WIDTH + PAYLOAD.len() as u64));
            let got = store.read(*pos).expect("read");
            assert_eq!(got, PAYLOAD);
        }
    }

    #[test]
    fn read_at_flushes_buffer() {
        let dir = TempDir::new().expect("create temp dir");
        let store = Store::open(dir.path().join("0.store")).expect("open store");
        store.append(PAYLOAD).expect("append");

        let mut len = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut len, 0).expect("read_at");
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(len), PAYLOAD.len() as u64);
    }

    #[test]
    fn size_survives_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("0.store");
        {
            let store = Store::open(&path).expect("open store");
            store.append(PAYLOAD).expect("append");
            store.close().expect("close");
        }
        let store = Store::open(&path).expect("reopen store");
        assert_eq!(store.size(), LEN_WIDTH + PAYLOAD.len() as u64);
        assert_eq!(store.read(0).expect("read"), PAYLOAD);
    }
}
