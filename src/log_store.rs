//! Shared append-only packet log.
//!
//! A single file on disk serves both as the durable record of every packet
//! and as the source of every reply. All writers and every reply snapshot
//! go through one mutex:
//! - `append` holds it for the duration of one write
//! - `snapshot_len` holds it only long enough to read the current size
//!
//! Bytes below a snapshot never change afterwards, so `stream_to` can copy
//! them to a client without keeping the lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// Append-only log file shared by all connection workers and the ticker.
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LogStore {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let path = path.into();
        File::create(&path)?;
        info!(path = %path.display(), "Initialized packet log");
        Ok(Arc::new(Self {
            path,
            lock: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mutex guards no data, so a panic while holding it leaves nothing
    /// inconsistent behind.
    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `bytes` as one uninterrupted write.
    ///
    /// The file is opened and closed per call so no handle outlives the
    /// operation.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let _guard = self.exclusive();
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(bytes)?;
        file.flush()?;
        trace!(bytes = bytes.len(), "Appended to packet log");
        Ok(())
    }

    /// Current size of the log in bytes.
    pub fn snapshot_len(&self) -> io::Result<u64> {
        let _guard = self.exclusive();
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Copy the first `len` bytes of the log into `sink`.
    ///
    /// Partial writes on the sink are retried until everything is sent or
    /// the sink fails. Returns an `UnexpectedEof` error if the log holds
    /// fewer than `len` bytes.
    pub fn stream_to<W: Write>(&self, sink: &mut W, len: u64) -> io::Result<u64> {
        let file = File::open(&self.path)?;
        let sent = io::copy(&mut file.take(len), sink)?;
        if sent < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("packet log shorter than snapshot ({sent} of {len} bytes)"),
            ));
        }
        Ok(sent)
    }

    /// Read the whole log into memory.
    #[cfg(test)]
    pub fn contents(&self) -> io::Result<Vec<u8>> {
        let _guard = self.exclusive();
        std::fs::read(&self.path)
    }

    /// Delete the log file.
    pub fn remove(&self) -> io::Result<()> {
        let _guard = self.exclusive();
        std::fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "Removed packet log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_create_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"left over from last run\n").unwrap();

        let store = LogStore::create(&path).unwrap();
        assert_eq!(store.snapshot_len().unwrap(), 0);
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();

        store.append(b"hello\n").unwrap();
        store.append(b"world\n").unwrap();

        assert_eq!(store.contents().unwrap(), b"hello\nworld\n");
        assert_eq!(store.snapshot_len().unwrap(), 12);
    }

    #[test]
    fn test_stream_snapshot_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();

        store.append(b"hello\n").unwrap();
        let len = store.snapshot_len().unwrap();
        store.append(b"world\n").unwrap();

        let mut out = Vec::new();
        let sent = store.stream_to(&mut out, len).unwrap();
        assert_eq!(sent, 6);
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn test_stream_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        store.append(b"abc\n").unwrap();

        let mut out = Vec::new();
        let err = store.stream_to(&mut out, 100).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_concurrent_appends_not_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut line = vec![b'a' + i; 4096];
                    line.push(b'\n');
                    for _ in 0..10 {
                        store.append(&line).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = store.contents().unwrap();
        let lines: Vec<&[u8]> = contents.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 80);
        for line in lines {
            assert_eq!(line.len(), 4096);
            assert!(line.iter().all(|&b| b == line[0]));
        }
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let store = LogStore::create(&path).unwrap();
        store.append(b"x\n").unwrap();

        store.remove().unwrap();
        assert!(!path.exists());
        assert!(store.append(b"y\n").is_err());
    }
}
