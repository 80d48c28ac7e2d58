//! The logical log abstraction (spec §3.2, §9).
//!
//! Exactly one trait with one production adapter and one in-memory test
//! adapter — the spec is explicit that we should not replicate the
//! KLogManager/FileLogManager split of the original. `FileLogicalLog`
//! borrows the teacher's atomic-replace idiom (write to a sibling `_copy`
//! file, then rename over the original) for head truncation, since
//! truncating in place would leave a half-written file visible to a reader
//! that crashes mid-rewrite.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{ReplicatorError, Result};
use crate::record::RecordPosition;

/// A reader lease. Holding one blocks `truncate_prefix` on the log it was
/// issued from; dropping it releases the block. Readers must not outlive a
/// rename-based truncation, since the file handle they hold would then
/// point at unlinked storage.
pub struct ReaderLease<'a> {
    outstanding: &'a AtomicI64,
}

impl Drop for ReaderLease<'_> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Append-only byte store backing the physical log, addressed by absolute
/// byte offset. Offsets below the current head (see `truncate_prefix`) are
/// no longer readable.
pub trait LogicalLog: Send + Sync {
    /// Append `bytes` at the current end of the log, returning the offset it
    /// was written at.
    fn append(&self, bytes: &[u8]) -> Result<RecordPosition>;

    /// Read `len` bytes starting at `start`. Fails if the range overlaps a
    /// truncated prefix or extends past the current length.
    fn read_at(&self, start: RecordPosition, len: usize) -> Result<Vec<u8>>;

    /// Current end-of-log offset.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lowest offset still readable.
    fn head(&self) -> u64;

    /// Discard all bytes below `new_head`. Blocks (returns
    /// `InsufficientResources`, for the caller to retry) while any
    /// `ReaderLease` is outstanding, since a rename-based implementation
    /// cannot safely swap the file under a live reader.
    fn truncate_prefix(&self, new_head: RecordPosition) -> Result<()>;

    /// Register an in-flight read so truncation can wait it out. Production
    /// callers should hold the lease for the duration of the read.
    fn lease_reader(&self) -> ReaderLease<'_>;

    /// Ensure durability of everything appended so far.
    fn flush(&self) -> Result<()>;

    /// Discard everything at or past `new_len` (false-progress truncate-tail,
    /// spec §4.10). Unlike `truncate_prefix`, this never needs a reader-lease
    /// wait: a tail truncation only ever removes records a reader has no
    /// business reading yet (everything above the new tail is, by
    /// definition, not part of this replica's acknowledged history).
    fn truncate_suffix(&self, new_len: RecordPosition) -> Result<()>;
}

/// Disk-backed logical log. Growth is a plain `write` at the current
/// end-of-file; head truncation rewrites the retained suffix into a sibling
/// `<path>_copy` file and renames it over `path`.
pub struct FileLogicalLog {
    path: PathBuf,
    file: Mutex<File>,
    len: AtomicU64,
    head: AtomicU64,
    outstanding_readers: AtomicI64,
}

impl FileLogicalLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            len: AtomicU64::new(0),
            head: AtomicU64::new(0),
            outstanding_readers: AtomicI64::new(0),
        })
    }

    /// Reopen an existing log file, trusting the caller to supply the
    /// correct logical head (recovered separately from an indexing record).
    pub fn open_existing(path: impl Into<PathBuf>, head: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file: Mutex::new(file),
            len: AtomicU64::new(len),
            head: AtomicU64::new(head),
            outstanding_readers: AtomicI64::new(0),
        })
    }

    fn copy_path(&self) -> PathBuf {
        let mut copy = self.path.clone();
        let mut file_name = copy.file_name().unwrap_or_default().to_os_string();
        file_name.push("_copy");
        copy.set_file_name(file_name);
        copy
    }
}

impl LogicalLog for FileLogicalLog {
    fn append(&self, bytes: &[u8]) -> Result<RecordPosition> {
        let mut file = self.file.lock().unwrap();
        let offset = self.len.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.len.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Ok(offset)
    }

    fn read_at(&self, start: RecordPosition, len: usize) -> Result<Vec<u8>> {
        if start < self.head.load(Ordering::Acquire) {
            return Err(ReplicatorError::InvalidArgument(format!(
                "read at {} precedes truncated head",
                start
            )));
        }
        let end = start + len as u64;
        if end > self.len.load(Ordering::Acquire) {
            return Err(ReplicatorError::InvalidArgument(format!(
                "read range [{}, {}) extends past end of log",
                start, end
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    fn truncate_prefix(&self, new_head: RecordPosition) -> Result<()> {
        if self.outstanding_readers.load(Ordering::Acquire) > 0 {
            return Err(ReplicatorError::InsufficientResources(
                "logical log has outstanding readers, retry truncation later".into(),
            ));
        }
        let current_head = self.head.load(Ordering::Acquire);
        if new_head < current_head {
            return Err(ReplicatorError::InvalidArgument(
                "truncate_prefix cannot move the head backward".into(),
            ));
        }
        if new_head == current_head {
            return Ok(());
        }

        let mut file = self.file.lock().unwrap();
        let total_len = self.len.load(Ordering::Acquire);
        let retained_len = total_len.checked_sub(new_head).ok_or_else(|| {
            ReplicatorError::InvalidArgument("truncate_prefix new_head past end of log".into())
        })?;

        let copy_path = self.copy_path();
        let mut copy_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&copy_path)?;

        file.seek(SeekFrom::Start(new_head))?;
        let mut remaining = retained_len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..chunk])?;
            copy_file.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        copy_file.flush()?;
        copy_file.sync_all()?;
        drop(copy_file);

        std::fs::rename(&copy_path, &self.path)?;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        self.len.store(retained_len, Ordering::Release);
        self.head.store(new_head, Ordering::Release);
        Ok(())
    }

    fn lease_reader(&self) -> ReaderLease<'_> {
        self.outstanding_readers.fetch_add(1, Ordering::AcqRel);
        ReaderLease {
            outstanding: &self.outstanding_readers,
        }
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }

    fn truncate_suffix(&self, new_len: RecordPosition) -> Result<()> {
        let file = self.file.lock().unwrap();
        let current_len = self.len.load(Ordering::Acquire);
        if new_len > current_len {
            return Err(ReplicatorError::InvalidArgument(
                "truncate_suffix cannot grow the log".into(),
            ));
        }
        file.set_len(new_len)?;
        file.sync_all()?;
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }
}

/// In-memory adapter for unit tests that don't need a real file.
#[derive(Default)]
pub struct InMemoryLogicalLog {
    bytes: Mutex<Vec<u8>>,
    head: AtomicU64,
    outstanding_readers: AtomicI64,
}

impl InMemoryLogicalLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogicalLog for InMemoryLogicalLog {
    fn append(&self, bytes: &[u8]) -> Result<RecordPosition> {
        let mut store = self.bytes.lock().unwrap();
        let offset = self.head.load(Ordering::Acquire) + store.len() as u64;
        store.extend_from_slice(bytes);
        Ok(offset)
    }

    fn read_at(&self, start: RecordPosition, len: usize) -> Result<Vec<u8>> {
        let head = self.head.load(Ordering::Acquire);
        if start < head {
            return Err(ReplicatorError::InvalidArgument(format!(
                "read at {} precedes truncated head",
                start
            )));
        }
        let store = self.bytes.lock().unwrap();
        let local_start = (start - head) as usize;
        let local_end = local_start + len;
        store
            .get(local_start..local_end)
            .map(|s| s.to_vec())
            .ok_or_else(|| {
                ReplicatorError::InvalidArgument("read range extends past end of log".into())
            })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::Acquire) + self.bytes.lock().unwrap().len() as u64)
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    fn truncate_prefix(&self, new_head: RecordPosition) -> Result<()> {
        if self.outstanding_readers.load(Ordering::Acquire) > 0 {
            return Err(ReplicatorError::InsufficientResources(
                "logical log has outstanding readers, retry truncation later".into(),
            ));
        }
        let current_head = self.head.load(Ordering::Acquire);
        if new_head < current_head {
            return Err(ReplicatorError::InvalidArgument(
                "truncate_prefix cannot move the head backward".into(),
            ));
        }
        let mut store = self.bytes.lock().unwrap();
        let drop_count = (new_head - current_head) as usize;
        if drop_count > store.len() {
            return Err(ReplicatorError::InvalidArgument(
                "truncate_prefix new_head past end of log".into(),
            ));
        }
        store.drain(0..drop_count);
        self.head.store(new_head, Ordering::Release);
        Ok(())
    }

    fn lease_reader(&self) -> ReaderLease<'_> {
        self.outstanding_readers.fetch_add(1, Ordering::AcqRel);
        ReaderLease {
            outstanding: &self.outstanding_readers,
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate_suffix(&self, new_len: RecordPosition) -> Result<()> {
        let head = self.head.load(Ordering::Acquire);
        let mut store = self.bytes.lock().unwrap();
        let local_len = new_len.checked_sub(head).ok_or_else(|| {
            ReplicatorError::InvalidArgument("truncate_suffix cannot cut below the head".into())
        })? as usize;
        if local_len > store.len() {
            return Err(ReplicatorError::InvalidArgument(
                "truncate_suffix cannot grow the log".into(),
            ));
        }
        store.truncate(local_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_append_and_read_round_trip() {
        let log = InMemoryLogicalLog::new();
        let offset = log.append(b"hello").unwrap();
        assert_eq!(offset, 0);
        let second = log.append(b"world").unwrap();
        assert_eq!(second, 5);
        assert_eq!(log.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(log.read_at(5, 5).unwrap(), b"world");
        assert_eq!(log.len().unwrap(), 10);
    }

    #[test]
    fn in_memory_truncate_prefix_hides_earlier_reads() {
        let log = InMemoryLogicalLog::new();
        log.append(b"aaaa").unwrap();
        log.append(b"bbbb").unwrap();
        log.truncate_prefix(4).unwrap();
        assert!(log.read_at(0, 4).is_err());
        assert_eq!(log.read_at(4, 4).unwrap(), b"bbbb");
    }

    #[test]
    fn truncate_suffix_discards_the_tail_and_allows_reappend() {
        let log = InMemoryLogicalLog::new();
        log.append(b"aaaa").unwrap();
        log.append(b"bbbb").unwrap();
        log.truncate_suffix(4).unwrap();
        assert_eq!(log.len().unwrap(), 4);
        assert!(log.read_at(4, 4).is_err());
        log.append(b"cccc").unwrap();
        assert_eq!(log.read_at(4, 4).unwrap(), b"cccc");
    }

    #[test]
    fn truncate_blocked_while_reader_lease_outstanding() {
        let log = InMemoryLogicalLog::new();
        log.append(b"aaaa").unwrap();
        let lease = log.lease_reader();
        assert!(log.truncate_prefix(4).is_err());
        drop(lease);
        assert!(log.truncate_prefix(4).is_ok());
    }

    #[test]
    fn file_logical_log_survives_append_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let log = FileLogicalLog::create(&path).unwrap();
        log.append(b"0123456789").unwrap();
        log.flush().unwrap();
        assert_eq!(log.read_at(0, 10).unwrap(), b"0123456789");

        log.truncate_prefix(4).unwrap();
        assert!(log.read_at(0, 4).is_err());
        assert_eq!(log.read_at(4, 6).unwrap(), b"456789");
        assert_eq!(log.len().unwrap(), 6);

        log.append(b"xyz").unwrap();
        assert_eq!(log.read_at(10, 3).unwrap(), b"xyz");
    }
}
