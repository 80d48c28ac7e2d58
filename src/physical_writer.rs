//! The physical log writer: turns framed records into durable bytes on a
//! [`LogicalLog`], with deferred group-commit fsync.
//!
//! Adapted from the teacher's `engines/granite/wal.rs`: a dedicated
//! `std::thread` worker drains a channel of write requests, batches them by
//! a timeout/size trigger, and defers the `fsync` until either trigger
//! fires or a caller asks for `ForceSync`. Callers block on a
//! `Mutex`+`Condvar` pair (`FsyncState`) rather than a future, matching the
//! teacher's synchronous-worker shape; `replicated_log_manager.rs` is the
//! only caller and calls it inline on the replicating thread.
//!
//! Generalizes `GraniteConfig`'s `batch_timeout_ms`/`max_batch_size` to
//! operate on `Psn` instead of an opaque byte count, and enforces the
//! physical chain invariant: the `Psn` of each record enqueued must be
//! exactly one greater than the previous, except while
//! `allow_psn_gaps` is set (used only by truncate-tail tests that replay a
//! log with a deliberately discarded tail).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{ReplicatorError, Result};
use crate::logical_log::LogicalLog;
use crate::record::{self, LogRecord, Psn, INVALID_PSN};

/// Deferred-fsync coordination, mirroring `engines/granite/wal.rs::FsyncState`.
struct FsyncState {
    durable_psn: AtomicU64,
    written_psn: AtomicU64,
    lock: Mutex<()>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_psn: AtomicU64::new(0),
            written_psn: AtomicU64::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn update_written(&self, psn: Psn) {
        self.written_psn.fetch_max(psn, Ordering::AcqRel);
    }

    fn signal_durable(&self, psn: Psn) {
        self.durable_psn.fetch_max(psn, Ordering::AcqRel);
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    fn wait_for_durable(&self, psn: Psn) -> Result<()> {
        if psn == INVALID_PSN {
            return Ok(());
        }
        let mut guard = self.lock.lock().unwrap();
        while self.durable_psn.load(Ordering::Acquire) < psn {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(ReplicatorError::ObjectClosed);
            }
            guard = self.condvar.wait(guard).unwrap();
        }
        Ok(())
    }
}

type Responder = mpsc::Sender<Result<Psn>>;

struct WriteRequest {
    record: LogRecord,
    responder: Responder,
}

enum WriterMessage {
    Write(WriteRequest),
    ForceSync(mpsc::Sender<Result<()>>),
    Shutdown,
}

/// Batches writes the way `GraniteConfig` parameterizes the granite worker.
#[derive(Debug, Clone)]
pub struct PhysicalWriterConfig {
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    pub max_unfsynced_bytes: u64,
}

impl Default for PhysicalWriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(5),
            max_batch_size: 256,
            max_unfsynced_bytes: 4 * 1024 * 1024,
        }
    }
}

impl PhysicalWriterConfig {
    /// Fsync after every single record. No batching window.
    pub fn synchronous() -> Self {
        Self {
            batch_timeout: Duration::from_millis(0),
            max_batch_size: 1,
            max_unfsynced_bytes: 0,
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            batch_timeout: Duration::from_millis(20),
            max_batch_size: 4096,
            max_unfsynced_bytes: 64 * 1024 * 1024,
        }
    }
}

pub struct PhysicalLogWriter {
    fsync: Arc<FsyncState>,
    sender: Sender<WriterMessage>,
    worker: Option<JoinHandle<()>>,
    expected_next_psn: AtomicU64,
    allow_psn_gaps: AtomicBool,
}

impl PhysicalLogWriter {
    pub fn new(
        log: Arc<dyn LogicalLog>,
        config: PhysicalWriterConfig,
        starting_psn: Psn,
    ) -> Self {
        let fsync = Arc::new(FsyncState::new());
        let (sender, receiver) = mpsc::channel();
        let worker_fsync = Arc::clone(&fsync);
        let worker = std::thread::Builder::new()
            .name("physical-log-writer".into())
            .spawn(move || writer_thread(log, config, receiver, worker_fsync))
            .expect("failed to spawn physical log writer thread");

        Self {
            fsync,
            sender,
            worker: Some(worker),
            expected_next_psn: AtomicU64::new(starting_psn),
            allow_psn_gaps: AtomicBool::new(false),
        }
    }

    /// Relax the strict `prev_psn + 1 == psn` check. Only the truncate-tail
    /// recovery path (which deliberately reopens a log whose tail has been
    /// discarded and resumes at a non-contiguous Psn) should call this.
    pub fn allow_psn_gap_once(&self, next_psn: Psn) {
        self.allow_psn_gaps.store(true, Ordering::Release);
        self.expected_next_psn.store(next_psn, Ordering::Release);
    }

    /// Enqueue `record` for writing and block until the batch containing it
    /// has been fsynced to the logical log. Returns the assigned Psn.
    pub fn enqueue(&self, record: LogRecord) -> Result<Psn> {
        let psn = record.psn();
        let expected = self.expected_next_psn.load(Ordering::Acquire);
        if self.allow_psn_gaps.swap(false, Ordering::AcqRel) {
            // one-shot relaxation consumed
        } else if psn != expected {
            return Err(ReplicatorError::Fatal(format!(
                "physical chain violated: expected psn {}, got {}",
                expected, psn
            )));
        }
        self.expected_next_psn.store(psn + 1, Ordering::Release);

        let (responder, result_rx) = mpsc::channel();
        self.sender
            .send(WriterMessage::Write(WriteRequest { record, responder }))
            .map_err(|_| ReplicatorError::ObjectClosed)?;
        result_rx.recv().map_err(|_| ReplicatorError::ObjectClosed)?
    }

    /// Block until `psn` has been fsynced to the logical log.
    pub fn wait_for_durable(&self, psn: Psn) -> Result<()> {
        self.fsync.wait_for_durable(psn)
    }

    /// Force an immediate fsync of everything written so far, regardless of
    /// the batch trigger.
    pub fn force_sync(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(WriterMessage::ForceSync(tx))
            .map_err(|_| ReplicatorError::ObjectClosed)?;
        rx.recv().map_err(|_| ReplicatorError::ObjectClosed)?
    }

    pub fn durable_psn(&self) -> Psn {
        self.fsync.durable_psn.load(Ordering::Acquire)
    }

    pub fn written_psn(&self) -> Psn {
        self.fsync.written_psn.load(Ordering::Acquire)
    }
}

impl Drop for PhysicalLogWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterMessage::Shutdown);
        self.fsync.signal_shutdown();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn writer_thread(
    log: Arc<dyn LogicalLog>,
    config: PhysicalWriterConfig,
    receiver: mpsc::Receiver<WriterMessage>,
    fsync: Arc<FsyncState>,
) {
    let mut pending: VecDeque<(Psn, Responder)> = VecDeque::new();
    let mut unfsynced_bytes: u64 = 0;

    loop {
        let message = if pending.is_empty() {
            match receiver.recv() {
                Ok(m) => Some(m),
                Err(_) => None,
            }
        } else {
            match receiver.recv_timeout(config.batch_timeout) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => None,
            }
        };

        match message {
            Some(WriterMessage::Write(request)) => {
                let framed = match record::write_record(&request.record, true) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = request.responder.send(Err(e));
                        continue;
                    }
                };
                let psn = request.record.psn();
                match log.append(&framed) {
                    Ok(_) => {
                        unfsynced_bytes += framed.len() as u64;
                        fsync.update_written(psn);
                        pending.push_back((psn, request.responder));
                    }
                    Err(e) => {
                        let _ = request.responder.send(Err(e));
                        continue;
                    }
                }
            }
            Some(WriterMessage::ForceSync(reply)) => {
                let result = flush_and_notify(&log, &fsync, &mut pending);
                unfsynced_bytes = 0;
                let _ = reply.send(result);
                continue;
            }
            Some(WriterMessage::Shutdown) | None => {
                if !pending.is_empty() || message.is_none() {
                    let _ = flush_and_notify(&log, &fsync, &mut pending);
                    unfsynced_bytes = 0;
                }
                if matches!(message, Some(WriterMessage::Shutdown)) {
                    break;
                }
                if message.is_none() && pending.is_empty() {
                    // batch_timeout fired with nothing pending only happens
                    // right after a flush; loop back to blocking recv.
                    continue;
                }
            }
        }

        let batch_full = pending.len() >= config.max_batch_size;
        let bytes_full = unfsynced_bytes >= config.max_unfsynced_bytes && config.max_unfsynced_bytes > 0;
        if batch_full || bytes_full || config.max_batch_size <= 1 {
            let _ = flush_and_notify(&log, &fsync, &mut pending);
            unfsynced_bytes = 0;
        }
    }

    while let Ok(message) = receiver.try_recv() {
        if let WriterMessage::Write(request) = message {
            let _ = request.responder.send(Err(ReplicatorError::ObjectClosed));
        }
    }
}

fn flush_and_notify(
    log: &Arc<dyn LogicalLog>,
    fsync: &Arc<FsyncState>,
    pending: &mut VecDeque<(Psn, Responder)>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let flush_result = log.flush();
    let max_psn = pending.iter().map(|(psn, _)| *psn).max().unwrap_or(0);

    for (psn, responder) in pending.drain(..) {
        let response = match &flush_result {
            Ok(()) => Ok(psn),
            Err(_) => Err(ReplicatorError::Fatal("fsync failed".into())),
        };
        let _ = responder.send(response);
    }

    if flush_result.is_ok() {
        fsync.signal_durable(max_psn);
    }
    flush_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical_log::InMemoryLogicalLog;
    use crate::record::{LogRecord, RecordHeader, RecordType};

    fn barrier_record(lsn: u64, psn: Psn) -> LogRecord {
        LogRecord::Barrier {
            header: RecordHeader {
                record_type: RecordType::Barrier,
                lsn,
                psn,
                position: 0,
                length: 0,
            },
        }
    }

    #[test]
    fn synchronous_writer_makes_each_record_durable_before_returning() {
        let log: Arc<dyn LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = PhysicalLogWriter::new(log, PhysicalWriterConfig::synchronous(), 0);

        let psn = writer.enqueue(barrier_record(1, 0)).unwrap();
        assert_eq!(psn, 0);
        writer.wait_for_durable(psn).unwrap();
        assert_eq!(writer.durable_psn(), 0);
    }

    #[test]
    fn out_of_order_psn_is_rejected() {
        let log: Arc<dyn LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = PhysicalLogWriter::new(log, PhysicalWriterConfig::synchronous(), 0);
        writer.enqueue(barrier_record(1, 0)).unwrap();
        let result = writer.enqueue(barrier_record(2, 5));
        assert!(result.is_err());
    }

    #[test]
    fn allow_psn_gap_once_permits_a_single_discontinuity() {
        let log: Arc<dyn LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = PhysicalLogWriter::new(log, PhysicalWriterConfig::synchronous(), 0);
        writer.enqueue(barrier_record(1, 0)).unwrap();
        writer.allow_psn_gap_once(10);
        writer.enqueue(barrier_record(2, 10)).unwrap();
        // the gap allowance is one-shot: the next record must again be
        // contiguous with the last accepted psn.
        assert!(writer.enqueue(barrier_record(3, 50)).is_err());
    }

    #[test]
    fn force_sync_flushes_batched_writes_under_high_throughput_config() {
        let log: Arc<dyn LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = PhysicalLogWriter::new(log, PhysicalWriterConfig::high_throughput(), 0);
        for psn in 0..5 {
            writer.enqueue(barrier_record(psn + 1, psn)).unwrap();
        }
        writer.force_sync().unwrap();
        assert_eq!(writer.durable_psn(), 4);
    }
}
