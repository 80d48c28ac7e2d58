//! The replicated log manager: owns tail/head/epoch state and is the single
//! writer of physical records (spec §4.4).
//!
//! Plays the same coordinating role `engines/granite/manager.rs`'s
//! `TransactionManager` plays for the teacher — it is the thing every
//! caller (dispatcher, checkpoint manager, recovery manager) goes through
//! rather than touching `PhysicalLogWriter` directly — generalized from a
//! single `AtomicU64` LSN counter to the full tail/head/progress-vector
//! state table spec.md requires, plus the out-of-order LSN assignment path
//! (`await_lsn_ordering`) the teacher's manager never needed because it
//! only ever had one writer thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{ReplicatorError, Result};
use crate::logical_log::LogicalLog;
use crate::operation_processor::OperationProcessor;
use crate::physical_writer::PhysicalLogWriter;
use crate::progress_vector::ProgressVector;
use crate::record::{
    self, CheckpointState, Epoch, LogRecord, Lsn, Psn, RecordHeader, RecordType, ReplicaId,
    TruncationState, INVALID_PSN,
};

/// The replication transport is out of scope for this engine (spec §1); the
/// manager calls it only through this seam.
pub trait ExternalReplicator: Send + Sync {
    /// Ship `framed_bytes` for `lsn` to secondaries and block until a write
    /// quorum acknowledges. Returns `NoWriteQuorum` if quorum cannot be
    /// reached.
    fn replicate(&self, lsn: Lsn, framed_bytes: &[u8]) -> Result<()>;
}

/// Single-replica replicator used by tests and by a replica with no active
/// secondaries: every replicate call trivially "reaches quorum".
pub struct NullReplicator;

impl ExternalReplicator for NullReplicator {
    fn replicate(&self, _lsn: Lsn, _framed_bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

type WaitCell = Arc<(Mutex<bool>, Condvar)>;

struct LsnOrderingState {
    inserted_tail_lsn: Lsn,
    heap: BinaryHeap<Reverse<Lsn>>,
    waiters: HashMap<Lsn, WaitCell>,
}

pub struct ReplicatedLogManager {
    writer: Arc<PhysicalLogWriter>,
    log: Arc<dyn LogicalLog>,
    replicator: Arc<dyn ExternalReplicator>,
    operation_processor: Arc<OperationProcessor>,

    tail_lsn: AtomicU64,
    next_psn: AtomicU64,
    tail_epoch: Mutex<Epoch>,
    log_head_psn: AtomicU64,
    last_completed_begin_checkpoint_psn: AtomicU64,
    last_inprogress_begin_checkpoint_psn: AtomicU64,
    last_completed_end_checkpoint_psn: AtomicU64,
    progress_vector: Mutex<ProgressVector>,
    last_information_psn: AtomicU64,
    last_indexing_psn: AtomicU64,

    bytes_since_index: AtomicU64,
    index_threshold_bytes: u64,

    ordering: Mutex<LsnOrderingState>,
}

impl ReplicatedLogManager {
    pub fn new(
        writer: Arc<PhysicalLogWriter>,
        log: Arc<dyn LogicalLog>,
        replicator: Arc<dyn ExternalReplicator>,
        operation_processor: Arc<OperationProcessor>,
        replica_id: ReplicaId,
        index_threshold_bytes: u64,
    ) -> Self {
        Self {
            writer,
            log,
            replicator,
            operation_processor,
            tail_lsn: AtomicU64::new(0),
            next_psn: AtomicU64::new(0),
            tail_epoch: Mutex::new(Epoch::ZERO),
            log_head_psn: AtomicU64::new(INVALID_PSN),
            last_completed_begin_checkpoint_psn: AtomicU64::new(INVALID_PSN),
            last_inprogress_begin_checkpoint_psn: AtomicU64::new(INVALID_PSN),
            last_completed_end_checkpoint_psn: AtomicU64::new(INVALID_PSN),
            progress_vector: Mutex::new(ProgressVector::new(replica_id, 0)),
            last_information_psn: AtomicU64::new(INVALID_PSN),
            last_indexing_psn: AtomicU64::new(INVALID_PSN),
            bytes_since_index: AtomicU64::new(0),
            index_threshold_bytes,
            ordering: Mutex::new(LsnOrderingState {
                inserted_tail_lsn: 0,
                heap: BinaryHeap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.tail_lsn.load(Ordering::Acquire)
    }

    pub fn log_head_psn(&self) -> Psn {
        self.log_head_psn.load(Ordering::Acquire)
    }

    pub fn tail_epoch(&self) -> Epoch {
        *self.tail_epoch.lock().unwrap()
    }

    pub fn progress_vector(&self) -> ProgressVector {
        self.progress_vector.lock().unwrap().clone()
    }

    /// Hydrate tail/head/epoch/progress-vector state from a completed
    /// `RecoveryManager::recover()` pass. Must be called before any
    /// `replicate_and_log`/`update_epoch` call on a reopened replica, since
    /// `new()` always starts a manager at LSN/PSN zero with an empty
    /// progress vector.
    pub fn restore_from_recovery(
        &self,
        tail_lsn: Lsn,
        next_psn: Psn,
        log_head_psn: Psn,
        tail_epoch: Epoch,
        progress_vector: ProgressVector,
    ) {
        self.tail_lsn.store(tail_lsn, Ordering::Release);
        self.next_psn.store(next_psn, Ordering::Release);
        self.log_head_psn.store(log_head_psn, Ordering::Release);
        *self.tail_epoch.lock().unwrap() = tail_epoch;
        *self.progress_vector.lock().unwrap() = progress_vector;
        self.ordering.lock().unwrap().inserted_tail_lsn = tail_lsn;
    }

    /// Reserve the next sequential LSN and PSN and assign them to `record`'s
    /// header in place.
    fn assign_sequence_numbers(&self, record: &mut LogRecord) -> (Lsn, Psn) {
        let lsn = self.tail_lsn.fetch_add(1, Ordering::AcqRel) + 1;
        let psn = self.next_psn.fetch_add(1, Ordering::AcqRel);
        let header = record.header_mut();
        header.lsn = lsn;
        header.psn = psn;
        (lsn, psn)
    }

    /// `ReplicateAndLog(logical_record)`: assign LSN/PSN, replicate to
    /// secondaries, append to the physical writer, and wait for the write
    /// to be durable. Returns `(lsn, psn, buffered_bytes)`.
    pub fn replicate_and_log(&self, mut record: LogRecord) -> Result<(Lsn, Psn, usize)> {
        let (lsn, psn) = self.assign_sequence_numbers(&mut record);

        let logical_bytes = record::write_record(&record, false)?;
        self.replicator.replicate(lsn, &logical_bytes)?;

        let record_type = record.record_type();
        self.operation_processor.begin_physical_record();
        let enqueued = self.writer.enqueue(record.clone());
        self.operation_processor.end_physical_record();
        enqueued?;

        let physical_bytes = record::write_record(&record, true)?;
        self.bytes_since_index
            .fetch_add(physical_bytes.len() as u64, Ordering::AcqRel);

        match record_type {
            RecordType::Indexing => self.last_indexing_psn.store(psn, Ordering::Release),
            RecordType::BeginCheckpoint => {
                self.last_inprogress_begin_checkpoint_psn.store(psn, Ordering::Release)
            }
            RecordType::EndCheckpoint => {
                self.last_completed_begin_checkpoint_psn.store(
                    self.last_inprogress_begin_checkpoint_psn.load(Ordering::Acquire),
                    Ordering::Release,
                );
            }
            RecordType::CompleteCheckpoint => {
                self.last_completed_end_checkpoint_psn.store(psn, Ordering::Release)
            }
            RecordType::TruncateHead => {
                if let LogRecord::TruncateHead {
                    head_record_psn,
                    truncation_state: TruncationState::Applied,
                    ..
                } = &record
                {
                    self.log_head_psn.store(*head_record_psn, Ordering::Release);
                }
            }
            RecordType::Information => self.last_information_psn.store(psn, Ordering::Release),
            _ => {}
        }

        Ok((lsn, psn, physical_bytes.len()))
    }

    /// Append an `IndexingLogRecord` if `bytes_since_index` has crossed the
    /// configured threshold.
    pub fn index_if_due(&self) -> Result<Option<(Lsn, Psn)>> {
        if self.bytes_since_index.load(Ordering::Acquire) < self.index_threshold_bytes {
            return Ok(None);
        }
        let record = LogRecord::Indexing {
            header: RecordHeader::invalid(RecordType::Indexing),
            epoch: self.tail_epoch(),
            previous_indexing_psn: self.last_indexing_psn.load(Ordering::Acquire),
        };
        let (lsn, psn, _) = self.replicate_and_log(record)?;
        self.bytes_since_index.store(0, Ordering::Release);
        Ok(Some((lsn, psn)))
    }

    pub fn update_epoch(&self, epoch: Epoch, replica_id: ReplicaId, timestamp_millis: u64) -> Result<(Lsn, Psn)> {
        let record = LogRecord::UpdateEpoch {
            header: RecordHeader::invalid(RecordType::UpdateEpoch),
            epoch,
            replica_id,
        };
        let (lsn, psn, _) = self.replicate_and_log(record)?;
        {
            let mut pv = self.progress_vector.lock().unwrap();
            pv.append(crate::record::ProgressVectorEntry {
                epoch,
                starting_lsn: lsn,
                replica_id,
                timestamp_millis,
            })?;
        }
        *self.tail_epoch.lock().unwrap() = epoch;
        Ok((lsn, psn))
    }

    /// `AwaitLsnOrderingTaskOnPrimaryAsync`: reserve `lsn` for out-of-order
    /// insertion, then block until every lower LSN has also been inserted.
    ///
    /// The drain loop re-checks the heap after each pop rather than before
    /// (the bug the spec calls out): `drain_locked` loops on a fresh `peek`
    /// every iteration, so a late caller that lands between an earlier
    /// caller's push and the drainer's lock acquisition is still picked up
    /// in the same pass instead of being orphaned until the next insert.
    pub fn await_lsn_ordering(&self, lsn: Lsn) {
        let wait_cell: WaitCell = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let mut state = self.ordering.lock().unwrap();
            state.heap.push(Reverse(lsn));
            state.waiters.insert(lsn, Arc::clone(&wait_cell));
            drain_locked(&mut state);
        }
        let (lock, cvar) = &*wait_cell;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    pub fn inserted_tail_lsn(&self) -> Lsn {
        self.ordering.lock().unwrap().inserted_tail_lsn
    }

    /// `TruncateHead(target_indexing_record)`: log the truncation record,
    /// wait for readers whose leased range overlaps the trimmed prefix to
    /// release, then trim the logical log. Logs a second `TruncateHead`
    /// record with `truncation_state: Applied` once the trim succeeds — the
    /// first record alone (`Ready`) cannot tell a replica replaying the log
    /// after a crash whether the trim actually happened.
    ///
    /// Blocking retry rather than an async wait queue, matching the rest of
    /// this module's synchronous style.
    pub fn truncate_head(&self, new_head_psn: Psn, new_head_lsn: Lsn) -> Result<()> {
        let current_head = self.log_head_psn.load(Ordering::Acquire);
        if current_head != INVALID_PSN && new_head_psn <= current_head {
            return Err(ReplicatorError::InvalidOperation(format!(
                "truncate_head target psn {} does not advance current head {}",
                new_head_psn, current_head
            )));
        }

        let record = LogRecord::TruncateHead {
            header: RecordHeader::invalid(RecordType::TruncateHead),
            head_record_psn: new_head_psn,
            new_head_lsn,
            truncation_state: TruncationState::Ready,
        };
        self.replicate_and_log(record)?;

        let mut attempts = 0;
        loop {
            match self.log.truncate_prefix(new_head_lsn) {
                Ok(()) => break,
                Err(ReplicatorError::InsufficientResources(_)) if attempts < 1000 => {
                    attempts += 1;
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }

        self.replicate_and_log(LogRecord::TruncateHead {
            header: RecordHeader::invalid(RecordType::TruncateHead),
            head_record_psn: new_head_psn,
            new_head_lsn,
            truncation_state: TruncationState::Applied,
        })?;
        Ok(())
    }

    /// Log a `TruncateHead` record marking a pending truncation as
    /// abandoned; the logical log is left untouched. Used by
    /// `checkpoint_manager.rs::abort_pending_log_head_truncation`.
    pub fn log_truncate_head_aborted(&self, head_psn: Psn, head_lsn: Lsn) -> Result<()> {
        self.replicate_and_log(LogRecord::TruncateHead {
            header: RecordHeader::invalid(RecordType::TruncateHead),
            head_record_psn: head_psn,
            new_head_lsn: head_lsn,
            truncation_state: TruncationState::Aborted,
        })?;
        Ok(())
    }
}

fn drain_locked(state: &mut LsnOrderingState) {
    loop {
        match state.heap.peek() {
            Some(Reverse(lsn)) if *lsn == state.inserted_tail_lsn + 1 => {
                let Reverse(ready_lsn) = state.heap.pop().unwrap();
                state.inserted_tail_lsn = ready_lsn;
                if let Some(cell) = state.waiters.remove(&ready_lsn) {
                    let (lock, cvar) = &*cell;
                    *lock.lock().unwrap() = true;
                    cvar.notify_all();
                }
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_utility::FaultUtility;
    use crate::logical_log::InMemoryLogicalLog;
    use crate::operation_processor::{ApplyContext, StateProvider};
    use crate::physical_writer::{PhysicalLogWriter, PhysicalWriterConfig};
    use std::sync::Barrier;

    struct NoopStateProvider;
    impl StateProvider for NoopStateProvider {
        fn apply(&self, _: crate::record::TxnId, _: Lsn, _: &[u8], _: Option<&[u8]>, _: ApplyContext) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _: crate::record::TxnId, _: &[u8], _: Option<&[u8]>) -> Result<()> {
            Ok(())
        }
        fn checkpoint(&self) -> Result<()> {
            Ok(())
        }
        fn complete_checkpoint(&self) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> ReplicatedLogManager {
        let log: Arc<dyn LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = Arc::new(PhysicalLogWriter::new(
            Arc::clone(&log),
            PhysicalWriterConfig::synchronous(),
            0,
        ));
        let operation_processor = Arc::new(OperationProcessor::new(
            Arc::new(NoopStateProvider),
            Arc::new(FaultUtility::new()),
            0,
        ));
        ReplicatedLogManager::new(writer, log, Arc::new(NullReplicator), operation_processor, 1, 1024 * 1024)
    }

    #[test]
    fn replicate_and_log_assigns_sequential_lsn_and_psn() {
        let mgr = manager();
        let (lsn1, psn1, _) = mgr
            .replicate_and_log(LogRecord::Barrier {
                header: RecordHeader::invalid(RecordType::Barrier),
            })
            .unwrap();
        let (lsn2, psn2, _) = mgr
            .replicate_and_log(LogRecord::Barrier {
                header: RecordHeader::invalid(RecordType::Barrier),
            })
            .unwrap();
        assert_eq!((lsn1, psn1), (1, 0));
        assert_eq!((lsn2, psn2), (2, 1));
        assert_eq!(mgr.tail_lsn(), 2);
    }

    #[test]
    fn update_epoch_advances_progress_vector_and_tail_epoch() {
        let mgr = manager();
        let epoch = Epoch {
            data_loss_version: 0,
            configuration_version: 1,
        };
        mgr.update_epoch(epoch, 7, 0).unwrap();
        assert_eq!(mgr.tail_epoch(), epoch);
        assert_eq!(mgr.progress_vector().last().replica_id, 7);
    }

    #[test]
    fn lsn_ordering_drain_signals_multiple_awaiters_in_one_pass() {
        let mgr = Arc::new(manager());
        {
            let mut state = mgr.ordering.lock().unwrap();
            state.inserted_tail_lsn = 4;
        }

        let barrier = Arc::new(Barrier::new(3));
        let order = Arc::new(Mutex::new(Vec::new()));

        let spawn = |lsn: Lsn| {
            let mgr = Arc::clone(&mgr);
            let barrier = Arc::clone(&barrier);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                barrier.wait();
                mgr.await_lsn_ordering(lsn);
                order.lock().unwrap().push(lsn);
            })
        };

        let t6 = spawn(6);
        let t7 = spawn(7);
        // Give threads 6 and 7 a chance to register before 5 arrives, so the
        // drain triggered by 5 has to clear all three waiters in one pass.
        barrier.wait();
        std::thread::sleep(std::time::Duration::from_millis(20));
        mgr.await_lsn_ordering(5);

        t6.join().unwrap();
        t7.join().unwrap();
        assert_eq!(mgr.inserted_tail_lsn(), 7);

        let completed = order.lock().unwrap();
        assert_eq!(completed.len(), 2);
    }

    #[test]
    fn truncate_head_rejects_non_advancing_target() {
        let mgr = manager();
        mgr.log_head_psn.store(5, Ordering::Release);
        assert!(mgr.truncate_head(5, 0).is_err());
        assert!(mgr.truncate_head(3, 0).is_err());
    }

    #[test]
    fn truncate_head_sets_log_head_psn_only_after_applied_record() {
        let mgr = manager();
        mgr.replicate_and_log(LogRecord::Barrier {
            header: RecordHeader::invalid(RecordType::Barrier),
        })
        .unwrap();
        mgr.truncate_head(1, 1).unwrap();
        assert_eq!(mgr.log_head_psn(), 1);
    }

    #[test]
    fn log_truncate_head_aborted_does_not_move_log_head_psn() {
        let mgr = manager();
        mgr.log_truncate_head_aborted(9, 9).unwrap();
        assert_eq!(mgr.log_head_psn(), INVALID_PSN);
    }

    #[test]
    fn restore_from_recovery_hydrates_tail_and_progress_vector() {
        let mgr = manager();
        let mut pv = ProgressVector::new(3, 0);
        pv.append(crate::record::ProgressVectorEntry {
            epoch: Epoch {
                data_loss_version: 1,
                configuration_version: 2,
            },
            starting_lsn: 10,
            replica_id: 3,
            timestamp_millis: 500,
        })
        .unwrap();
        let restored_epoch = pv.last().epoch;

        mgr.restore_from_recovery(10, 6, 2, restored_epoch, pv.clone());

        assert_eq!(mgr.tail_lsn(), 10);
        assert_eq!(mgr.log_head_psn(), 2);
        assert_eq!(mgr.tail_epoch(), restored_epoch);
        assert_eq!(mgr.progress_vector().last().starting_lsn, 10);
        assert_eq!(mgr.inserted_tail_lsn(), 10);

        // A fresh write after restore continues from the hydrated tail/psn.
        let (lsn, psn, _) = mgr
            .replicate_and_log(LogRecord::Barrier {
                header: RecordHeader::invalid(RecordType::Barrier),
            })
            .unwrap();
        assert_eq!((lsn, psn), (11, 6));
    }
}
