//! Checkpoint manager: prepare/perform/complete checkpoint protocol, head
//! truncation policy, and the periodic-checkpoint timer state machine
//! (spec §4.8).
//!
//! Generalizes the teacher's `engines/granite/manager.rs::checkpoint()` /
//! `truncate_wal()` — a single synchronous "flush, write checkpoint record,
//! maybe truncate" function — into the full multi-phase protocol spec.md
//! requires, including the dual failure-recovery policy for
//! `CompleteCheckpoint` (§4.8/§7: if the `CompleteCheckpoint` state-provider
//! call or its log record fails, the engine still treats `BeginCheckpoint`
//! as completed — it's durable — and repairs by re-logging
//! `CompleteCheckpoint` on reopen, see `recovery_manager.rs`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::operation_processor::OperationProcessor;
use crate::record::{CheckpointState, LogRecord, Lsn, Psn, RecordHeader, RecordType, INVALID_PSN};
use crate::replicated_log_manager::ReplicatedLogManager;
use crate::transaction_map::TransactionMap;

/// Periodic-checkpoint/truncation state (spec §3.5), persisted via the
/// last `BeginCheckpoint` record so it survives restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicCheckpointState {
    NotStarted,
    Ready,
    CheckpointStarted,
    CheckpointCompleted,
    TruncationStarted,
}

struct CheckpointManagerState {
    checkpoint_state: CheckpointState,
    periodic_state: PeriodicCheckpointState,
    last_periodic_checkpoint_time_millis: u64,
    last_periodic_truncation_time_millis: u64,
    in_flight: bool,
    bytes_since_checkpoint: u64,
    /// Head/Lsn of a truncation that has entered `TruncationStarted` but not
    /// yet resolved, so `abort_pending_log_head_truncation` knows which
    /// target to log a `TruncateHead(Aborted)` record against.
    pending_truncation: Option<(Psn, Lsn)>,
}

pub struct CheckpointManager {
    log_manager: Arc<ReplicatedLogManager>,
    operation_processor: Arc<OperationProcessor>,
    transaction_map: Arc<Mutex<TransactionMap>>,
    config: ReplicatorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CheckpointManagerState>,
    last_stable_lsn_at_last_checkpoint: AtomicU64,
}

impl CheckpointManager {
    pub fn new(
        log_manager: Arc<ReplicatedLogManager>,
        operation_processor: Arc<OperationProcessor>,
        transaction_map: Arc<Mutex<TransactionMap>>,
        config: ReplicatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            log_manager,
            operation_processor,
            transaction_map,
            config,
            clock,
            state: Mutex::new(CheckpointManagerState {
                checkpoint_state: CheckpointState::Completed,
                periodic_state: PeriodicCheckpointState::NotStarted,
                last_periodic_checkpoint_time_millis: now,
                last_periodic_truncation_time_millis: now,
                in_flight: false,
                bytes_since_checkpoint: 0,
                pending_truncation: None,
            }),
            last_stable_lsn_at_last_checkpoint: AtomicU64::new(0),
        }
    }

    /// Restore periodic-checkpoint timestamps and checkpoint state observed
    /// from the last `BeginCheckpoint` record during recovery (spec §4.9:
    /// "recovery preserves periodic-checkpoint timestamps").
    pub fn restore_from_recovery(
        &self,
        checkpoint_state: CheckpointState,
        periodic_checkpoint_time_millis: u64,
        periodic_truncation_time_millis: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        state.checkpoint_state = checkpoint_state;
        state.last_periodic_checkpoint_time_millis = periodic_checkpoint_time_millis;
        state.last_periodic_truncation_time_millis = periodic_truncation_time_millis;
    }

    pub fn record_bytes_inserted(&self, n: u64) {
        self.state.lock().unwrap().bytes_since_checkpoint += n;
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.state.lock().unwrap().checkpoint_state
    }

    /// Consulted after every logical insertion, and by the periodic timer.
    pub fn checkpoint_if_necessary(&self) -> Result<bool> {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_flight {
                return Ok(false);
            }
            if state.bytes_since_checkpoint < self.config.checkpoint_threshold_bytes {
                return Ok(false);
            }
            state.in_flight = true;
            state.periodic_state = PeriodicCheckpointState::CheckpointStarted;
        }

        let result = self.run_checkpoint();

        let mut state = self.state.lock().unwrap();
        state.in_flight = false;
        state.bytes_since_checkpoint = 0;
        state.last_periodic_checkpoint_time_millis = self.clock.now_millis();
        state.periodic_state = PeriodicCheckpointState::CheckpointCompleted;
        result.map(|()| true)
    }

    /// Run a checkpoint unconditionally, ignoring the byte threshold.
    /// `backup/manager.rs` calls this so a backup always starts from a
    /// checkpoint no older than the backup itself.
    pub fn force_checkpoint(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_flight {
                return Err(ReplicatorError::InvalidOperation(
                    "a checkpoint is already in flight".into(),
                ));
            }
            state.in_flight = true;
            state.periodic_state = PeriodicCheckpointState::CheckpointStarted;
        }

        let result = self.run_checkpoint();

        let mut state = self.state.lock().unwrap();
        state.in_flight = false;
        state.bytes_since_checkpoint = 0;
        state.last_periodic_checkpoint_time_millis = self.clock.now_millis();
        state.periodic_state = PeriodicCheckpointState::CheckpointCompleted;
        result
    }

    /// Cancel a prepared-but-not-completed checkpoint: the `BeginCheckpoint`
    /// record already on disk has its state flipped to `Aborted`.
    pub fn abort_pending_checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.checkpoint_state == CheckpointState::Prepared {
            state.checkpoint_state = CheckpointState::Aborted;
            state.in_flight = false;
            Ok(())
        } else {
            Err(ReplicatorError::InvalidOperation(
                "no prepared checkpoint to abort".into(),
            ))
        }
    }

    /// Cancel a pending truncate-head: logs a terminal `TruncateHead(Aborted)`
    /// record against the stashed candidate head, and the logical-log trim
    /// is never performed.
    pub fn abort_pending_log_head_truncation(&self) -> Result<()> {
        let (head_psn, head_lsn) = {
            let mut state = self.state.lock().unwrap();
            if state.periodic_state != PeriodicCheckpointState::TruncationStarted {
                return Err(ReplicatorError::InvalidOperation(
                    "no pending log head truncation to abort".into(),
                ));
            }
            let target = state.pending_truncation.take().ok_or_else(|| {
                ReplicatorError::InvalidOperation("no pending log head truncation to abort".into())
            })?;
            state.periodic_state = PeriodicCheckpointState::CheckpointCompleted;
            target
        };
        self.log_manager.log_truncate_head_aborted(head_psn, head_lsn)
    }

    fn run_checkpoint(&self) -> Result<()> {
        let progress_vector = self.log_manager.progress_vector();
        let (earliest_pending_psn, last_stable_lsn) = {
            let map = self.transaction_map.lock().unwrap();
            (
                map.earliest_pending_psn().unwrap_or(INVALID_PSN),
                map.last_stable_lsn(),
            )
        };

        let (periodic_checkpoint_time, periodic_truncation_time) = {
            let state = self.state.lock().unwrap();
            (
                state.last_periodic_checkpoint_time_millis,
                state.last_periodic_truncation_time_millis,
            )
        };

        let begin_record = LogRecord::BeginCheckpoint {
            header: RecordHeader::invalid(RecordType::BeginCheckpoint),
            earliest_pending_transaction_psn: earliest_pending_psn,
            checkpoint_state: CheckpointState::Ready,
            last_stable_lsn,
            progress_vector: progress_vector.entries().to_vec(),
            periodic_checkpoint_time_millis: periodic_checkpoint_time,
            periodic_truncation_time_millis: periodic_truncation_time,
        };
        self.log_manager.replicate_and_log(begin_record)?;
        self.state.lock().unwrap().checkpoint_state = CheckpointState::Prepared;

        if let Err(e) = self.operation_processor.checkpoint() {
            self.state.lock().unwrap().checkpoint_state = CheckpointState::Faulted;
            return Err(e);
        }

        let end_record = LogRecord::EndCheckpoint {
            header: RecordHeader::invalid(RecordType::EndCheckpoint),
            begin_checkpoint_psn: self.log_manager.tail_lsn(),
            log_head_lsn: last_stable_lsn,
        };
        self.log_manager.replicate_and_log(end_record)?;
        self.state.lock().unwrap().checkpoint_state = CheckpointState::Completed;
        self.last_stable_lsn_at_last_checkpoint
            .store(last_stable_lsn, Ordering::Release);

        // Dual failure-recovery policy: if either the CompleteCheckpoint
        // state-provider call or logging it fails, BeginCheckpoint is still
        // considered completed (it is durable); recovery repairs the gap
        // by re-logging CompleteCheckpoint on reopen.
        if let Err(e) = self.operation_processor.complete_checkpoint() {
            log::warn!("CompleteCheckpoint state-provider call failed, will repair on reopen: {}", e);
            return Ok(());
        }
        let complete_record = LogRecord::CompleteCheckpoint {
            header: RecordHeader::invalid(RecordType::CompleteCheckpoint),
            log_head_psn: self.log_manager.log_head_psn(),
        };
        if let Err(e) = self.log_manager.replicate_and_log(complete_record) {
            log::warn!("logging CompleteCheckpoint failed, will repair on reopen: {}", e);
        }
        Ok(())
    }

    /// Truncate-head policy: a candidate head is eligible once the log has
    /// grown past `truncation_threshold_factor * min_log_size_bytes`, and
    /// a truncation actually proceeds once it reclaims at least
    /// `min_truncation_bytes` — unless the periodic-truncation interval has
    /// elapsed, which bypasses the byte threshold.
    pub fn truncate_head_if_eligible(
        &self,
        candidate_head_psn: Psn,
        candidate_head_lsn: Lsn,
        current_log_size_bytes: u64,
        reclaimed_bytes: u64,
    ) -> Result<bool> {
        let eligible =
            current_log_size_bytes as f64 >= self.config.truncation_threshold_factor * self.config.min_log_size_bytes as f64;
        if !eligible {
            return Ok(false);
        }

        let periodic_elapsed = match self.config.log_truncation_interval {
            Some(interval) => {
                let state = self.state.lock().unwrap();
                self.clock.now_millis().saturating_sub(state.last_periodic_truncation_time_millis)
                    >= interval.as_millis() as u64
            }
            None => false,
        };

        if reclaimed_bytes < self.config.min_truncation_bytes && !periodic_elapsed {
            return Ok(false);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.periodic_state = PeriodicCheckpointState::TruncationStarted;
            state.pending_truncation = Some((candidate_head_psn, candidate_head_lsn));
        }
        self.log_manager.truncate_head(candidate_head_psn, candidate_head_lsn)?;
        let mut state = self.state.lock().unwrap();
        state.last_periodic_truncation_time_millis = self.clock.now_millis();
        state.periodic_state = PeriodicCheckpointState::CheckpointCompleted;
        state.pending_truncation = None;
        Ok(true)
    }

    /// Duration until the periodic timer should next fire (spec §4.8
    /// pseudocode), computed purely from injected time.
    pub fn periodic_timer_duration(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let now = self.clock.now_millis();
        let interval = match self.config.log_truncation_interval {
            Some(interval) => interval,
            None => return Duration::from_secs(u64::MAX / 2000),
        };
        let elapsed = now.saturating_sub(state.last_periodic_checkpoint_time_millis);
        if state.periodic_state == PeriodicCheckpointState::NotStarted {
            if elapsed >= interval.as_millis() as u64 {
                Duration::from_millis(0)
            } else {
                interval - Duration::from_millis(elapsed)
            }
        } else {
            interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fault_utility::FaultUtility;
    use crate::logical_log::InMemoryLogicalLog;
    use crate::operation_processor::{ApplyContext, StateProvider};
    use crate::physical_writer::{PhysicalLogWriter, PhysicalWriterConfig};
    use crate::record::TxnId;
    use crate::replicated_log_manager::NullReplicator;

    struct NoopStateProvider;
    impl StateProvider for NoopStateProvider {
        fn apply(&self, _: TxnId, _: crate::record::Lsn, _: &[u8], _: Option<&[u8]>, _: ApplyContext) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _: TxnId, _: &[u8], _: Option<&[u8]>) -> Result<()> {
            Ok(())
        }
        fn checkpoint(&self) -> Result<()> {
            Ok(())
        }
        fn complete_checkpoint(&self) -> Result<()> {
            Ok(())
        }
    }

    fn build() -> (Arc<CheckpointManager>, Arc<ManualClock>) {
        let log: Arc<dyn crate::logical_log::LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = Arc::new(PhysicalLogWriter::new(
            Arc::clone(&log),
            PhysicalWriterConfig::synchronous(),
            0,
        ));
        let processor = Arc::new(OperationProcessor::new(
            Arc::new(NoopStateProvider),
            Arc::new(FaultUtility::new()),
            0,
        ));
        let log_manager = Arc::new(ReplicatedLogManager::new(
            writer,
            log,
            Arc::new(NullReplicator),
            processor.clone(),
            1,
            1024 * 1024,
        ));
        let txn_map = Arc::new(Mutex::new(TransactionMap::new()));
        let clock = Arc::new(ManualClock::new(1_000));
        let config = ReplicatorConfig::aggressive_truncation();
        let manager = Arc::new(CheckpointManager::new(
            log_manager,
            processor,
            txn_map,
            config,
            clock.clone() as Arc<dyn Clock>,
        ));
        (manager, clock)
    }

    #[test]
    fn checkpoint_runs_once_threshold_crossed() {
        let (manager, _clock) = build();
        manager.record_bytes_inserted(4 * 1024);
        let ran = manager.checkpoint_if_necessary().unwrap();
        assert!(ran);
        assert_eq!(manager.checkpoint_state(), CheckpointState::Completed);
    }

    #[test]
    fn checkpoint_skipped_below_threshold() {
        let (manager, _clock) = build();
        manager.record_bytes_inserted(10);
        let ran = manager.checkpoint_if_necessary().unwrap();
        assert!(!ran);
    }

    #[test]
    fn periodic_checkpoint_time_survives_incomplete_checkpoint() {
        // Open Question #1 (DESIGN.md): the periodic-checkpoint timestamp is
        // recovered from the last BeginCheckpoint regardless of whether its
        // EndCheckpoint made it to disk. Pin that by simulating a restored
        // timestamp from an "attempted" checkpoint and checking the timer
        // schedules off of it, not off of a completed one.
        let (manager, clock) = build();
        manager.restore_from_recovery(CheckpointState::Prepared, 1_000, 1_000);
        clock.set(1_000 + 4_000);
        let duration = manager.periodic_timer_duration();
        assert_eq!(duration, Duration::from_secs(1));
    }

    #[test]
    fn abort_pending_checkpoint_requires_prepared_state() {
        let (manager, _clock) = build();
        assert!(manager.abort_pending_checkpoint().is_err());
    }

    #[test]
    fn abort_pending_log_head_truncation_requires_pending_target() {
        let (manager, _clock) = build();
        assert!(manager.abort_pending_log_head_truncation().is_err());
    }

    #[test]
    fn abort_pending_log_head_truncation_logs_aborted_record_and_resets_state() {
        let (manager, _clock) = build();
        {
            let mut state = manager.state.lock().unwrap();
            state.periodic_state = PeriodicCheckpointState::TruncationStarted;
            state.pending_truncation = Some((1, 1));
        }
        manager.abort_pending_log_head_truncation().unwrap();
        let state = manager.state.lock().unwrap();
        assert_eq!(state.periodic_state, PeriodicCheckpointState::CheckpointCompleted);
        assert!(state.pending_truncation.is_none());
    }
}
