//! Replicated transactional logging engine: top-level `Replicator` facade
//! wiring every module into an openable, transaction-bearing log.
//!
//! Mirrors the teacher's `Server`/`Config` shape — a single entry point
//! that constructs every sub-component and delegates to them rather than
//! embedding their logic — generalized from "bind a socket, accept
//! connections" to "open a log directory, replay recovery, accept
//! transactions".

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

pub mod backup;
pub mod checkpoint_manager;
pub mod clock;
pub mod config;
pub mod copy;
pub mod dispatcher;
pub mod error;
pub mod fault_utility;
pub mod host_activation;
pub mod logical_log;
pub mod operation_processor;
pub mod physical_writer;
pub mod progress_vector;
pub mod record;
pub mod recovery_manager;
pub mod replicated_log_manager;
pub mod transaction;
pub mod transaction_map;
pub mod version_manager;

use backup::manager::BackupManager;
use backup::metadata_file::{self, BackupMetadata, BackupOption};
use checkpoint_manager::CheckpointManager;
use clock::{Clock, SystemClock};
use config::{DispatchMode, ReplicatorConfig};
use dispatcher::{DispatchContext, ParallelDispatcher, RecordDispatcher, SerialDispatcher};
use error::{ReplicatorError, Result};
use fault_utility::FaultUtility;
use host_activation::HostActivationTable;
use logical_log::{FileLogicalLog, LogicalLog};
use operation_processor::{ApplyContext, OperationProcessor, StateProvider};
use physical_writer::{PhysicalLogWriter, PhysicalWriterConfig};
use record::{Epoch, LogRecord, Lsn, RecordHeader, RecordType, ReplicaId, TxnId, INVALID_PSN};
use recovery_manager::RecoveryManager;
use replicated_log_manager::{ExternalReplicator, NullReplicator, ReplicatedLogManager};
use transaction::TransactionState;
use transaction_map::TransactionMap;
use version_manager::VersionManager;

const LOG_FILE_NAME: &str = "replicator.log";

/// Everything the caller must supply that is out of scope for this engine:
/// where state lives (spec §1's external state-provider layer) and how
/// records reach secondaries (spec §1's external replication transport).
pub struct Replicator {
    replica_id: ReplicaId,
    log_manager: Arc<ReplicatedLogManager>,
    writer: Arc<PhysicalLogWriter>,
    transaction_map: Arc<Mutex<TransactionMap>>,
    operation_processor: Arc<OperationProcessor>,
    checkpoint_manager: Arc<CheckpointManager>,
    backup_manager: Arc<BackupManager>,
    version_manager: Arc<VersionManager>,
    host_activation: Arc<HostActivationTable>,
    dispatcher: Box<dyn RecordDispatcher>,
    next_txn_id: AtomicU64,
}

impl Replicator {
    /// Open (or create) the log at `data_dir`, recover from whatever is
    /// already there, and return a ready-to-use facade. Pass
    /// `Arc::new(NullReplicator)` for `external_replicator` in a
    /// single-replica setup or test.
    pub fn open(
        data_dir: impl AsRef<Path>,
        replica_id: ReplicaId,
        partition_id: u128,
        config: ReplicatorConfig,
        state_provider: Arc<dyn StateProvider>,
        external_replicator: Arc<dyn ExternalReplicator>,
    ) -> Result<Self> {
        Self::open_with_clock(
            data_dir,
            replica_id,
            partition_id,
            config,
            state_provider,
            external_replicator,
            Arc::new(SystemClock),
        )
    }

    pub fn open_with_clock(
        data_dir: impl AsRef<Path>,
        replica_id: ReplicaId,
        partition_id: u128,
        config: ReplicatorConfig,
        state_provider: Arc<dyn StateProvider>,
        external_replicator: Arc<dyn ExternalReplicator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join(LOG_FILE_NAME);

        // The byte-offset head a reopened `FileLogicalLog` needs is not yet
        // persisted anywhere a restart can read back (see DESIGN.md); 0 is
        // correct as long as the log has never had its prefix truncated.
        let log: Arc<dyn LogicalLog> = if log_path.exists() {
            Arc::new(FileLogicalLog::open_existing(&log_path, 0)?)
        } else {
            Arc::new(FileLogicalLog::create(&log_path)?)
        };

        let fault_utility = Arc::new(FaultUtility::new());
        let transaction_map = Arc::new(Mutex::new(TransactionMap::new()));
        let operation_processor = Arc::new(OperationProcessor::new(state_provider, fault_utility, 0));

        let dispatcher: Box<dyn RecordDispatcher> = match config.dispatch_mode {
            DispatchMode::Serial => Box::new(SerialDispatcher::new()),
            DispatchMode::Parallel => Box::new(ParallelDispatcher::new()),
        };

        let outcome = RecoveryManager::recover(
            log.as_ref(),
            &transaction_map,
            &operation_processor,
            dispatcher.as_ref(),
            replica_id,
        )?;

        let writer = Arc::new(PhysicalLogWriter::new(
            log.clone(),
            PhysicalWriterConfig::default(),
            outcome.next_psn,
        ));

        let index_threshold_bytes = (config.checkpoint_threshold_bytes / 4).max(4096);
        let log_manager = Arc::new(ReplicatedLogManager::new(
            writer.clone(),
            log.clone(),
            external_replicator,
            operation_processor.clone(),
            replica_id,
            index_threshold_bytes,
        ));
        let tail_epoch = outcome.progress_vector.last().epoch;
        log_manager.restore_from_recovery(
            outcome.tail_lsn,
            outcome.next_psn,
            outcome.log_head_psn,
            tail_epoch,
            outcome.progress_vector,
        );

        {
            let mut map = transaction_map.lock().unwrap();
            map.set_tail_lsn(outcome.tail_lsn);
            map.advance_stable_lsn(outcome.last_stable_lsn);
        }

        let checkpoint_manager = Arc::new(CheckpointManager::new(
            log_manager.clone(),
            operation_processor.clone(),
            transaction_map.clone(),
            config,
            clock,
        ));
        checkpoint_manager.restore_from_recovery(
            outcome.checkpoint_state,
            outcome.periodic_checkpoint_time_millis,
            outcome.periodic_truncation_time_millis,
        );
        if outcome.needs_complete_checkpoint_repair {
            checkpoint_manager.force_checkpoint()?;
        }

        let backup_manager = Arc::new(BackupManager::new(
            checkpoint_manager.clone(),
            log_manager.clone(),
            transaction_map.clone(),
            replica_id,
            partition_id,
        ));

        let max_txn_id = outcome.pending_transaction_ids.iter().copied().max().unwrap_or(0);

        info!(
            "replica {} opened at tail_lsn={} pending_txns={}",
            replica_id,
            log_manager.tail_lsn(),
            outcome.pending_transaction_ids.len()
        );

        Ok(Self {
            replica_id,
            log_manager,
            writer,
            transaction_map,
            operation_processor,
            checkpoint_manager,
            backup_manager,
            version_manager: Arc::new(VersionManager::new()),
            host_activation: Arc::new(HostActivationTable::new()),
            dispatcher,
            next_txn_id: AtomicU64::new(max_txn_id + 1),
        })
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.log_manager.tail_lsn()
    }

    pub fn tail_epoch(&self) -> Epoch {
        self.log_manager.tail_epoch()
    }

    pub fn last_stable_lsn(&self) -> Lsn {
        self.transaction_map.lock().unwrap().last_stable_lsn()
    }

    pub fn version_manager(&self) -> &VersionManager {
        &self.version_manager
    }

    pub fn host_activation(&self) -> &HostActivationTable {
        &self.host_activation
    }

    fn dispatch_ctx(&self) -> DispatchContext<'_> {
        DispatchContext {
            transaction_map: &self.transaction_map,
            operation_processor: &self.operation_processor,
            recovery_complete_and_role_known: true,
        }
    }

    fn after_log_write(&self, lsn: Lsn, bytes: usize) {
        self.transaction_map.lock().unwrap().set_tail_lsn(lsn);
        self.checkpoint_manager.record_bytes_inserted(bytes as u64);
    }

    /// Begin a new transaction and log its `BeginTransaction` record.
    pub fn begin_transaction(&self) -> Result<TxnId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::AcqRel);
        let mut record = LogRecord::BeginTransaction {
            header: RecordHeader::invalid(RecordType::BeginTransaction),
            txn_id,
            is_single_operation: true,
            metadata: Vec::new(),
            undo: None,
            redo: None,
        };
        let (lsn, psn, bytes) = self.log_manager.replicate_and_log(record.clone())?;
        record.header_mut().lsn = lsn;
        record.header_mut().psn = psn;
        self.dispatcher.dispatch(vec![record], &self.dispatch_ctx())?;
        self.after_log_write(lsn, bytes);
        Ok(txn_id)
    }

    /// Append an operation to an already-active transaction, returning the
    /// LSN it was assigned.
    pub fn add_operation(
        &self,
        txn_id: TxnId,
        metadata: Vec<u8>,
        undo: Option<Vec<u8>>,
        redo: Option<Vec<u8>>,
    ) -> Result<Lsn> {
        {
            let map = self.transaction_map.lock().unwrap();
            let txn = map.get(txn_id).ok_or(ReplicatorError::TransactionNotActive(txn_id))?;
            if !matches!(txn.state(), TransactionState::Active) {
                return Err(ReplicatorError::TransactionNotActive(txn_id));
            }
        }
        let parent_psn = self
            .transaction_map
            .lock()
            .unwrap()
            .latest_record_psn(txn_id)
            .unwrap_or(INVALID_PSN);

        let mut record = LogRecord::Operation {
            header: RecordHeader::invalid(RecordType::Operation),
            txn_id,
            metadata,
            undo,
            redo,
            parent_psn,
        };
        let (lsn, psn, bytes) = self.log_manager.replicate_and_log(record.clone())?;
        record.header_mut().lsn = lsn;
        record.header_mut().psn = psn;
        self.dispatcher.dispatch(vec![record], &self.dispatch_ctx())?;
        self.after_log_write(lsn, bytes);
        self.log_manager.index_if_due()?;
        self.checkpoint_manager.checkpoint_if_necessary()?;
        Ok(lsn)
    }

    fn finish_transaction(&self, txn_id: TxnId, committed: bool) -> Result<Lsn> {
        {
            let mut map = self.transaction_map.lock().unwrap();
            let txn = map.get_mut(txn_id).ok_or(ReplicatorError::TransactionNotActive(txn_id))?;
            if committed {
                txn.on_begin_commit()?;
            } else {
                txn.on_user_abort()?;
            }
        }
        let mut record = LogRecord::EndTransaction {
            header: RecordHeader::invalid(RecordType::EndTransaction),
            txn_id,
            is_committed: committed,
        };
        let (lsn, psn, bytes) = self.log_manager.replicate_and_log(record.clone())?;
        record.header_mut().lsn = lsn;
        record.header_mut().psn = psn;
        self.dispatcher.dispatch(vec![record], &self.dispatch_ctx())?;
        self.after_log_write(lsn, bytes);
        self.checkpoint_manager.checkpoint_if_necessary()?;
        Ok(lsn)
    }

    /// Commit a transaction: applies its combined redo once and unlocks
    /// once, matching spec §8.2 scenario S1.
    pub fn commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.finish_transaction(txn_id, true)
    }

    /// Abort a transaction: unlocks each buffered operation and never
    /// applies, matching spec §8.2 scenario S2.
    pub fn abort(&self, txn_id: TxnId) -> Result<Lsn> {
        self.finish_transaction(txn_id, false)
    }

    /// Log a `Barrier` and advance the last-stable LSN to it.
    pub fn barrier(&self) -> Result<Lsn> {
        let record = LogRecord::Barrier {
            header: RecordHeader::invalid(RecordType::Barrier),
        };
        let (lsn, _psn, bytes) = self.log_manager.replicate_and_log(record)?;
        self.transaction_map.lock().unwrap().advance_stable_lsn(lsn);
        self.checkpoint_manager.record_bytes_inserted(bytes as u64);
        self.checkpoint_manager.checkpoint_if_necessary()?;
        Ok(lsn)
    }

    /// Log an `UpdateEpoch` for a reconfiguration.
    pub fn update_epoch(&self, epoch: Epoch, timestamp_millis: u64) -> Result<Lsn> {
        let (lsn, _psn) = self.log_manager.update_epoch(epoch, self.replica_id, timestamp_millis)?;
        self.transaction_map.lock().unwrap().set_tail_lsn(lsn);
        Ok(lsn)
    }

    /// Force a checkpoint regardless of the byte-threshold policy.
    pub fn force_checkpoint(&self) -> Result<()> {
        self.checkpoint_manager.force_checkpoint()
    }

    /// The checkpoint manager, for callers that need head-truncation
    /// control (`truncate_head_if_eligible` needs the candidate head Psn/Lsn
    /// and reclaimed-byte count a caller derives from its own indexing scan).
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// Cancel a pending head truncation a caller decided not to finish,
    /// logging a terminal `TruncateHead(Aborted)` record.
    pub fn abort_pending_log_head_truncation(&self) -> Result<()> {
        self.checkpoint_manager.abort_pending_log_head_truncation()
    }

    /// Take a backup into `backup_root`, forcing a checkpoint first.
    pub fn backup(
        &self,
        backup_root: &Path,
        backup_option: BackupOption,
        backup_id: u128,
        parent_backup_id: u128,
        starting_lsn: Lsn,
        starting_epoch: Epoch,
    ) -> Result<BackupMetadata> {
        self.backup_manager.backup(
            backup_root,
            backup_option,
            backup_id,
            parent_backup_id,
            starting_lsn,
            starting_epoch,
        )
    }

    /// Read every `BackupMetadataFile` directly under `backup_root` and
    /// validate the resulting chain (spec §4.11). Does not open a
    /// `Replicator`; a caller restoring from backup runs this first to pick
    /// the chain to replay.
    pub fn plan_restore(backup_root: &Path) -> Result<Vec<BackupMetadata>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(backup_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let meta_path = entry.path().join("BackupMetadataFile");
                if meta_path.exists() {
                    entries.push(metadata_file::read_from_file(meta_path)?);
                }
            }
        }
        backup::folder_analyzer::analyze(entries)
    }

    /// Flush and close. Further calls into this replicator are undefined;
    /// drop it afterward.
    pub fn close(&self) -> Result<()> {
        let record = LogRecord::Information {
            header: RecordHeader::invalid(RecordType::Information),
            event: record::InformationEvent::Closed,
        };
        self.log_manager.replicate_and_log(record)?;
        self.writer.force_sync()?;
        info!("replica {} closed at tail_lsn={}", self.replica_id, self.tail_lsn());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct RecordingStateProvider {
        applied: StdMutex<Vec<(TxnId, Lsn)>>,
        unlocked: StdMutex<Vec<TxnId>>,
    }

    impl RecordingStateProvider {
        fn new() -> Self {
            Self {
                applied: StdMutex::new(Vec::new()),
                unlocked: StdMutex::new(Vec::new()),
            }
        }
    }

    impl StateProvider for RecordingStateProvider {
        fn apply(
            &self,
            txn_id: TxnId,
            lsn: Lsn,
            _metadata: &[u8],
            _redo: Option<&[u8]>,
            _context: ApplyContext,
        ) -> Result<()> {
            self.applied.lock().unwrap().push((txn_id, lsn));
            Ok(())
        }

        fn unlock(&self, txn_id: TxnId, _metadata: &[u8], _undo: Option<&[u8]>) -> Result<()> {
            self.unlocked.lock().unwrap().push(txn_id);
            Ok(())
        }

        fn checkpoint(&self) -> Result<()> {
            Ok(())
        }

        fn complete_checkpoint(&self) -> Result<()> {
            Ok(())
        }
    }

    fn open(dir: &Path, sp: Arc<RecordingStateProvider>) -> Replicator {
        Replicator::open(
            dir,
            1,
            42,
            ReplicatorConfig::aggressive_truncation(),
            sp,
            Arc::new(NullReplicator),
        )
        .unwrap()
    }

    #[test]
    fn commit_applies_once_and_unlocks_once() {
        let dir = tempdir().unwrap();
        let sp = Arc::new(RecordingStateProvider::new());
        let replicator = open(dir.path(), sp.clone());

        let txn_id = replicator.begin_transaction().unwrap();
        replicator.add_operation(txn_id, vec![1], Some(vec![9]), Some(vec![1])).unwrap();
        replicator.add_operation(txn_id, vec![2], Some(vec![9]), Some(vec![2])).unwrap();
        replicator.commit(txn_id).unwrap();

        assert_eq!(sp.applied.lock().unwrap().len(), 1);
        assert_eq!(sp.unlocked.lock().unwrap().len(), 1);
    }

    #[test]
    fn abort_never_applies_and_unlocks_each_operation() {
        let dir = tempdir().unwrap();
        let sp = Arc::new(RecordingStateProvider::new());
        let replicator = open(dir.path(), sp.clone());

        let txn_id = replicator.begin_transaction().unwrap();
        replicator.add_operation(txn_id, vec![1], Some(vec![9]), Some(vec![1])).unwrap();
        replicator.add_operation(txn_id, vec![2], Some(vec![9]), Some(vec![2])).unwrap();
        replicator.abort(txn_id).unwrap();

        assert!(sp.applied.lock().unwrap().is_empty());
        assert_eq!(sp.unlocked.lock().unwrap().len(), 2);
    }

    #[test]
    fn add_operation_on_unknown_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let sp = Arc::new(RecordingStateProvider::new());
        let replicator = open(dir.path(), sp);
        let err = replicator.add_operation(999, vec![1], None, None).unwrap_err();
        assert!(matches!(err, ReplicatorError::TransactionNotActive(999)));
    }

    #[test]
    fn reopen_after_commit_recovers_tail_lsn() {
        let dir = tempdir().unwrap();
        let sp = Arc::new(RecordingStateProvider::new());
        {
            let replicator = open(dir.path(), sp.clone());
            let txn_id = replicator.begin_transaction().unwrap();
            replicator.add_operation(txn_id, vec![1], Some(vec![9]), Some(vec![1])).unwrap();
            replicator.commit(txn_id).unwrap();
            replicator.close().unwrap();
        }

        let sp2 = Arc::new(RecordingStateProvider::new());
        let reopened = open(dir.path(), sp2);
        assert!(reopened.tail_lsn() >= 4);
    }

    #[test]
    fn barrier_advances_last_stable_lsn() {
        let dir = tempdir().unwrap();
        let sp = Arc::new(RecordingStateProvider::new());
        let replicator = open(dir.path(), sp);
        let lsn = replicator.barrier().unwrap();
        assert_eq!(replicator.last_stable_lsn(), lsn);
    }
}
