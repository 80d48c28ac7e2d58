//! Backup manager: thin orchestration glue invoking a checkpoint and
//! writing the backup metadata file that records where this backup sits in
//! the lineage (spec §2 item 13, §4.11).
//!
//! Mirrors `lib.rs`'s construct-sub-component-and-delegate wiring style: no
//! logic of its own beyond sequencing a forced checkpoint and a metadata
//! write, the same way the top-level server wires a storage engine and a
//! protocol handler without owning either's internals.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::backup::metadata_file::{self, BackupMetadata, BackupOption};
use crate::checkpoint_manager::CheckpointManager;
use crate::error::Result;
use crate::record::ReplicaId;
use crate::replicated_log_manager::ReplicatedLogManager;
use crate::transaction_map::TransactionMap;

pub struct BackupManager {
    checkpoint_manager: Arc<CheckpointManager>,
    log_manager: Arc<ReplicatedLogManager>,
    transaction_map: Arc<Mutex<TransactionMap>>,
    replica_id: ReplicaId,
    partition_id: u128,
}

impl BackupManager {
    pub fn new(
        checkpoint_manager: Arc<CheckpointManager>,
        log_manager: Arc<ReplicatedLogManager>,
        transaction_map: Arc<Mutex<TransactionMap>>,
        replica_id: ReplicaId,
        partition_id: u128,
    ) -> Self {
        Self {
            checkpoint_manager,
            log_manager,
            transaction_map,
            replica_id,
            partition_id,
        }
    }

    /// Force a checkpoint, then write `backup_root/BackupMetadataFile`
    /// describing this backup's place in the lineage. Returns the metadata
    /// that was written.
    pub fn backup(
        &self,
        backup_root: &Path,
        backup_option: BackupOption,
        backup_id: u128,
        parent_backup_id: u128,
        starting_lsn: crate::record::Lsn,
        starting_epoch: crate::record::Epoch,
    ) -> Result<BackupMetadata> {
        self.checkpoint_manager.force_checkpoint()?;

        let backup_epoch = self.log_manager.tail_epoch();
        let backup_lsn = self.transaction_map.lock().unwrap().last_stable_lsn();

        let meta = BackupMetadata {
            backup_option,
            backup_id,
            parent_backup_id,
            partition_id: self.partition_id,
            replica_id: self.replica_id,
            starting_epoch,
            starting_lsn,
            backup_epoch,
            backup_lsn,
        };

        std::fs::create_dir_all(backup_root)?;
        metadata_file::write_to_file(backup_root.join("BackupMetadataFile"), &meta)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReplicatorConfig;
    use crate::fault_utility::FaultUtility;
    use crate::logical_log::InMemoryLogicalLog;
    use crate::operation_processor::OperationProcessor;
    use crate::physical_writer::{PhysicalLogWriter, PhysicalWriterConfig};
    use crate::replicated_log_manager::{NullReplicator, ReplicatedLogManager};

    struct NoopStateProvider;
    impl crate::operation_processor::StateProvider for NoopStateProvider {
        fn apply(
            &self,
            _txn_id: crate::error::TxnId,
            _lsn: crate::record::Lsn,
            _metadata: &[u8],
            _undo: Option<&[u8]>,
            _context: crate::operation_processor::ApplyContext,
        ) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _txn_id: crate::error::TxnId, _metadata: &[u8], _undo: Option<&[u8]>) -> Result<()> {
            Ok(())
        }
        fn checkpoint(&self) -> Result<()> {
            Ok(())
        }
        fn complete_checkpoint(&self) -> Result<()> {
            Ok(())
        }
    }

    fn build() -> BackupManager {
        let log: Arc<dyn crate::logical_log::LogicalLog> = Arc::new(InMemoryLogicalLog::new());
        let writer = Arc::new(PhysicalLogWriter::new(Arc::clone(&log), PhysicalWriterConfig::synchronous(), 0));
        let operation_processor = Arc::new(OperationProcessor::new(
            Arc::new(NoopStateProvider),
            Arc::new(FaultUtility::new()),
            0,
        ));
        let log_manager = Arc::new(ReplicatedLogManager::new(
            writer,
            log,
            Arc::new(NullReplicator),
            operation_processor.clone(),
            1,
            1024 * 1024,
        ));
        let transaction_map = Arc::new(Mutex::new(TransactionMap::new()));
        let clock = Arc::new(ManualClock::new(0));
        let checkpoint_manager = Arc::new(CheckpointManager::new(
            log_manager.clone(),
            operation_processor,
            transaction_map.clone(),
            ReplicatorConfig::aggressive_truncation(),
            clock,
        ));
        BackupManager::new(checkpoint_manager, log_manager, transaction_map, 1, 77)
    }

    #[test]
    fn backup_writes_a_readable_metadata_file() {
        let mgr = build();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Backup.0001");
        let meta = mgr
            .backup(&target, BackupOption::Full, 1, 0, 0, crate::record::Epoch::ZERO)
            .unwrap();
        assert_eq!(meta.partition_id, 77);

        let read_back = metadata_file::read_from_file(target.join("BackupMetadataFile")).unwrap();
        assert_eq!(read_back, meta);
    }
}
