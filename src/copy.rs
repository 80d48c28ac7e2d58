//! Copy / build and false-progress truncate-tail (spec §4.10).
//!
//! `select_copy_mode`/`batch_records` are new (no teacher equivalent — the
//! teacher has no replica-to-replica copy concept), grounded on
//! `other_examples/..backup-cli..mod.rs`'s `GlobalBackupOpt::max_chunk_size`
//! chunked-transfer pattern for the batching shape. `truncate_tail` reuses
//! `recovery_manager.rs`'s forward-scan-then-backward-walk idiom, run in
//! reverse, and calls into `operation_processor.rs::apply` exactly as
//! `engines/granite/recovery.rs::undo_operation` calls back into storage for
//! an uncommitted transaction.

use std::sync::Mutex;

use crate::error::{ReplicatorError, Result};
use crate::logical_log::LogicalLog;
use crate::operation_processor::{ApplyContext, OperationProcessor};
use crate::progress_vector::ProgressVector;
use crate::record::{self, Epoch, LogRecord, Lsn, Psn, ReplicaId};
use crate::transaction_map::TransactionMap;

/// Which of the three copy strategies a source picks for a given target
/// (spec §4.10 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Full,
    PartialCopyLog,
    FalseProgress,
}

/// `{metadataVersion=1, copyStage, sourceReplicaId}` (spec §4.10 item 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    Metadata,
    StateStream,
    LogStream,
    Done,
}

pub const COPY_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct CopyMetadata {
    pub metadata_version: u32,
    pub copy_stage: CopyStage,
    pub source_replica_id: ReplicaId,
}

impl CopyMetadata {
    pub fn new(copy_stage: CopyStage, source_replica_id: ReplicaId) -> Self {
        Self {
            metadata_version: COPY_METADATA_VERSION,
            copy_stage,
            source_replica_id,
        }
    }
}

/// Pick a copy mode by comparing progress vectors and tail/head LSNs (spec
/// §4.10). A target whose tail sits below the source's retained log head,
/// but whose history does not diverge, still needs `Full`: the records it
/// would need for a partial copy have already been truncated away.
pub fn select_copy_mode(
    target_has_log: bool,
    target_tail_lsn: Lsn,
    target_progress_vector: &ProgressVector,
    source_log_head_lsn: Lsn,
    source_progress_vector: &ProgressVector,
) -> CopyMode {
    if !target_has_log {
        return CopyMode::Full;
    }
    if source_progress_vector
        .find_divergence(target_progress_vector)
        .is_some()
    {
        return CopyMode::FalseProgress;
    }
    if target_tail_lsn >= source_log_head_lsn {
        CopyMode::PartialCopyLog
    } else {
        CopyMode::Full
    }
}

/// `min(target_tail_lsn + 1, source_checkpoint_lsn)` — if the natural
/// starting point is below what the source still has checkpoint-pinned, the
/// source silently raises it (spec §4.10 item 3).
pub fn partial_copy_starting_lsn(target_tail_lsn: Lsn, source_checkpoint_lsn: Lsn) -> Lsn {
    (target_tail_lsn + 1).min(source_checkpoint_lsn)
}

/// Pack framed records into byte batches. `batch_size_bytes == 0` disables
/// batching — every record becomes its own batch (spec §4.10's "Batching").
pub fn batch_records(records: &[LogRecord], batch_size_bytes: u64) -> Result<Vec<Vec<u8>>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    for record in records {
        let framed = record::write_record(record, false)?;
        if batch_size_bytes == 0 {
            batches.push(framed);
            continue;
        }
        if !current.is_empty() && current.len() as u64 + framed.len() as u64 > batch_size_bytes {
            batches.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&framed);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Build the stream for `CopyMode::Full`: metadata, then `UpdateEpoch` +
/// `Barrier`, then the caller-supplied opaque state-provider chunks
/// (out of scope for this layer), terminated by an empty "null" batch.
pub fn build_full_copy_stream(
    source_replica_id: ReplicaId,
    epoch: Epoch,
    state_provider_chunks: Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>> {
    let mut stream = vec![build_metadata_batch(CopyStage::Metadata, source_replica_id)];

    let update_epoch = LogRecord::UpdateEpoch {
        header: record::RecordHeader::invalid(crate::record::RecordType::UpdateEpoch),
        epoch,
        replica_id: source_replica_id,
    };
    let barrier = LogRecord::Barrier {
        header: record::RecordHeader::invalid(crate::record::RecordType::Barrier),
    };
    stream.push(record::write_record(&update_epoch, false)?);
    stream.push(record::write_record(&barrier, false)?);

    stream.push(build_metadata_batch(CopyStage::StateStream, source_replica_id));
    stream.extend(state_provider_chunks);

    stream.push(build_metadata_batch(CopyStage::Done, source_replica_id));
    stream.push(Vec::new());
    Ok(stream)
}

/// Build the stream for `CopyMode::PartialCopyLog`/`FalseProgress`: batched
/// records from `starting_lsn` onward, terminated by a null.
pub fn build_log_copy_stream(
    source_replica_id: ReplicaId,
    source_records: &[LogRecord],
    starting_lsn: Lsn,
    batch_size_bytes: u64,
) -> Result<Vec<Vec<u8>>> {
    let relevant: Vec<LogRecord> = source_records
        .iter()
        .filter(|r| r.lsn() >= starting_lsn)
        .cloned()
        .collect();

    let mut stream = vec![build_metadata_batch(CopyStage::LogStream, source_replica_id)];
    stream.extend(batch_records(&relevant, batch_size_bytes)?);
    stream.push(Vec::new());
    Ok(stream)
}

fn build_metadata_batch(stage: CopyStage, source_replica_id: ReplicaId) -> Vec<u8> {
    // The copy-metadata operation itself is not a LogRecord; a single tagged
    // byte plus the source replica id is enough for this layer's purposes
    // (the real state-manager-facing wire format is out of scope, spec §1).
    let tag: u8 = match stage {
        CopyStage::Metadata => 0,
        CopyStage::StateStream => 1,
        CopyStage::LogStream => 2,
        CopyStage::Done => 3,
    };
    let mut bytes = vec![tag];
    bytes.extend_from_slice(&source_replica_id.to_le_bytes());
    bytes
}

pub struct TruncateTailOutcome {
    pub new_tail_lsn: Lsn,
    pub new_tail_byte_len: u64,
    pub rewound_progress_vector: ProgressVector,
    pub prior_log_head_psn: Option<Psn>,
}

/// False-progress truncate-tail (spec §4.10): undo every record above
/// `target_tail_lsn`, on the source's behalf, from the tail backward.
pub fn truncate_tail(
    log: &dyn LogicalLog,
    target_tail_lsn: Lsn,
    last_stable_lsn: Lsn,
    transaction_map: &Mutex<TransactionMap>,
    operation_processor: &OperationProcessor,
    progress_vector: &ProgressVector,
) -> Result<TruncateTailOutcome> {
    if target_tail_lsn < last_stable_lsn {
        return Err(ReplicatorError::InvalidOperation(
            "truncate-tail target may not cross the last stable lsn".into(),
        ));
    }

    let total_len = log.len()?;
    let head = log.head();
    let _lease = log.lease_reader();
    let bytes = log.read_at(head, (total_len - head) as usize)?;

    let mut end = bytes.len();
    let mut new_tail_byte_len = head;
    let mut prior_log_head_psn = None;
    let mut rewound_progress_vector = progress_vector.clone();

    while end > 0 {
        let (record, start) = record::read_record_backward(&bytes, end)?;
        let lsn = record.lsn();
        if lsn <= target_tail_lsn {
            new_tail_byte_len = head + end as u64;
            break;
        }

        match record {
            LogRecord::BeginTransaction { txn_id, metadata, undo, .. }
            | LogRecord::Operation { txn_id, metadata, undo, .. } => {
                operation_processor.apply(txn_id, lsn, &metadata, undo.as_deref(), ApplyContext::FalseProgress)?;
                transaction_map.lock().unwrap().remove(txn_id);
            }
            LogRecord::EndTransaction { txn_id, .. } => {
                transaction_map.lock().unwrap().remove(txn_id);
            }
            LogRecord::TruncateHead { head_record_psn, .. } => {
                // the prior head stays on disk: records above the new tail
                // may still reference it, so only remember it for the
                // caller, never re-run the truncation.
                prior_log_head_psn = Some(head_record_psn);
            }
            LogRecord::Backup { .. }
            | LogRecord::UpdateEpoch { .. }
            | LogRecord::BeginCheckpoint { .. }
            | LogRecord::CompleteCheckpoint { .. }
            | LogRecord::Indexing { .. } => {
                // in-memory-only rewind; handled below via
                // rewound_progress_vector and the caller's own checkpoint
                // state reset.
            }
            _ => {}
        }

        end = start;
        new_tail_byte_len = head + start as u64;
    }

    rewound_progress_vector.retain_up_to(target_tail_lsn);
    log.truncate_suffix(new_tail_byte_len)?;

    Ok(TruncateTailOutcome {
        new_tail_lsn: target_tail_lsn,
        new_tail_byte_len,
        rewound_progress_vector,
        prior_log_head_psn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_utility::FaultUtility;
    use crate::logical_log::InMemoryLogicalLog;
    use crate::operation_processor::StateProvider;
    use crate::record::{RecordHeader, RecordType, TxnId};
    use std::sync::Arc;

    struct CountingStateProvider {
        applies: Mutex<Vec<(TxnId, ApplyContext)>>,
    }
    impl CountingStateProvider {
        fn new() -> Self {
            Self { applies: Mutex::new(Vec::new()) }
        }
    }
    impl StateProvider for CountingStateProvider {
        fn apply(&self, txn_id: TxnId, _: Lsn, _: &[u8], _: Option<&[u8]>, ctx: ApplyContext) -> Result<()> {
            self.applies.lock().unwrap().push((txn_id, ctx));
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

    fn header(record_type: RecordType, lsn: Lsn, psn: Psn) -> RecordHeader {
        RecordHeader { record_type, lsn, psn, position: 0, length: 0 }
    }

    #[test]
    fn select_copy_mode_picks_full_for_a_fresh_target() {
        let pv = ProgressVector::new(1, 0);
        let mode = select_copy_mode(false, 0, &pv, 0, &pv);
        assert_eq!(mode, CopyMode::Full);
    }

    #[test]
    fn select_copy_mode_picks_partial_when_tail_covers_source_head() {
        let pv = ProgressVector::new(1, 0);
        let mode = select_copy_mode(true, 100, &pv, 50, &pv);
        assert_eq!(mode, CopyMode::PartialCopyLog);
    }

    #[test]
    fn select_copy_mode_picks_false_progress_on_divergent_history() {
        let mut source_pv = ProgressVector::new(1, 0);
        source_pv
            .append(crate::record::ProgressVectorEntry {
                epoch: Epoch { data_loss_version: 0, configuration_version: 1 },
                starting_lsn: 50,
                replica_id: 1,
                timestamp_millis: 0,
            })
            .unwrap();
        let mut target_pv = ProgressVector::new(1, 0);
        target_pv
            .append(crate::record::ProgressVectorEntry {
                epoch: Epoch { data_loss_version: 0, configuration_version: 1 },
                starting_lsn: 60,
                replica_id: 2,
                timestamp_millis: 0,
            })
            .unwrap();
        let mode = select_copy_mode(true, 100, &target_pv, 10, &source_pv);
        assert_eq!(mode, CopyMode::FalseProgress);
    }

    #[test]
    fn batch_records_packs_until_threshold_exceeded() {
        let records = vec![
            LogRecord::Barrier { header: header(RecordType::Barrier, 1, 0) },
            LogRecord::Barrier { header: header(RecordType::Barrier, 2, 1) },
            LogRecord::Barrier { header: header(RecordType::Barrier, 3, 2) },
        ];
        let unbatched = batch_records(&records, 0).unwrap();
        assert_eq!(unbatched.len(), 3);

        let one_batch = batch_records(&records, 10_000).unwrap();
        assert_eq!(one_batch.len(), 1);
    }

    #[test]
    fn truncate_tail_undoes_records_above_target_and_shrinks_log() {
        let log = InMemoryLogicalLog::new();
        let append = |r: LogRecord| log.append(&record::write_record(&r, true).unwrap()).unwrap();

        append(LogRecord::BeginTransaction {
            header: header(RecordType::BeginTransaction, 1, 0),
            txn_id: 1,
            is_single_operation: true,
            metadata: vec![],
            undo: None,
            redo: None,
        });
        append(LogRecord::EndTransaction {
            header: header(RecordType::EndTransaction, 2, 1),
            txn_id: 1,
            is_committed: true,
        });
        append(LogRecord::BeginTransaction {
            header: header(RecordType::BeginTransaction, 3, 2),
            txn_id: 2,
            is_single_operation: true,
            metadata: vec![7],
            undo: Some(vec![7]),
            redo: Some(vec![7]),
        });
        append(LogRecord::EndTransaction {
            header: header(RecordType::EndTransaction, 4, 3),
            txn_id: 2,
            is_committed: true,
        });

        let len_before = log.len().unwrap();

        let sp = Arc::new(CountingStateProvider::new());
        let processor = OperationProcessor::new(sp.clone(), Arc::new(FaultUtility::new()), 0);
        let map = Mutex::new(TransactionMap::new());
        let pv = ProgressVector::new(1, 0);

        let outcome = truncate_tail(&log, 2, 0, &map, &processor, &pv).unwrap();

        assert_eq!(outcome.new_tail_lsn, 2);
        assert!(outcome.new_tail_byte_len < len_before);
        assert_eq!(sp.applies.lock().unwrap().len(), 1);
        assert_eq!(sp.applies.lock().unwrap()[0].1, ApplyContext::FalseProgress);
    }

    #[test]
    fn truncate_tail_rejects_crossing_last_stable_lsn() {
        let log = InMemoryLogicalLog::new();
        let map = Mutex::new(TransactionMap::new());
        let processor = OperationProcessor::new(Arc::new(CountingStateProvider::new()), Arc::new(FaultUtility::new()), 0);
        let pv = ProgressVector::new(1, 0);
        assert!(truncate_tail(&log, 2, 5, &map, &processor, &pv).is_err());
    }
}
