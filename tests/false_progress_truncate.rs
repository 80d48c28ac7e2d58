//! A primary discovers, during build from a second primary's history, that
//! its own tail diverged before a checkpoint it already logged. The
//! truncate-tail walk must undo everything above the new tail — including
//! unwinding straight through a `BeginCheckpoint` record, which carries no
//! state-provider side effect of its own and is simply dropped.

use std::sync::{Arc, Mutex};

use txnlog::copy::truncate_tail;
use txnlog::fault_utility::FaultUtility;
use txnlog::logical_log::{InMemoryLogicalLog, LogicalLog};
use txnlog::operation_processor::{ApplyContext, OperationProcessor, StateProvider};
use txnlog::progress_vector::ProgressVector;
use txnlog::record::{self, CheckpointState, Epoch, LogRecord, ProgressVectorEntry, RecordHeader, RecordType, TxnId};
use txnlog::transaction_map::TransactionMap;

struct RecordingStateProvider {
    applies: Mutex<Vec<(TxnId, ApplyContext)>>,
}

impl RecordingStateProvider {
    fn new() -> Self {
        Self { applies: Mutex::new(Vec::new()) }
    }
}

impl StateProvider for RecordingStateProvider {
    fn apply(
        &self,
        txn_id: TxnId,
        _lsn: u64,
        _metadata: &[u8],
        _redo: Option<&[u8]>,
        context: ApplyContext,
    ) -> txnlog::error::Result<()> {
        self.applies.lock().unwrap().push((txn_id, context));
        Ok(())
    }

    fn unlock(&self, _txn_id: TxnId, _metadata: &[u8], _undo: Option<&[u8]>) -> txnlog::error::Result<()> {
        Ok(())
    }

    fn checkpoint(&self) -> txnlog::error::Result<()> {
        Ok(())
    }

    fn complete_checkpoint(&self) -> txnlog::error::Result<()> {
        Ok(())
    }
}

fn header(record_type: RecordType, lsn: u64, psn: u64) -> RecordHeader {
    RecordHeader { record_type, lsn, psn, position: 0, length: 0 }
}

#[test]
fn truncate_tail_unwinds_through_a_begin_checkpoint() {
    let log = InMemoryLogicalLog::new();
    let append = |r: LogRecord| log.append(&record::write_record(&r, true).unwrap()).unwrap();

    // txn1: committed below the eventual truncation target, must survive.
    append(LogRecord::BeginTransaction {
        header: header(RecordType::BeginTransaction, 1, 0),
        txn_id: 1,
        is_single_operation: true,
        metadata: vec![1],
        undo: None,
        redo: None,
    });
    append(LogRecord::EndTransaction {
        header: header(RecordType::EndTransaction, 2, 1),
        txn_id: 1,
        is_committed: true,
    });

    // A checkpoint taken while txn1 was already stable.
    append(LogRecord::BeginCheckpoint {
        header: header(RecordType::BeginCheckpoint, 3, 2),
        earliest_pending_transaction_psn: record::INVALID_PSN,
        checkpoint_state: CheckpointState::Completed,
        last_stable_lsn: 2,
        progress_vector: vec![ProgressVectorEntry {
            epoch: Epoch { data_loss_version: 0, configuration_version: 1 },
            starting_lsn: 0,
            replica_id: 1,
            timestamp_millis: 0,
        }],
        periodic_checkpoint_time_millis: 0,
        periodic_truncation_time_millis: 0,
    });

    // txn2: logged after the checkpoint, diverges from the other primary's
    // history and must be fully undone.
    append(LogRecord::BeginTransaction {
        header: header(RecordType::BeginTransaction, 4, 3),
        txn_id: 2,
        is_single_operation: false,
        metadata: vec![2],
        undo: Some(vec![2]),
        redo: Some(vec![2]),
    });
    append(LogRecord::Operation {
        header: header(RecordType::Operation, 5, 4),
        txn_id: 2,
        metadata: vec![3],
        undo: Some(vec![3]),
        redo: Some(vec![3]),
        parent_psn: 3,
    });

    let mut progress_vector = ProgressVector::new(1, 0);
    progress_vector
        .append(ProgressVectorEntry {
            epoch: Epoch { data_loss_version: 0, configuration_version: 1 },
            starting_lsn: 3,
            replica_id: 1,
            timestamp_millis: 0,
        })
        .unwrap();

    let state_provider = Arc::new(RecordingStateProvider::new());
    let processor = OperationProcessor::new(state_provider.clone(), Arc::new(FaultUtility::new()), 0);
    let transaction_map = Mutex::new(TransactionMap::new());

    // Target tail sits on txn1's EndTransaction, below the checkpoint: the
    // checkpoint and everything txn2 did above it must be undone.
    let outcome = truncate_tail(&log, 2, 0, &transaction_map, &processor, &progress_vector).unwrap();

    assert_eq!(outcome.new_tail_lsn, 2);

    let applies = state_provider.applies.lock().unwrap();
    assert_eq!(applies.len(), 2);
    assert!(applies.iter().all(|(txn_id, ctx)| *txn_id == 2 && *ctx == ApplyContext::FalseProgress));
    drop(applies);

    // Everything belonging to txn2 is gone from the map; txn1 was never
    // touched by the undo walk (it sits below the target).
    assert!(transaction_map.lock().unwrap().get(2).is_none());

    // The checkpoint's epoch entry (starting_lsn 3) is rewound along with
    // the records that came after it; the seed entry at lsn 0 survives.
    assert_eq!(outcome.rewound_progress_vector.entries().len(), 1);
    assert_eq!(outcome.rewound_progress_vector.last().starting_lsn, 0);

    // The physical log itself shrank to just past txn1's EndTransaction.
    assert!(outcome.new_tail_byte_len < log.len().unwrap());
}
