//! Operation processor: drives state-provider Apply/Unlock and exposes the
//! wait-for-drain futures the checkpoint manager and barrier processing
//! need (spec §4.7).
//!
//! `StateProvider` is the seam into the out-of-scope state-provider layer —
//! generalized from the teacher's `engines/handler.rs::EngineHandler`
//! trait (insert/update/delete/scan/commit/rollback against one concrete
//! table engine) into the four calls this engine actually makes into an
//! external, opaque state provider.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Result;
use crate::fault_utility::FaultUtility;
use crate::record::{Lsn, RecordType, TxnId};

/// Which phase the engine is in when it calls into the state provider —
/// the callback behaves differently (e.g. no locking during recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyContext {
    Primary,
    Secondary,
    Recovery,
    FalseProgress,
}

/// External collaborator: table/row storage, opaque to this layer (spec
/// §1's "concrete state-provider layer" is out of scope; only this
/// interface is in scope).
pub trait StateProvider: Send + Sync {
    fn apply(
        &self,
        txn_id: TxnId,
        lsn: Lsn,
        metadata: &[u8],
        redo: Option<&[u8]>,
        context: ApplyContext,
    ) -> Result<()>;

    fn unlock(&self, txn_id: TxnId, metadata: &[u8], undo: Option<&[u8]>) -> Result<()>;

    /// `PerformCheckpoint` — flush state-provider-owned data to disk.
    fn checkpoint(&self) -> Result<()>;

    /// `CompleteCheckpoint` — release resources pinned by the prior
    /// checkpoint (e.g. differential state no longer needed).
    fn complete_checkpoint(&self) -> Result<()>;
}

/// How the dispatcher should schedule a record (spec §4.6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Txn-ordered apply: `BeginTransaction`, `Operation`, `EndTransaction`.
    Normal,
    /// Applied immediately, but only once recovery is complete and the
    /// role is known — `Barrier`, `BeginCheckpoint` on a primary.
    ApplyImmediately,
    /// Metadata bookkeeping only, no state-provider call: `Indexing`,
    /// `UpdateEpoch`, `TruncateTail`, `EndCheckpoint`, `CompleteCheckpoint`,
    /// `TruncateHead`, `Backup`, `Information`.
    ProcessImmediately,
}

/// Classify a record for dispatch (spec §4.6).
pub fn identify_processing_mode(
    record_type: RecordType,
    recovery_complete_and_role_known: bool,
) -> ProcessingMode {
    match record_type {
        RecordType::BeginTransaction | RecordType::Operation | RecordType::EndTransaction => {
            ProcessingMode::Normal
        }
        RecordType::Barrier | RecordType::BeginCheckpoint => {
            if recovery_complete_and_role_known {
                ProcessingMode::ApplyImmediately
            } else {
                ProcessingMode::ProcessImmediately
            }
        }
        RecordType::Indexing
        | RecordType::UpdateEpoch
        | RecordType::TruncateTail
        | RecordType::EndCheckpoint
        | RecordType::CompleteCheckpoint
        | RecordType::TruncateHead
        | RecordType::Backup
        | RecordType::Information => ProcessingMode::ProcessImmediately,
    }
}

#[derive(Default)]
struct WaitCounter {
    count: AtomicI64,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl WaitCounter {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        let remaining = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            let _guard = self.lock.lock().unwrap();
            self.condvar.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::Acquire) > 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

/// Applies/unlocks records against a `StateProvider`, enforcing the
/// recovered checkpoint LSN as a "do-not-apply-below" floor, and exposes
/// drain-to-zero waits for logical and physical record processing.
pub struct OperationProcessor {
    state_provider: Arc<dyn StateProvider>,
    fault_utility: Arc<FaultUtility>,
    do_not_apply_below_lsn: Lsn,
    logical_pending: WaitCounter,
    physical_pending: WaitCounter,
}

impl OperationProcessor {
    pub fn new(
        state_provider: Arc<dyn StateProvider>,
        fault_utility: Arc<FaultUtility>,
        do_not_apply_below_lsn: Lsn,
    ) -> Self {
        Self {
            state_provider,
            fault_utility,
            do_not_apply_below_lsn,
            logical_pending: WaitCounter::default(),
            physical_pending: WaitCounter::default(),
        }
    }

    pub fn begin_logical_record(&self) {
        self.logical_pending.begin();
    }

    pub fn end_logical_record(&self) {
        self.logical_pending.end();
    }

    pub fn begin_physical_record(&self) {
        self.physical_pending.begin();
    }

    pub fn end_physical_record(&self) {
        self.physical_pending.end();
    }

    pub fn wait_for_logical_records_processing(&self) {
        self.logical_pending.wait_for_zero();
    }

    pub fn wait_for_physical_records_processing(&self) {
        self.physical_pending.wait_for_zero();
    }

    pub fn wait_for_all_records_processing(&self) {
        self.logical_pending.wait_for_zero();
        self.physical_pending.wait_for_zero();
    }

    /// Apply an operation's redo, unless `lsn` is below the recovered
    /// checkpoint line (already reflected in state-provider state).
    ///
    /// Counted against the logical-records wait counter for the duration of
    /// the call, so `wait_for_logical_records_processing` genuinely blocks
    /// while a commit's redo is in flight.
    pub fn apply(
        &self,
        txn_id: TxnId,
        lsn: Lsn,
        metadata: &[u8],
        redo: Option<&[u8]>,
        context: ApplyContext,
    ) -> Result<()> {
        if lsn < self.do_not_apply_below_lsn {
            return Ok(());
        }
        self.begin_logical_record();
        let result = (|| {
            self.fault_utility.check("Apply")?;
            self.state_provider.apply(txn_id, lsn, metadata, redo, context)
        })();
        self.end_logical_record();
        result
    }

    pub fn unlock(&self, txn_id: TxnId, metadata: &[u8], undo: Option<&[u8]>) -> Result<()> {
        self.begin_logical_record();
        let result = (|| {
            self.fault_utility.check("Unlock")?;
            self.state_provider.unlock(txn_id, metadata, undo)
        })();
        self.end_logical_record();
        result
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.fault_utility.check("Checkpoint")?;
        self.state_provider.checkpoint()
    }

    pub fn complete_checkpoint(&self) -> Result<()> {
        self.fault_utility.check("CompleteCheckpoint")?;
        self.state_provider.complete_checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_utility::FaultSpec;
    use std::sync::Mutex as StdMutex;

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

    #[test]
    fn processing_mode_classifies_txn_records_as_normal() {
        assert_eq!(
            identify_processing_mode(RecordType::Operation, true),
            ProcessingMode::Normal
        );
    }

    #[test]
    fn barrier_is_apply_immediately_only_after_recovery() {
        assert_eq!(
            identify_processing_mode(RecordType::Barrier, true),
            ProcessingMode::ApplyImmediately
        );
        assert_eq!(
            identify_processing_mode(RecordType::Barrier, false),
            ProcessingMode::ProcessImmediately
        );
    }

    #[test]
    fn metadata_only_kinds_are_process_immediately() {
        assert_eq!(
            identify_processing_mode(RecordType::Indexing, true),
            ProcessingMode::ProcessImmediately
        );
        assert_eq!(
            identify_processing_mode(RecordType::TruncateTail, true),
            ProcessingMode::ProcessImmediately
        );
    }

    #[test]
    fn apply_below_recovered_checkpoint_lsn_is_skipped() {
        let sp = Arc::new(RecordingStateProvider::new());
        let processor = OperationProcessor::new(sp.clone(), Arc::new(FaultUtility::new()), 100);
        processor.apply(1, 50, b"", None, ApplyContext::Recovery).unwrap();
        assert!(sp.applied.lock().unwrap().is_empty());
        processor.apply(1, 150, b"", None, ApplyContext::Recovery).unwrap();
        assert_eq!(sp.applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn fault_injection_on_apply_propagates() {
        let sp = Arc::new(RecordingStateProvider::new());
        let faults = Arc::new(FaultUtility::new());
        faults.set_fault("Apply", FaultSpec::Fail("disk error".into()));
        let processor = OperationProcessor::new(sp, faults, 0);
        assert!(processor.apply(1, 1, b"", None, ApplyContext::Primary).is_err());
    }

    #[test]
    fn wait_for_all_records_processing_blocks_until_drained() {
        let sp = Arc::new(RecordingStateProvider::new());
        let processor = Arc::new(OperationProcessor::new(
            sp,
            Arc::new(FaultUtility::new()),
            0,
        ));
        processor.begin_logical_record();
        processor.begin_physical_record();

        let waiter = Arc::clone(&processor);
        let handle = std::thread::spawn(move || {
            waiter.wait_for_all_records_processing();
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        processor.end_logical_record();
        processor.end_physical_record();
        handle.join().unwrap();
    }
}
