//! Per-transaction lifecycle (spec §3.2, §4.5).
//!
//! Expands the teacher's `engines/granite/types.rs::Transaction` (a plain
//! `{id, state, begin_lsn, undo_log}` with a three-state `TxnState`) into
//! the full seven-state machine with an explicit event API, since a bare
//! `state` field assignment cannot express "attempting to begin a commit on
//! an already-committing transaction is a distinct error from attempting it
//! on an aborted one".

use crate::error::{ReplicatorError, Result};
use crate::record::{Lsn, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    User,
    UserDisposed,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Reading,
    Committing,
    Aborting(AbortReason),
    Committed,
    Aborted,
    Faulted,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    state: TransactionState,
    pub earliest_lsn: Lsn,
    pub commit_lsn: Lsn,
    /// Single-operation and atomic-redo transactions never log a separate
    /// `EndTransaction` record; the dispatcher folds termination into the
    /// sole `Operation` record.
    pub is_single_operation: bool,
    pub operation_count: u32,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            earliest_lsn: INVALID_LSN,
            commit_lsn: INVALID_LSN,
            is_single_operation: true,
            operation_count: 0,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn not_active(&self) -> ReplicatorError {
        ReplicatorError::TransactionNotActive(self.id)
    }

    fn multithreaded(&self) -> ReplicatorError {
        ReplicatorError::MultithreadedTransaction(self.id)
    }

    fn already_aborted(&self) -> ReplicatorError {
        ReplicatorError::TransactionAborted(format!("transaction {} already aborting", self.id))
    }

    pub fn on_begin_read(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Reading;
                Ok(())
            }
            TransactionState::Reading => Err(self.multithreaded()),
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Err(self.not_active())
            }
        }
    }

    pub fn on_begin_commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Committing;
                Ok(())
            }
            TransactionState::Reading => Err(self.multithreaded()),
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Err(self.not_active())
            }
        }
    }

    pub fn on_add_operation(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.operation_count += 1;
                if self.operation_count > 1 {
                    self.is_single_operation = false;
                }
                Ok(())
            }
            TransactionState::Reading => Err(self.multithreaded()),
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Err(self.not_active())
            }
        }
    }

    pub fn on_user_abort(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Aborting(AbortReason::User);
                Ok(())
            }
            TransactionState::Reading => Err(self.multithreaded()),
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Err(self.not_active())
            }
        }
    }

    /// Disposing a transaction must always be able to tear it down, even
    /// from `Reading` (a caller dropped its read handle without finishing)
    /// or a terminal state (idempotent — disposing twice is not an error).
    pub fn on_user_dispose(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active | TransactionState::Reading => {
                self.state = TransactionState::Aborting(AbortReason::UserDisposed);
                Ok(())
            }
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Ok(())
            }
        }
    }

    pub fn on_system_abort(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Aborting(AbortReason::System);
                Ok(())
            }
            TransactionState::Reading => Err(self.multithreaded()),
            TransactionState::Committing
            | TransactionState::Aborting(AbortReason::User)
            | TransactionState::Aborting(AbortReason::UserDisposed) => Err(self.not_active()),
            TransactionState::Aborting(AbortReason::System) => Err(self.already_aborted()),
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted => {
                Err(self.not_active())
            }
        }
    }

    pub fn on_commit_succeeded(&mut self, commit_lsn: Lsn) -> Result<()> {
        match self.state {
            TransactionState::Committing => {
                self.commit_lsn = commit_lsn;
                self.state = TransactionState::Committed;
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "on_commit_succeeded called outside Committing state for txn {}",
                self.id
            ))),
        }
    }

    pub fn on_commit_failed(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Committing => {
                self.state = TransactionState::Faulted;
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "on_commit_failed called outside Committing state for txn {}",
                self.id
            ))),
        }
    }

    pub fn on_abort_succeeded(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Aborting(_) => {
                self.state = TransactionState::Aborted;
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "on_abort_succeeded called outside Aborting state for txn {}",
                self.id
            ))),
        }
    }

    pub fn on_abort_failed(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Aborting(_) => {
                self.state = TransactionState::Faulted;
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "on_abort_failed called outside Aborting state for txn {}",
                self.id
            ))),
        }
    }

    /// An abort is "multi-op" once a second operation was recorded. Per
    /// spec §8.1, single-op aborts skip the Unlock callback entirely.
    pub fn requires_unlock_on_abort(&self) -> bool {
        self.operation_count >= 2
    }
}
