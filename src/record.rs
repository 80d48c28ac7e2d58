//! The polymorphic log record model (spec §3.1, §4.1).
//!
//! Every record carries a common header (`RecordType`, `Lsn`, `Psn`,
//! `RecordPosition`, `RecordLength`) plus variant-specific fields. Chaining
//! fields (the "previous physical", "parent transaction record", "begin
//! checkpoint back-link", ...) are stored as plain `Psn` values using
//! [`INVALID_PSN`] as the sentinel for "points outside the currently
//! reachable log" rather than as owning references — see the design note on
//! cyclic ownership in `DESIGN.md`.
//!
//! Wire format mirrors the teacher's WAL framing
//! (`engines/granite/wal.rs::write_records_no_sync`): a 4-byte little-endian
//! length prefix, the `bincode`-encoded body, and — per spec §4.1 — a
//! trailing 4-byte length suffix equal to the prefix so a reader can walk
//! the log backward.

use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::{ReplicatorError, Result};

pub type Lsn = u64;
pub type Psn = u64;
pub type RecordPosition = u64;
pub type ReplicaId = u64;
pub type TxnId = u64;

/// Sentinel values for fields/links that have no referent (truncated out of
/// memory, or simply "not yet known").
pub const INVALID_LSN: Lsn = u64::MAX;
pub const INVALID_PSN: Psn = u64::MAX;
pub const INVALID_POSITION: RecordPosition = u64::MAX;

/// `{data_loss_version, configuration_version}` pair identifying a
/// configuration epoch (spec §3.4 / GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch {
    pub data_loss_version: u64,
    pub configuration_version: u64,
}

impl Epoch {
    pub const INVALID: Epoch = Epoch {
        data_loss_version: u64::MAX,
        configuration_version: u64::MAX,
    };

    pub const ZERO: Epoch = Epoch {
        data_loss_version: 0,
        configuration_version: 0,
    };
}

/// The discriminant carried redundantly in the header so a reader can
/// classify a record before fully decoding its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Indexing,
    UpdateEpoch,
    Barrier,
    BeginTransaction,
    Operation,
    EndTransaction,
    BeginCheckpoint,
    EndCheckpoint,
    CompleteCheckpoint,
    TruncateHead,
    TruncateTail,
    Backup,
    Information,
}

/// Fields common to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub lsn: Lsn,
    pub psn: Psn,
    pub position: RecordPosition,
    pub length: u32,
}

impl RecordHeader {
    pub fn invalid(record_type: RecordType) -> Self {
        Self {
            record_type,
            lsn: INVALID_LSN,
            psn: INVALID_PSN,
            position: INVALID_POSITION,
            length: 0,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.lsn == INVALID_LSN && self.psn == INVALID_PSN && self.position == INVALID_POSITION
    }
}

/// Checkpoint-record lifecycle state, carried in `BeginCheckpoint` so a
/// reader can tell an aborted checkpoint from a completed one without
/// scanning forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointState {
    Ready,
    Prepared,
    Completed,
    Aborted,
    Faulted,
}

/// Head-truncation record lifecycle state (mirrors `CheckpointState`'s
/// purpose for `TruncateHead`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationState {
    Ready,
    Applied,
    Aborted,
}

/// Audit event kinds carried by `Information` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InformationEvent {
    Closed,
    RestoredFromBackup,
    RecoveryCompleted,
}

/// `{epoch, starting_lsn, replica_id, timestamp}` — see `progress_vector.rs`
/// for the ordered sequence this populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub starting_lsn: Lsn,
    pub replica_id: ReplicaId,
    pub timestamp_millis: u64,
}

/// A single polymorphic log record (spec §3.1 table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    Indexing {
        header: RecordHeader,
        epoch: Epoch,
        /// Psn of the physical record this indexing record replaces as the
        /// candidate log head; `INVALID_PSN` if this is the very first.
        previous_indexing_psn: Psn,
    },
    UpdateEpoch {
        header: RecordHeader,
        epoch: Epoch,
        replica_id: ReplicaId,
    },
    Barrier {
        header: RecordHeader,
    },
    BeginTransaction {
        header: RecordHeader,
        txn_id: TxnId,
        is_single_operation: bool,
        metadata: Vec<u8>,
        undo: Option<Vec<u8>>,
        redo: Option<Vec<u8>>,
    },
    Operation {
        header: RecordHeader,
        txn_id: TxnId,
        metadata: Vec<u8>,
        undo: Option<Vec<u8>>,
        redo: Option<Vec<u8>>,
        /// Psn of the previous record belonging to the same transaction.
        parent_psn: Psn,
    },
    EndTransaction {
        header: RecordHeader,
        txn_id: TxnId,
        is_committed: bool,
    },
    BeginCheckpoint {
        header: RecordHeader,
        /// Psn of the `BeginTransaction` of the earliest still-pending
        /// transaction at the time this checkpoint started.
        earliest_pending_transaction_psn: Psn,
        checkpoint_state: CheckpointState,
        last_stable_lsn: Lsn,
        progress_vector: Vec<ProgressVectorEntry>,
        periodic_checkpoint_time_millis: u64,
        periodic_truncation_time_millis: u64,
    },
    EndCheckpoint {
        header: RecordHeader,
        begin_checkpoint_psn: Psn,
        log_head_lsn: Lsn,
    },
    CompleteCheckpoint {
        header: RecordHeader,
        log_head_psn: Psn,
    },
    TruncateHead {
        header: RecordHeader,
        head_record_psn: Psn,
        new_head_lsn: Lsn,
        truncation_state: TruncationState,
    },
    TruncateTail {
        header: RecordHeader,
        target_tail_lsn: Lsn,
    },
    Backup {
        header: RecordHeader,
        backup_id: u64,
        parent_backup_id: u64,
        starting_epoch: Epoch,
        starting_lsn: Lsn,
        ending_epoch: Epoch,
        ending_lsn: Lsn,
    },
    Information {
        header: RecordHeader,
        event: InformationEvent,
    },
}

impl LogRecord {
    pub fn header(&self) -> &RecordHeader {
        match self {
            LogRecord::Indexing { header, .. }
            | LogRecord::UpdateEpoch { header, .. }
            | LogRecord::Barrier { header }
            | LogRecord::BeginTransaction { header, .. }
            | LogRecord::Operation { header, .. }
            | LogRecord::EndTransaction { header, .. }
            | LogRecord::BeginCheckpoint { header, .. }
            | LogRecord::EndCheckpoint { header, .. }
            | LogRecord::CompleteCheckpoint { header, .. }
            | LogRecord::TruncateHead { header, .. }
            | LogRecord::TruncateTail { header, .. }
            | LogRecord::Backup { header, .. }
            | LogRecord::Information { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut RecordHeader {
        match self {
            LogRecord::Indexing { header, .. }
            | LogRecord::UpdateEpoch { header, .. }
            | LogRecord::Barrier { header }
            | LogRecord::BeginTransaction { header, .. }
            | LogRecord::Operation { header, .. }
            | LogRecord::EndTransaction { header, .. }
            | LogRecord::BeginCheckpoint { header, .. }
            | LogRecord::EndCheckpoint { header, .. }
            | LogRecord::CompleteCheckpoint { header, .. }
            | LogRecord::TruncateHead { header, .. }
            | LogRecord::TruncateTail { header, .. }
            | LogRecord::Backup { header, .. }
            | LogRecord::Information { header, .. } => header,
        }
    }

    pub fn lsn(&self) -> Lsn {
        self.header().lsn
    }

    pub fn psn(&self) -> Psn {
        self.header().psn
    }

    pub fn record_type(&self) -> RecordType {
        self.header().record_type
    }

    /// Transaction id for the record kinds that belong to a transaction.
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            LogRecord::BeginTransaction { txn_id, .. }
            | LogRecord::Operation { txn_id, .. }
            | LogRecord::EndTransaction { txn_id, .. } => Some(*txn_id),
            _ => None,
        }
    }
}

/// Serialize a record, bookended by a 4-byte length prefix and an identical
/// trailing length so a reader can seek backward (spec §4.1).
///
/// `as_physical` controls whether the Psn/position header fields are
/// serialized as-is (physical log storage) or scrubbed to the invalid
/// sentinel first (logical transmission to a copy target, which assigns its
/// own physical placement).
pub fn write_record(record: &LogRecord, as_physical: bool) -> Result<Vec<u8>> {
    let mut record = record.clone();
    if !as_physical {
        let header = record.header_mut();
        header.psn = INVALID_PSN;
        header.position = INVALID_POSITION;
    }

    let body = bincode::serialize(&record)?;
    let len = body.len() as u32;

    let mut framed = Vec::with_capacity(body.len() + 8);
    framed.write_all(&len.to_le_bytes())?;
    framed.write_all(&body)?;
    framed.write_all(&len.to_le_bytes())?;
    Ok(framed)
}

/// Inverse of [`write_record`]: strip the bookends and decode the body.
pub fn read_record(framed: &[u8]) -> Result<LogRecord> {
    if framed.len() < 8 {
        return Err(ReplicatorError::InvalidArgument(
            "framed record shorter than the 8-byte bookend overhead".into(),
        ));
    }
    let prefix_len = u32::from_le_bytes(framed[0..4].try_into().unwrap()) as usize;
    let suffix_len =
        u32::from_le_bytes(framed[framed.len() - 4..].try_into().unwrap()) as usize;
    if prefix_len != suffix_len {
        return Err(ReplicatorError::InvalidArgument(format!(
            "length prefix ({}) does not match trailing length ({})",
            prefix_len, suffix_len
        )));
    }
    if framed.len() != prefix_len + 8 {
        return Err(ReplicatorError::InvalidArgument(format!(
            "framed length {} does not match prefix-implied length {}",
            framed.len(),
            prefix_len + 8
        )));
    }
    let body = &framed[4..4 + prefix_len];
    let record: LogRecord = bincode::deserialize(body)?;
    Ok(record)
}

/// Read a record ending at byte offset `end_position` of `log`, walking
/// backward: the 4 bytes at `end_position - 4` give the trailing length `L`,
/// and the framed record occupies `[end_position - 8 - L, end_position)`.
///
/// Returns the decoded record and the byte offset where it starts.
pub fn read_record_backward(log: &[u8], end_position: usize) -> Result<(LogRecord, usize)> {
    if end_position < 8 || end_position > log.len() {
        return Err(ReplicatorError::InvalidArgument(
            "end_position out of range for backward read".into(),
        ));
    }
    let trailing_len =
        u32::from_le_bytes(log[end_position - 4..end_position].try_into().unwrap()) as usize;
    let start = end_position
        .checked_sub(8 + trailing_len)
        .ok_or_else(|| ReplicatorError::InvalidArgument("trailing length underflows log".into()))?;
    let record = read_record(&log[start..end_position])?;
    Ok((record, start))
}

/// `RecordLength = len(serialized_bytes) - 8` (the testable invariant of
/// spec §4.1).
pub fn record_length(framed: &[u8]) -> u32 {
    (framed.len() - 8) as u32
}
