//! The progress vector: the ordered history of configuration epochs this
//! replica has lived through (spec §3.4, §4.9).
//!
//! Stored inline in every `BeginCheckpoint` record (`record.rs`) and
//! compared between the primary and an idle/copy target during build to
//! find the LSN at which their histories diverge — the trigger for
//! choosing the false-progress truncate-tail path over a plain partial
//! copy. Modeled as a plain `Vec` with validated insertion rather than a
//! `BTreeMap`, since entries are only ever appended and only ever walked in
//! order, matching the teacher's preference for the simplest structure
//! that satisfies the access pattern (`engines/granite/manager.rs`'s
//! `active_txns`/`committed_txns` split is the same style: pick the
//! concrete collection the read pattern needs, not a generic one).

use crate::error::{ReplicatorError, Result};
use crate::record::{Epoch, Lsn, ProgressVectorEntry, ReplicaId};

/// A replica's epoch history, starting from `Epoch::ZERO` at Lsn 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressVector {
    entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
    pub fn new(replica_id: ReplicaId, timestamp_millis: u64) -> Self {
        Self {
            entries: vec![ProgressVectorEntry {
                epoch: Epoch::ZERO,
                starting_lsn: 0,
                replica_id,
                timestamp_millis,
            }],
        }
    }

    pub fn from_entries(entries: Vec<ProgressVectorEntry>) -> Result<Self> {
        let vector = Self { entries };
        vector.validate()?;
        Ok(vector)
    }

    fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ReplicatorError::InvalidParameter(
                "progress vector must have at least one entry".into(),
            ));
        }
        for pair in self.entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.epoch <= prev.epoch {
                return Err(ReplicatorError::InvalidParameter(format!(
                    "progress vector epochs must strictly increase: {:?} then {:?}",
                    prev.epoch, next.epoch
                )));
            }
            if next.starting_lsn < prev.starting_lsn {
                return Err(ReplicatorError::InvalidParameter(
                    "progress vector starting_lsn must be non-decreasing".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[ProgressVectorEntry] {
        &self.entries
    }

    pub fn last(&self) -> &ProgressVectorEntry {
        self.entries.last().expect("progress vector is never empty")
    }

    /// Append a new epoch transition. `UpdateEpoch` records (`record.rs`)
    /// call this when a new primary takes over.
    pub fn append(&mut self, entry: ProgressVectorEntry) -> Result<()> {
        let last = self.last();
        if entry.epoch <= last.epoch {
            return Err(ReplicatorError::InvalidParameter(format!(
                "new epoch {:?} must exceed current epoch {:?}",
                entry.epoch, last.epoch
            )));
        }
        if entry.starting_lsn < last.starting_lsn {
            return Err(ReplicatorError::InvalidParameter(
                "new epoch cannot start before the previous epoch started".into(),
            ));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// The epoch active at `lsn`: the last entry whose `starting_lsn <= lsn`.
    pub fn epoch_at(&self, lsn: Lsn) -> Epoch {
        self.entries
            .iter()
            .rev()
            .find(|e| e.starting_lsn <= lsn)
            .map(|e| e.epoch)
            .unwrap_or(Epoch::ZERO)
    }

    /// Drop every entry whose epoch started after `lsn` (false-progress
    /// truncate-tail rewind, spec §4.10). The seed entry at Lsn 0 is never
    /// dropped.
    pub fn retain_up_to(&mut self, lsn: Lsn) {
        self.entries.retain(|e| e.starting_lsn <= lsn || e.starting_lsn == 0);
    }

    /// Find the lowest LSN at which `self` and `other` disagree about who
    /// owned which epoch. `None` means one vector is a prefix of the other
    /// (no divergence — a plain partial copy suffices). `Some(lsn)` means
    /// both vectors claim records past `lsn` that the other does not
    /// recognize, and the copy target's log from `lsn` onward must be
    /// discarded (the false-progress / truncate-tail path, spec §4.10).
    pub fn find_divergence(&self, other: &ProgressVector) -> Option<Lsn> {
        for (mine, theirs) in self.entries.iter().zip(other.entries.iter()) {
            if mine.epoch != theirs.epoch || mine.replica_id != theirs.replica_id {
                return Some(mine.starting_lsn.min(theirs.starting_lsn));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(n: u64) -> Epoch {
        Epoch {
            data_loss_version: 0,
            configuration_version: n,
        }
    }

    #[test]
    fn append_rejects_non_increasing_epoch() {
        let mut pv = ProgressVector::new(1, 0);
        let bad = ProgressVectorEntry {
            epoch: Epoch::ZERO,
            starting_lsn: 10,
            replica_id: 1,
            timestamp_millis: 0,
        };
        assert!(pv.append(bad).is_err());
    }

    #[test]
    fn epoch_at_finds_the_entry_active_for_an_lsn() {
        let mut pv = ProgressVector::new(1, 0);
        pv.append(ProgressVectorEntry {
            epoch: epoch(1),
            starting_lsn: 100,
            replica_id: 2,
            timestamp_millis: 10,
        })
        .unwrap();

        assert_eq!(pv.epoch_at(50), Epoch::ZERO);
        assert_eq!(pv.epoch_at(100), epoch(1));
        assert_eq!(pv.epoch_at(500), epoch(1));
    }

    #[test]
    fn identical_vectors_have_no_divergence() {
        let pv = ProgressVector::new(1, 0);
        assert_eq!(pv.find_divergence(&pv.clone()), None);
    }

    #[test]
    fn prefix_vector_has_no_divergence() {
        let short = ProgressVector::new(1, 0);
        let mut long = short.clone();
        long.append(ProgressVectorEntry {
            epoch: epoch(1),
            starting_lsn: 50,
            replica_id: 1,
            timestamp_millis: 0,
        })
        .unwrap();
        assert_eq!(short.find_divergence(&long), None);
    }

    #[test]
    fn retain_up_to_drops_epochs_started_after_the_cut() {
        let mut pv = ProgressVector::new(1, 0);
        pv.append(ProgressVectorEntry {
            epoch: epoch(1),
            starting_lsn: 100,
            replica_id: 1,
            timestamp_millis: 0,
        })
        .unwrap();
        pv.append(ProgressVectorEntry {
            epoch: epoch(2),
            starting_lsn: 200,
            replica_id: 1,
            timestamp_millis: 0,
        })
        .unwrap();

        pv.retain_up_to(150);
        assert_eq!(pv.entries().len(), 2);
        assert_eq!(pv.last().epoch, epoch(1));
    }

    #[test]
    fn diverging_replica_at_same_epoch_index_is_detected() {
        let mut a = ProgressVector::new(1, 0);
        a.append(ProgressVectorEntry {
            epoch: epoch(1),
            starting_lsn: 100,
            replica_id: 2,
            timestamp_millis: 0,
        })
        .unwrap();

        let mut b = ProgressVector::new(1, 0);
        b.append(ProgressVectorEntry {
            epoch: epoch(1),
            starting_lsn: 120,
            replica_id: 3,
            timestamp_millis: 0,
        })
        .unwrap();

        assert_eq!(a.find_divergence(&b), Some(100));
    }
}
