//! Version manager: tracks which visibility LSNs are pinned by in-flight
//! readers so checkpoint/truncation never drops a version a reader still
//! needs (spec §4.12).
//!
//! The blocking-wait shape is `physical_writer.rs::FsyncState`'s
//! `Mutex`+`Condvar` pattern generalized from a single durable-PSN watermark
//! to a multiset of pinned vsns with per-call blocking sets.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::record::Lsn;

/// Registered visibility LSNs and their reference counts (duplicate
/// registrations of the same vsn require the same number of unregisters).
struct State {
    registered: BTreeMap<Lsn, u32>,
}

pub struct VersionManager {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Outcome of a removal attempt that could not complete immediately.
pub struct Blocked {
    pub blocking_vsns: Vec<Lsn>,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { registered: BTreeMap::new() }),
            condvar: Condvar::new(),
        }
    }

    /// `RegisterAsync()`: pin `vsn` (the log's current last-stable LSN).
    /// Registering the same vsn again increments its refcount.
    pub fn register(&self, vsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        *state.registered.entry(vsn).or_insert(0) += 1;
    }

    /// `UnRegister(vsn)`: decrement; at zero the entry is dropped and any
    /// waiter blocked on it is woken to re-check its blocking set.
    pub fn unregister(&self, vsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.registered.get_mut(&vsn) {
            *count -= 1;
            if *count == 0 {
                state.registered.remove(&vsn);
                drop(state);
                self.condvar.notify_all();
                return;
            }
        }
    }

    /// `TryRemoveVersion(sp_id, version, next_version)`: succeeds
    /// immediately if no registered vsn lies in `[version, next_version)`.
    /// `sp_id` identifies the caller for diagnostics only; the manager
    /// tracks vsns, not their owners.
    pub fn try_remove_version(&self, _sp_id: u64, version: Lsn, next_version: Lsn) -> Result<(), Blocked> {
        let state = self.state.lock().unwrap();
        let blocking: Vec<Lsn> = state.registered.range(version..next_version).map(|(v, _)| *v).collect();
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(Blocked { blocking_vsns: blocking })
        }
    }

    /// `TryRemoveCheckpointAsync(checkpoint_lsn, next_checkpoint_lsn)`:
    /// blocks until every vsn registered at or above `checkpoint_lsn` has
    /// been unregistered down to zero.
    ///
    /// Unlike `try_remove_version`, the blocking set here is not upper
    /// bounded by `next_checkpoint_lsn` — a reader that registered before
    /// the checkpoint and is still pinned past it must still be waited on,
    /// since the checkpoint is about to discard exactly the versions that
    /// reader might still need. `next_checkpoint_lsn` is accepted for
    /// parity with the operation's name but does not narrow the wait.
    pub fn try_remove_checkpoint(&self, checkpoint_lsn: Lsn, _next_checkpoint_lsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        while state.registered.range(checkpoint_lsn..).next().is_some() {
            state = self.condvar.wait(state).unwrap();
        }
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_remove_version_succeeds_when_range_is_clear() {
        let vm = VersionManager::new();
        vm.register(10);
        assert!(vm.try_remove_version(1, 20, 30).is_ok());
    }

    #[test]
    fn try_remove_version_reports_blockers_in_range() {
        let vm = VersionManager::new();
        vm.register(30);
        vm.register(40);
        let err = vm.try_remove_version(1, 25, 35).unwrap_err();
        assert_eq!(err.blocking_vsns, vec![30]);
    }

    #[test]
    fn duplicate_register_requires_matching_unregisters() {
        let vm = VersionManager::new();
        vm.register(30);
        vm.register(30);
        assert!(vm.try_remove_version(1, 30, 31).is_err());
        vm.unregister(30);
        assert!(vm.try_remove_version(1, 30, 31).is_err());
        vm.unregister(30);
        assert!(vm.try_remove_version(1, 30, 31).is_ok());
    }

    /// S7: Register 30, 40, 50; TryRemoveCheckpoint(15, 35) blocks on all
    /// three (all ≥ 15), not just the one inside [15, 35).
    #[test]
    fn try_remove_checkpoint_waits_for_every_vsn_at_or_above_the_checkpoint() {
        let vm = Arc::new(VersionManager::new());
        vm.register(30);
        vm.register(40);
        vm.register(50);

        let waiter = Arc::clone(&vm);
        let handle = thread::spawn(move || {
            waiter.try_remove_checkpoint(15, 35);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        vm.unregister(30);
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        vm.unregister(40);
        vm.unregister(50);
        handle.join().unwrap();
    }
}
