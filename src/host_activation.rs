//! Multi-code-package activation host: per-instance activation state
//! machine plus host-originated termination notification with
//! retry-on-timeout (spec §4.13).
//!
//! A stripped generalization of `MultiCodePackageApplicationHost`'s
//! activation table: it tracked one `(ActivationId, ComFabricRuntime)` pair
//! per `CodePackageInstanceId` and decided, synchronously, whether an
//! incoming `Activate` request was the current activation replaying
//! (idempotent), a race against an activation already in flight
//! (duplicate), evidence of a missed deactivation (a coding error in the
//! caller), or simply late (stale). This module keeps exactly that
//! decision table and drops the COM runtime bookkeeping, which belongs to
//! the out-of-scope host process.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{ReplicatorError, Result};

pub type CodePackageInstanceId = u64;
pub type ActivationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Activation request accepted, host-side activation not yet confirmed.
    Tentative,
    /// Host confirmed the code package is running.
    Valid,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    activation_id: ActivationId,
    state: EntryState,
}

/// Result of an `activate` call that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// No prior entry: the caller must activate inside the host, then call
    /// [`HostActivationTable::mark_valid`].
    BeginActivation,
    /// Same activation id, entry already `Valid`: reply success without
    /// redoing the work.
    AlreadyActive,
}

pub struct HostActivationTable {
    entries: Mutex<HashMap<CodePackageInstanceId, Entry>>,
}

impl HostActivationTable {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Boundary state table from spec §4.13.
    pub fn activate(&self, instance_id: CodePackageInstanceId, activation_id: ActivationId) -> Result<ActivateOutcome> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&instance_id) {
            None => {
                entries.insert(instance_id, Entry { activation_id, state: EntryState::Tentative });
                Ok(ActivateOutcome::BeginActivation)
            }
            Some(entry) if entry.activation_id == activation_id => match entry.state {
                EntryState::Valid => Ok(ActivateOutcome::AlreadyActive),
                EntryState::Tentative => Err(ReplicatorError::Cancelled),
            },
            Some(entry) if activation_id > entry.activation_id => Err(ReplicatorError::Fatal(format!(
                "activation {} for code package {} arrived without a deactivation of {}",
                activation_id, instance_id, entry.activation_id
            ))),
            Some(_) => Err(ReplicatorError::Cancelled),
        }
    }

    /// Host-side activation succeeded: flip the tentative entry to `Valid`.
    pub fn mark_valid(&self, instance_id: CodePackageInstanceId, activation_id: ActivationId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&instance_id) {
            Some(entry) if entry.activation_id == activation_id => {
                entry.state = EntryState::Valid;
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "no tentative activation {} for code package {}",
                activation_id, instance_id
            ))),
        }
    }

    /// `Deactivate` with a known `(instanceId, activationId)`: remove the
    /// entry. The caller still has to deactivate inside the host and reply.
    pub fn deactivate(&self, instance_id: CodePackageInstanceId, activation_id: ActivationId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&instance_id) {
            Some(entry) if entry.activation_id == activation_id => {
                entries.remove(&instance_id);
                Ok(())
            }
            _ => Err(ReplicatorError::InvalidOperation(format!(
                "no matching activation {} for code package {} to deactivate",
                activation_id, instance_id
            ))),
        }
    }

    /// Host-originated termination: remove whatever entry is present and
    /// return its activation id so the caller can build the termination
    /// notification. `None` if the host reports termination for an
    /// instance this table never tracked.
    pub fn on_host_terminated(&self, instance_id: CodePackageInstanceId) -> Option<ActivationId> {
        self.entries.lock().unwrap().remove(&instance_id).map(|e| e.activation_id)
    }
}

impl Default for HostActivationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends the termination notification to the external replicator/client.
/// Grounded on `Client.BeginRequest`/`EndRequest` in the original: the only
/// two outcomes that matter here are success and timeout.
pub trait TerminationNotifier {
    fn notify(&self, instance_id: CodePackageInstanceId, activation_id: ActivationId) -> Result<()>;
}

/// Send the termination notification, retrying only on `Timeout` — any
/// other error (including the notifier being gone) is final, matching the
/// original's `RetryIfNeeded`. Bounded by `max_attempts` since this engine
/// has no unbounded background retry loop to hand the request off to.
pub fn notify_termination_with_retry(
    notifier: &dyn TerminationNotifier,
    instance_id: CodePackageInstanceId,
    activation_id: ActivationId,
    max_attempts: u32,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match notifier.notify(instance_id, activation_id) {
            Ok(()) => return Ok(()),
            Err(ReplicatorError::Timeout(_)) if attempts < max_attempts => continue,
            Err(e) => return Err(e),
        }
    }
}
