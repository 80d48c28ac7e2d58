//! Test-hook fault injection table (spec §5, "Fault utility (test hook
//! only)"), promoted from a passing mention in spec.md to a concrete module
//! because every other module's failure-path tests need it — checkpoint
//! `Prepare`/`Perform`/`Complete` failures (S4), recovery apply failures,
//! and copy-build aborts all inject through the same table.
//!
//! Grounded on `ApiFaultUtility.cpp/.h`: one mutex-guarded table keyed by
//! API name, consulted by every state-provider-facing call before it runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ReplicatorError, Result};

#[derive(Debug, Clone)]
pub enum FaultSpec {
    /// Sleep for the given duration, then proceed normally.
    Delay(Duration),
    /// Fail immediately with the given error.
    Fail(String),
    /// Sleep, then fail.
    DelayThenFail(Duration, String),
}

/// A single lock protecting the delay/fail table (spec §5).
#[derive(Default)]
pub struct FaultUtility {
    table: Mutex<HashMap<String, FaultSpec>>,
}

impl FaultUtility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, api: impl Into<String>, spec: FaultSpec) {
        self.table.lock().unwrap().insert(api.into(), spec);
    }

    pub fn clear_fault(&self, api: &str) {
        self.table.lock().unwrap().remove(api);
    }

    pub fn clear_all(&self) {
        self.table.lock().unwrap().clear();
    }

    /// Every state-provider-facing API calls this before running. Blocks
    /// for a configured delay and/or returns the configured error.
    pub fn check(&self, api: &str) -> Result<()> {
        let spec = self.table.lock().unwrap().get(api).cloned();
        match spec {
            None => Ok(()),
            Some(FaultSpec::Delay(d)) => {
                std::thread::sleep(d);
                Ok(())
            }
            Some(FaultSpec::Fail(msg)) => Err(ReplicatorError::Fatal(msg)),
            Some(FaultSpec::DelayThenFail(d, msg)) => {
                std::thread::sleep(d);
                Err(ReplicatorError::Fatal(msg))
            }
        }
    }
}
