//! Configuration recognized by the replicator (spec §6.4).
//!
//! A plain struct; no dynamic named-parameter magic, matching the teacher's
//! `GraniteConfig`/`SandstoneConfig` preset style.

/// Which `RecordDispatcher` strategy the engine's live operation and
/// recovery replay dispatch records through (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One drainer, strictly in order. Lowest overhead, no concurrency.
    Serial,
    /// Contiguous transactions between barriers fan out onto their own
    /// threads. Pays thread-spawn overhead per group for concurrent apply.
    Parallel,
}

/// Tunables for checkpointing, truncation, throttling and copy batching.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Byte-threshold to trigger a checkpoint between barriers.
    pub checkpoint_threshold_bytes: u64,
    /// Lower bound on log retention.
    pub min_log_size_bytes: u64,
    /// Upper bound before throttling inserts.
    pub max_stream_size_bytes: u64,
    /// Head truncation is allowed once log size >= factor * min_log_size.
    pub truncation_threshold_factor: f64,
    /// Further inserts are rejected once log size >= factor * min_log_size.
    pub throttling_threshold_factor: f64,
    /// Periodic checkpoint/truncation interval. `None` disables the timer.
    pub log_truncation_interval: Option<std::time::Duration>,
    /// Batch threshold for the copy stream (`0` = no batching).
    pub copy_batch_size_bytes: u64,
    /// Hint to the logical-log implementation to optimize for disk usage
    /// over write latency.
    pub optimize_log_for_lower_disk_usage: bool,
    /// Minimum bytes a head truncation must reclaim before it proceeds,
    /// unless the periodic-truncation interval has elapsed.
    pub min_truncation_bytes: u64,
    /// Serial or parallel records-dispatcher strategy for both live
    /// operation and recovery replay.
    pub dispatch_mode: DispatchMode,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            checkpoint_threshold_bytes: 64 * 1024 * 1024,
            min_log_size_bytes: 256 * 1024 * 1024,
            max_stream_size_bytes: 4 * 1024 * 1024 * 1024,
            truncation_threshold_factor: 1.5,
            throttling_threshold_factor: 3.0,
            log_truncation_interval: Some(std::time::Duration::from_secs(300)),
            copy_batch_size_bytes: 64 * 1024,
            optimize_log_for_lower_disk_usage: false,
            min_truncation_bytes: 4 * 1024 * 1024,
            dispatch_mode: DispatchMode::Serial,
        }
    }
}

impl ReplicatorConfig {
    /// Checkpoint/truncate aggressively: small thresholds, short interval.
    /// Good for tests that want to observe checkpoint/truncation behavior
    /// without writing megabytes of log first.
    pub fn aggressive_truncation() -> Self {
        Self {
            checkpoint_threshold_bytes: 4 * 1024,
            min_log_size_bytes: 16 * 1024,
            truncation_threshold_factor: 1.1,
            log_truncation_interval: Some(std::time::Duration::from_secs(5)),
            min_truncation_bytes: 256,
            ..Default::default()
        }
    }

    /// Aggressive truncation plus the parallel dispatcher, for tests that
    /// want to exercise concurrent per-transaction apply.
    pub fn aggressive_truncation_parallel() -> Self {
        Self {
            dispatch_mode: DispatchMode::Parallel,
            ..Self::aggressive_truncation()
        }
    }

    /// Conservative: large thresholds, periodic timer disabled, truncation
    /// only happens when explicitly requested.
    pub fn conservative() -> Self {
        Self {
            checkpoint_threshold_bytes: 512 * 1024 * 1024,
            min_log_size_bytes: 1024 * 1024 * 1024,
            log_truncation_interval: None,
            ..Default::default()
        }
    }
}
