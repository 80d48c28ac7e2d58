//! Opens a replicator's data directory, runs recovery, and prints where it
//! landed — the example-binary analogue of the teacher's argument parsing
//! and `env_logger` init, scoped to one read-only operation instead of a
//! long-lived server.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use txnlog::config::ReplicatorConfig;
use txnlog::operation_processor::{ApplyContext, StateProvider};
use txnlog::record::{Lsn, TxnId};
use txnlog::replicated_log_manager::NullReplicator;
use txnlog::Replicator;

/// Logs what recovery would have applied instead of touching real state.
struct LoggingStateProvider;

impl StateProvider for LoggingStateProvider {
    fn apply(
        &self,
        txn_id: TxnId,
        lsn: Lsn,
        _metadata: &[u8],
        _redo: Option<&[u8]>,
        context: ApplyContext,
    ) -> txnlog::error::Result<()> {
        info!("apply txn={txn_id} lsn={lsn} context={context:?}");
        Ok(())
    }

    fn unlock(&self, txn_id: TxnId, _metadata: &[u8], _undo: Option<&[u8]>) -> txnlog::error::Result<()> {
        info!("unlock txn={txn_id}");
        Ok(())
    }

    fn checkpoint(&self) -> txnlog::error::Result<()> {
        Ok(())
    }

    fn complete_checkpoint(&self) -> txnlog::error::Result<()> {
        Ok(())
    }
}

fn print_usage() {
    println!("replay-tool - open a replicator log directory and report recovery state");
    println!();
    println!("Usage: replay-tool [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR    Data directory (default: ./data)");
    println!("  -r, --replica-id ID   Replica id (default: 1)");
    println!("  -h, --help            Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut data_dir = PathBuf::from("./data");
    let mut replica_id: u64 = 1;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--replica-id" | "-r" => {
                if i + 1 < args.len() {
                    replica_id = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("opening replicator log at {}", data_dir.display());

    let replicator = Replicator::open(
        &data_dir,
        replica_id,
        0,
        ReplicatorConfig::default(),
        Arc::new(LoggingStateProvider),
        Arc::new(NullReplicator),
    )?;

    println!("tail_lsn:         {}", replicator.tail_lsn());
    println!("tail_epoch:       {:?}", replicator.tail_epoch());
    println!("last_stable_lsn:  {}", replicator.last_stable_lsn());

    replicator.close()?;
    Ok(())
}
