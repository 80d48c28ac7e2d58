//! Backup folder analysis: validate a set of backup metadata files and
//! reduce them to the linear chain that restore actually replays (spec
//! §4.11).
//!
//! The entries form a tree keyed by `parent_backup_id` (zero for a `Full`).
//! Exactly one `Full` is allowed per folder; every `Incremental` must chain
//! to an ancestor eventually rooted at that `Full`; and `starting_epoch`
//! must be non-decreasing along the chain. Divergent incrementals sharing a
//! parent are tolerated as long as at most one of them grows a chain of its
//! own — a dead-end sibling is trimmed, but two siblings both growing
//! deeper is a genuine fork analysis cannot resolve on its own.

use std::collections::HashMap;

use crate::backup::metadata_file::{BackupMetadata, BackupOption};
use crate::error::{ReplicatorError, Result};

/// The validated, restore-ordered chain: index 0 is the `Full`, each
/// following entry is the `Incremental` built directly on the previous one.
pub fn analyze(entries: Vec<BackupMetadata>) -> Result<Vec<BackupMetadata>> {
    if entries.is_empty() {
        return Err(ReplicatorError::MissingFullBackup);
    }

    let mut fulls: Vec<&BackupMetadata> = entries.iter().filter(|e| e.backup_option == BackupOption::Full).collect();
    if fulls.is_empty() {
        return Err(ReplicatorError::MissingFullBackup);
    }
    if fulls.len() > 1 {
        return Err(ReplicatorError::InvalidOperation(
            "backup folder contains more than one full backup".into(),
        ));
    }
    let full = fulls.remove(0).clone();

    let known_ids: std::collections::HashSet<u128> = entries.iter().map(|e| e.backup_id).collect();
    let mut children_by_parent: HashMap<u128, Vec<&BackupMetadata>> = HashMap::new();
    for e in &entries {
        if e.backup_option == BackupOption::Incremental {
            if !known_ids.contains(&e.parent_backup_id) {
                return Err(ReplicatorError::InvalidParameter(format!(
                    "backup {} names an absent parent {}",
                    e.backup_id, e.parent_backup_id
                )));
            }
            children_by_parent.entry(e.parent_backup_id).or_default().push(e);
        }
    }

    let mut chain = vec![full.clone()];
    let mut cursor = full.backup_id;
    loop {
        let kids = match children_by_parent.get(&cursor) {
            Some(kids) if !kids.is_empty() => kids,
            _ => break,
        };

        let deep: Vec<&&BackupMetadata> = kids
            .iter()
            .filter(|k| children_by_parent.get(&k.backup_id).map_or(false, |gc| !gc.is_empty()))
            .collect();
        if deep.len() > 1 {
            return Err(ReplicatorError::InvalidParameter(format!(
                "backup {} has more than one branch growing past it — forked chain",
                cursor
            )));
        }

        let chosen: &BackupMetadata = if let Some(only_deep) = deep.first() {
            only_deep
        } else {
            kids.iter().max_by_key(|k| (k.backup_epoch, k.backup_lsn)).unwrap()
        };

        let prior = chain.last().unwrap();
        if chosen.starting_epoch.data_loss_version < prior.starting_epoch.data_loss_version {
            return Err(ReplicatorError::InvalidParameter(format!(
                "backup {} regresses data-loss version versus its parent {}",
                chosen.backup_id, prior.backup_id
            )));
        }
        if chosen.backup_epoch < prior.backup_epoch
            || (chosen.backup_epoch == prior.backup_epoch && chosen.backup_lsn <= prior.backup_lsn)
        {
            return Err(ReplicatorError::InvalidParameter(format!(
                "backup {} does not advance past its parent {}",
                chosen.backup_id, prior.backup_id
            )));
        }

        chain.push(chosen.clone());
        cursor = chosen.backup_id;
    }

    Ok(chain)
}
