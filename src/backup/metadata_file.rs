//! Backup metadata file: fixed byte layout + length-prefix + content-hash
//! footer (spec §4.11/§6.2).
//!
//! Shaped after `other_examples/..backup-cli..mod.rs`'s `GlobalBackupOpt` —
//! a flat struct of backup-identifying fields read from/written to a single
//! small file per backup. The corruption check uses a CRC32C checksum
//! rather than a cryptographic hash: the spec only calls for a
//! size/corruption check, not tamper-evidence, and `std::hash::DefaultHasher`
//! gives no cross-version/cross-platform stability guarantee, which a file
//! written by one build and read back by another needs.

use std::fs;
use std::path::Path;

use crc32c::crc32c;

use crate::error::{ReplicatorError, Result};
use crate::record::{Epoch, Lsn, ReplicaId};

pub const MAGIC: [u8; 4] = *b"FBKM";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOption {
    Full,
    Incremental,
}

impl BackupOption {
    fn to_u32(self) -> u32 {
        match self {
            BackupOption::Full => 0,
            BackupOption::Incremental => 1,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(BackupOption::Full),
            1 => Ok(BackupOption::Incremental),
            other => Err(ReplicatorError::InvalidArgument(format!(
                "unrecognized backup option tag {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMetadata {
    pub backup_option: BackupOption,
    pub backup_id: u128,
    /// `0` for a `Full` backup (no parent).
    pub parent_backup_id: u128,
    pub partition_id: u128,
    pub replica_id: ReplicaId,
    pub starting_epoch: Epoch,
    pub starting_lsn: Lsn,
    pub backup_epoch: Epoch,
    pub backup_lsn: Lsn,
}

/// Serialize to the on-disk byte layout: `[4B len][body][8B hash]`.
pub fn write(meta: &BackupMetadata) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + 4 + 4 + 16 * 3 + 8 + 16 + 8 + 16 + 8);
    body.extend_from_slice(&MAGIC);
    body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    body.extend_from_slice(&meta.backup_option.to_u32().to_le_bytes());
    body.extend_from_slice(&meta.backup_id.to_le_bytes());
    body.extend_from_slice(&meta.parent_backup_id.to_le_bytes());
    body.extend_from_slice(&meta.partition_id.to_le_bytes());
    body.extend_from_slice(&meta.replica_id.to_le_bytes());
    body.extend_from_slice(&meta.starting_epoch.data_loss_version.to_le_bytes());
    body.extend_from_slice(&meta.starting_epoch.configuration_version.to_le_bytes());
    body.extend_from_slice(&meta.starting_lsn.to_le_bytes());
    body.extend_from_slice(&meta.backup_epoch.data_loss_version.to_le_bytes());
    body.extend_from_slice(&meta.backup_epoch.configuration_version.to_le_bytes());
    body.extend_from_slice(&meta.backup_lsn.to_le_bytes());

    let hash = crc32c(&body);

    let mut framed = Vec::with_capacity(4 + body.len() + 4);
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed.extend_from_slice(&hash.to_le_bytes());
    framed
}

/// Inverse of [`write`]: verifies length and hash before parsing fields.
pub fn read(bytes: &[u8]) -> Result<BackupMetadata> {
    if bytes.len() < 4 {
        return Err(ReplicatorError::InvalidArgument(
            "backup metadata file shorter than its length prefix".into(),
        ));
    }
    let body_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() != 4 + body_len + 4 {
        return Err(ReplicatorError::InvalidArgument(
            "backup metadata file length does not match its prefix".into(),
        ));
    }
    let body = &bytes[4..4 + body_len];
    let stored_hash = u32::from_le_bytes(bytes[4 + body_len..4 + body_len + 4].try_into().unwrap());

    if crc32c(body) != stored_hash {
        return Err(ReplicatorError::InvalidArgument(
            "backup metadata file failed its content-hash check".into(),
        ));
    }

    let mut cursor = Cursor { bytes: body, pos: 0 };
    let magic: [u8; 4] = cursor.take_array()?;
    if magic != MAGIC {
        return Err(ReplicatorError::InvalidArgument("bad magic in backup metadata file".into()));
    }
    let _version = cursor.take_u32()?;
    let backup_option = BackupOption::from_u32(cursor.take_u32()?)?;
    let backup_id = cursor.take_u128()?;
    let parent_backup_id = cursor.take_u128()?;
    let partition_id = cursor.take_u128()?;
    let replica_id = cursor.take_u64()?;
    let starting_epoch = Epoch {
        data_loss_version: cursor.take_u64()?,
        configuration_version: cursor.take_u64()?,
    };
    let starting_lsn = cursor.take_u64()?;
    let backup_epoch = Epoch {
        data_loss_version: cursor.take_u64()?,
        configuration_version: cursor.take_u64()?,
    };
    let backup_lsn = cursor.take_u64()?;

    Ok(BackupMetadata {
        backup_option,
        backup_id,
        parent_backup_id,
        partition_id,
        replica_id,
        starting_epoch,
        starting_lsn,
        backup_epoch,
        backup_lsn,
    })
}

pub fn write_to_file(path: impl AsRef<Path>, meta: &BackupMetadata) -> Result<()> {
    fs::write(path, write(meta))?;
    Ok(())
}

pub fn read_from_file(path: impl AsRef<Path>) -> Result<BackupMetadata> {
    let bytes = fs::read(path)?;
    read(&bytes)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or_else(|| ReplicatorError::InvalidArgument("backup metadata body too short".into()))?;
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    fn take_u128(&mut self) -> Result<u128> {
        Ok(u128::from_le_bytes(self.take_array()?))
    }
}
