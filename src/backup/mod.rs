//! Backup support: metadata file format, folder-chain analysis, and the
//! thin manager that ties a checkpoint to a metadata write (spec §4.11,
//! §2 item 13).

pub mod folder_analyzer;
pub mod manager;
pub mod metadata_file;
