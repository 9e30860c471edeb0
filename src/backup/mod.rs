//! Snapshot archives of the live store and media tree.
//!
//! An archive is a zip container holding `manifest.json` (stored, so it can be
//! read without inflating anything else), `database.json` (the full dataset)
//! and a `media/` tree mirroring the media root. Archives are written to a
//! hidden `.partial` file and renamed into place once complete.

pub mod archive;
pub mod error;
pub mod export;
pub mod lock;
pub mod manifest;
pub mod restore;
pub mod retention;

pub use archive::{read_manifest, ArchiveReader, ARCHIVE_EXTENSION};
pub use error::BackupError;
pub use export::{create_backup, create_backup_and_prune, BackupEntry, BackupOptions, BackupRun};
pub use manifest::{BackupManifest, FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION};
pub use restore::{
    restore_backup, RestoreHook, RestoreHooks, RestoreOptions, RestoreReport, RestoreState,
};
pub use retention::{
    apply_retention, apply_retention_with, list_backups, RemoveHook, RetentionFailure,
    RetentionHooks, RetentionReport,
};
