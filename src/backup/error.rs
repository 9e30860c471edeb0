use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::restore::RestoreState;
use crate::db::dataset::IntegrityIssue;
use crate::AppError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_ROLLED_BACK: i32 = 3;
pub const EXIT_PARTIAL_RESTORE: i32 = 4;
pub const EXIT_IN_PROGRESS: i32 = 5;
pub const EXIT_RETENTION_INCOMPLETE: i32 = 6;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("archive not found: {}", .path.display())]
    ArchiveMissing { path: PathBuf },
    #[error("failed to write archive {}: {reason}", .path.display())]
    ArchiveWrite { path: PathBuf, reason: String },
    #[error("archive {} is corrupt: {reason}", .path.display())]
    ArchiveCorrupt { path: PathBuf, reason: String },
    #[error("archive {} has a missing or unreadable manifest: {reason}", .path.display())]
    ArchiveManifest { path: PathBuf, reason: String },
    #[error("archive format version {found} is newer than supported version {supported}")]
    ArchiveVersion { found: u32, supported: u32 },
    #[error("archive format version {found} is outside the importable range {min}..={max}")]
    IncompatibleVersion { found: u32, min: u32, max: u32 },
    #[error("archive schema version {archive} does not match live schema version {live}")]
    SchemaMismatch { archive: i64, live: i64 },
    #[error("archive data failed integrity validation: {0}")]
    DataIntegrity(#[from] IntegrityIssue),
    #[error("retention keep count must be at least 1 (got {0})")]
    InvalidRetention(i64),
    #[error("invalid archive file name {0:?}")]
    InvalidFileName(String),
    #[error("another backup is in progress in {}", .dir.display())]
    BackupInProgress { dir: PathBuf },
    #[error("restore rolled back during {stage}: {reason}")]
    RestoreRolledBack { stage: RestoreState, reason: String },
    #[error("partial restore: data was replaced but media was not ({reason}); operator attention required")]
    PartialRestore { reason: String },
    #[error("data store failure: {0}")]
    Store(#[from] AppError),
    #[error("{operation} failed for {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BackupError::ArchiveMissing { .. } => "BACKUP/ARCHIVE_MISSING",
            BackupError::ArchiveWrite { .. } => "BACKUP/ARCHIVE_WRITE",
            BackupError::ArchiveCorrupt { .. } => "BACKUP/ARCHIVE_CORRUPT",
            BackupError::ArchiveManifest { .. } => "BACKUP/ARCHIVE_MANIFEST",
            BackupError::ArchiveVersion { .. } => "BACKUP/ARCHIVE_VERSION",
            BackupError::IncompatibleVersion { .. } => "BACKUP/INCOMPATIBLE_VERSION",
            BackupError::SchemaMismatch { .. } => "BACKUP/SCHEMA_MISMATCH",
            BackupError::DataIntegrity(_) => "BACKUP/DATA_INTEGRITY",
            BackupError::InvalidRetention(_) => "BACKUP/INVALID_RETENTION",
            BackupError::InvalidFileName(_) => "BACKUP/INVALID_FILE_NAME",
            BackupError::BackupInProgress { .. } => "BACKUP/IN_PROGRESS",
            BackupError::RestoreRolledBack { .. } => "BACKUP/RESTORE_ROLLED_BACK",
            BackupError::PartialRestore { .. } => "BACKUP/PARTIAL_RESTORE",
            BackupError::Store(_) => "BACKUP/STORE",
            BackupError::Io { .. } => "BACKUP/IO",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::ArchiveMissing { .. }
            | BackupError::ArchiveCorrupt { .. }
            | BackupError::ArchiveManifest { .. }
            | BackupError::ArchiveVersion { .. }
            | BackupError::IncompatibleVersion { .. }
            | BackupError::SchemaMismatch { .. }
            | BackupError::DataIntegrity(_)
            | BackupError::InvalidRetention(_)
            | BackupError::InvalidFileName(_) => EXIT_VALIDATION,
            BackupError::RestoreRolledBack { .. } => EXIT_ROLLED_BACK,
            BackupError::PartialRestore { .. } => EXIT_PARTIAL_RESTORE,
            BackupError::BackupInProgress { .. } => EXIT_IN_PROGRESS,
            BackupError::ArchiveWrite { .. } | BackupError::Store(_) | BackupError::Io { .. } => {
                EXIT_FAILURE
            }
        }
    }

    /// True when the failure happened before anything live was touched.
    pub fn is_validation(&self) -> bool {
        self.exit_code() == EXIT_VALIDATION
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        let message = err.to_string();
        let code = err.code();
        match err {
            BackupError::Store(inner) => AppError::new(code, message).with_cause(inner),
            BackupError::ArchiveMissing { path }
            | BackupError::ArchiveWrite { path, .. }
            | BackupError::ArchiveCorrupt { path, .. }
            | BackupError::ArchiveManifest { path, .. } => {
                AppError::new(code, message).with_context("path", path.display().to_string())
            }
            BackupError::Io {
                operation,
                path,
                source,
            } => AppError::new(code, message)
                .with_context("operation", operation)
                .with_context("path", path.display().to_string())
                .with_cause(source),
            BackupError::RestoreRolledBack { stage, .. } => {
                AppError::new(code, message).with_context("stage", stage.to_string())
            }
            _ => AppError::new(code, message),
        }
    }
}
