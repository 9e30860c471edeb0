use std::cmp::Reverse;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::archive::{is_archive_name, read_created_at, read_manifest};
use super::export::BackupEntry;
use super::BackupError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Per-file outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub retained: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<RetentionFailure>,
    /// Archives whose manifest could not be read; ranked oldest.
    pub unreadable: Vec<PathBuf>,
}

impl RetentionReport {
    /// False when at least one deletion failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

const FAKE_DELETE_FAILURE_ENV: &str = "DATAKULT_RETENTION_FAKE_DELETE_FAILURE";

pub type RemoveHook = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct RetentionHooks {
    /// Runs before each deletion. An error is recorded as a failed deletion
    /// and the file is left in place.
    pub before_remove: Option<RemoveHook>,
}

impl RetentionHooks {
    /// `DATAKULT_RETENTION_FAKE_DELETE_FAILURE=<file name>` refuses to delete
    /// that archive.
    pub fn from_env() -> Self {
        let Ok(target) = env::var(FAKE_DELETE_FAILURE_ENV) else {
            return Self::default();
        };
        let hook: RemoveHook = Arc::new(move |path: &Path| {
            if path.file_name().is_some_and(|name| name.to_string_lossy() == target) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "deletion refused by DATAKULT_RETENTION_FAKE_DELETE_FAILURE",
                ));
            }
            Ok(())
        });
        Self {
            before_remove: Some(hook),
        }
    }
}

fn remove_archive(path: &Path, hooks: &RetentionHooks) -> io::Result<()> {
    if let Some(hook) = hooks.before_remove.as_ref() {
        hook(path)?;
    }
    fs::remove_file(path)
}

struct Candidate {
    path: PathBuf,
    name: String,
    created_at: Option<DateTime<Utc>>,
}

fn archive_files(dir: &Path) -> Result<Vec<(PathBuf, String)>, BackupError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BackupError::io("read_backup_dir", dir, err)),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target: "datakult",
                    event = "backup_dir_entry_skipped",
                    error = %err
                );
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_archive_name(&name) {
            continue;
        }
        if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            out.push((entry.path(), name));
        }
    }
    Ok(out)
}

/// Ranking timestamp of one archive. Archives from a newer format keep
/// their `createdAt`; only corrupt containers and broken manifests rank as
/// unreadable.
fn archive_created_at(path: &Path) -> Result<DateTime<Utc>, BackupError> {
    match read_manifest(path) {
        Ok(manifest) => Ok(manifest.created_at),
        Err(BackupError::ArchiveVersion { found, .. }) => {
            let created_at = read_created_at(path)?;
            tracing::info!(
                target: "datakult",
                event = "retention_newer_format",
                path = %path.display(),
                format_version = found,
                created_at = %created_at
            );
            Ok(created_at)
        }
        Err(err) => Err(err),
    }
}

/// Keep the `keep` newest archives in `dir` by manifest timestamp and
/// delete the rest.
///
/// Filesystem timestamps are never consulted. Deletion is per file: a
/// failure is recorded in the report and the pass carries on.
pub fn apply_retention(dir: &Path, keep: i64) -> Result<RetentionReport, BackupError> {
    apply_retention_with(dir, keep, &RetentionHooks::from_env())
}

pub fn apply_retention_with(
    dir: &Path,
    keep: i64,
    hooks: &RetentionHooks,
) -> Result<RetentionReport, BackupError> {
    if keep < 1 {
        return Err(BackupError::InvalidRetention(keep));
    }

    let mut report = RetentionReport::default();
    let mut candidates: Vec<Candidate> = archive_files(dir)?
        .into_iter()
        .map(|(path, name)| {
            let created_at = match archive_created_at(&path) {
                Ok(created_at) => Some(created_at),
                Err(err) => {
                    tracing::warn!(
                        target: "datakult",
                        event = "retention_manifest_unreadable",
                        path = %path.display(),
                        error = %err,
                        "archive manifest unreadable; ranking it oldest"
                    );
                    report.unreadable.push(path.clone());
                    None
                }
            };
            Candidate {
                path,
                name,
                created_at,
            }
        })
        .collect();

    // Newest first; unreadable manifests sort last. Names break ties.
    candidates.sort_by_key(|candidate| Reverse((candidate.created_at, candidate.name.clone())));

    let keep = usize::try_from(keep).unwrap_or(usize::MAX);
    for (rank, candidate) in candidates.into_iter().enumerate() {
        if rank < keep {
            report.retained.push(candidate.path);
            continue;
        }
        match remove_archive(&candidate.path, hooks) {
            Ok(()) => {
                tracing::info!(
                    target: "datakult",
                    event = "retention_deleted",
                    path = %candidate.path.display()
                );
                report.deleted.push(candidate.path);
            }
            Err(err) => {
                tracing::warn!(
                    target: "datakult",
                    event = "retention_delete_failed",
                    path = %candidate.path.display(),
                    error = %err
                );
                report.failed.push(RetentionFailure {
                    path: candidate.path,
                    error: err.to_string(),
                });
            }
        }
    }

    tracing::info!(
        target: "datakult",
        event = "retention_applied",
        dir = %dir.display(),
        retained = report.retained.len(),
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        unreadable = report.unreadable.len()
    );
    Ok(report)
}

/// Readable archives in `dir`, newest first.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupEntry>, BackupError> {
    let mut entries = Vec::new();
    for (path, _) in archive_files(dir)? {
        match read_manifest(&path) {
            Ok(manifest) => {
                let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
                entries.push(BackupEntry::new(path, manifest, size));
            }
            Err(err) => {
                tracing::warn!(
                    target: "datakult",
                    event = "backup_list_skipped",
                    path = %path.display(),
                    error = %err
                );
            }
        }
    }
    entries.sort_by(|a, b| {
        (b.manifest.created_at, &b.file_name).cmp(&(a.manifest.created_at, &a.file_name))
    });
    Ok(entries)
}
