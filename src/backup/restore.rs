use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task;

use super::archive::ArchiveReader;
use super::lock::{DirLock, LiveStateLock};
use super::manifest::{BackupManifest, FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION};
use super::BackupError;
use crate::config::Settings;
use crate::db::dataset::{write_dataset, DataExport};
use crate::db::schema_version;
use crate::media::swap::swap_directory;
use crate::media::{sibling_temp_dir, TempDirGuard};
use crate::{AppError, AppResult};

pub type RestoreHook = Arc<dyn Fn() -> AppResult<()> + Send + Sync + 'static>;

/// Failure injection points inside the commit window.
#[derive(Clone, Default)]
pub struct RestoreHooks {
    /// Runs after the dataset is written, before the transaction commits.
    pub before_commit: Option<RestoreHook>,
    /// Runs after the data commit, before the media directories are swapped.
    pub before_media_swap: Option<RestoreHook>,
}

#[derive(Clone)]
pub struct RestoreOptions {
    pub backup_dir: PathBuf,
    pub media_root: PathBuf,
    /// When false only the structured data is replaced.
    pub restore_media: bool,
    pub hooks: RestoreHooks,
}

impl RestoreOptions {
    pub fn new(backup_dir: impl Into<PathBuf>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            media_root: media_root.into(),
            restore_media: true,
            hooks: RestoreHooks::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.backup_dir, &settings.media_root)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Validating,
    Staging,
    Committing,
    Complete,
    RolledBack,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreState::Validating => "validating",
            RestoreState::Staging => "staging",
            RestoreState::Committing => "committing",
            RestoreState::Complete => "complete",
            RestoreState::RolledBack => "rolled_back",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub manifest: BackupManifest,
    pub state: RestoreState,
    pub records_restored: u64,
    pub media_files_restored: u64,
    pub media_swapped: bool,
}

fn log_state(archive: &Path, state: RestoreState) {
    tracing::info!(
        target: "datakult",
        event = "restore_stage",
        archive = %archive.display(),
        stage = %state
    );
}

fn rolled_back(archive: &Path, stage: RestoreState, reason: String) -> BackupError {
    tracing::warn!(
        target: "datakult",
        event = "restore_rolled_back",
        archive = %archive.display(),
        stage = %stage,
        reason = %reason
    );
    BackupError::RestoreRolledBack { stage, reason }
}

fn task_error(err: task::JoinError) -> AppError {
    AppError::new("BACKUP/TASK", "Restore task panicked").with_context("error", err.to_string())
}

/// Translate codec version errors into the importer's range error.
fn check_format_version(err: BackupError) -> BackupError {
    match err {
        BackupError::ArchiveVersion { found, .. } => BackupError::IncompatibleVersion {
            found,
            min: MIN_SUPPORTED_FORMAT_VERSION,
            max: FORMAT_VERSION,
        },
        other => other,
    }
}

fn open_and_read(path: &Path) -> Result<(ArchiveReader, Vec<u8>), BackupError> {
    let mut reader = ArchiveReader::open(path).map_err(check_format_version)?;
    let found = reader.manifest().format_version;
    if !(MIN_SUPPORTED_FORMAT_VERSION..=FORMAT_VERSION).contains(&found) {
        return Err(BackupError::IncompatibleVersion {
            found,
            min: MIN_SUPPORTED_FORMAT_VERSION,
            max: FORMAT_VERSION,
        });
    }
    let bytes = reader.read_data_export()?;
    Ok((reader, bytes))
}

fn stage_media(reader: &mut ArchiveReader, staging: &Path) -> Result<u64, BackupError> {
    fs::create_dir_all(staging).map_err(|err| BackupError::io("create_staging", staging, err))?;
    let mut files = 0_u64;
    let mut entries = reader.media_entries();
    while let Some(entry) = entries.next_entry() {
        let mut entry = entry?;
        let target = staging.join(entry.relative_path());
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| BackupError::io("create_staged_dir", &target, err))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| BackupError::io("create_staged_dir", parent, err))?;
        }
        let mut out =
            File::create(&target).map_err(|err| BackupError::io("create_staged_file", &target, err))?;
        io::copy(&mut entry, &mut out)
            .map_err(|err| BackupError::io("extract_media_entry", &target, err))?;
        out.sync_all()
            .map_err(|err| BackupError::io("sync_staged_file", &target, err))?;
        files += 1;
    }
    Ok(files)
}

async fn commit_dataset(
    pool: &SqlitePool,
    data: &DataExport,
    before_commit: Option<&RestoreHook>,
) -> AppResult<u64> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "restore_begin"))?;

    let written = match write_dataset(&mut tx, data).await {
        Ok(count) => before_commit.map_or(Ok(()), |hook| hook()).map(|()| count),
        Err(err) => Err(err),
    };

    match written {
        Ok(count) => {
            tx.commit()
                .await
                .map_err(|err| AppError::from(err).with_context("operation", "restore_commit"))?;
            Ok(count)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(
                    target: "datakult",
                    event = "restore_rollback_failed",
                    error = %rollback
                );
            }
            Err(err)
        }
    }
}

/// Directories whose backup lock a restore of `archive` holds: the configured
/// backup directory and the archive's own directory, deduplicated and sorted
/// so concurrent restores acquire them in the same order.
fn commit_lock_dirs(backup_dir: &Path, archive: &Path) -> Vec<PathBuf> {
    let archive_dir = match archive.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut dirs: Vec<PathBuf> = [backup_dir.to_path_buf(), archive_dir]
        .into_iter()
        .map(|dir| fs::canonicalize(&dir).unwrap_or(dir))
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Replace the live store and media root with the contents of `archive`.
///
/// Validation and staging happen without any lock held and without touching
/// live state. The commit window takes the backup directory locks (the
/// configured directory and the archive's own) and the exclusive live-state
/// lock, replaces the dataset in one transaction, then
/// swaps the staged media directory in by rename. Only a failure after the
/// data commit yields `PartialRestore`.
pub async fn restore_backup(
    pool: &SqlitePool,
    archive: &Path,
    options: &RestoreOptions,
) -> Result<RestoreReport, BackupError> {
    log_state(archive, RestoreState::Validating);
    let path = archive.to_path_buf();
    let (mut reader, data_bytes) = task::spawn_blocking(move || open_and_read(&path))
        .await
        .map_err(task_error)??;
    let manifest = reader.manifest().clone();

    let data = DataExport::from_json_slice(&data_bytes).map_err(|err| {
        BackupError::ArchiveCorrupt {
            path: archive.to_path_buf(),
            reason: format!("data export is unreadable: {err}"),
        }
    })?;
    drop(data_bytes);
    data.validate()?;

    let live_schema = schema_version(pool).await?;
    if data.schema_version != live_schema || manifest.schema_version != live_schema {
        return Err(BackupError::SchemaMismatch {
            archive: data.schema_version,
            live: live_schema,
        });
    }

    if manifest.written_by_newer_app() {
        tracing::warn!(
            target: "datakult",
            event = "restore_newer_app_version",
            archive_app_version = %manifest.app_version,
            app_version = env!("CARGO_PKG_VERSION")
        );
    }
    if manifest.record_count != data.record_count() {
        tracing::warn!(
            target: "datakult",
            event = "restore_record_count_mismatch",
            manifest = manifest.record_count,
            actual = data.record_count()
        );
    }
    if options.restore_media {
        for cover in data.cover_paths() {
            if !reader.has_media_file(cover) {
                tracing::warn!(
                    target: "datakult",
                    event = "restore_cover_missing",
                    cover = %cover
                );
            }
        }
    }

    let staged = if options.restore_media {
        log_state(archive, RestoreState::Staging);
        let media_root = options.media_root.clone();
        let staged = task::spawn_blocking(move || -> Result<(TempDirGuard, u64), BackupError> {
            if let Some(parent) = media_root.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| BackupError::io("create_media_parent", parent, err))?;
            }
            let guard = TempDirGuard::new(sibling_temp_dir(&media_root, "staging"));
            let files = stage_media(&mut reader, guard.path())?;
            Ok((guard, files))
        })
        .await
        .map_err(task_error)?
        .map_err(|err| rolled_back(archive, RestoreState::Staging, err.to_string()))?;

        if staged.1 != manifest.media_file_count {
            tracing::warn!(
                target: "datakult",
                event = "restore_media_count_mismatch",
                manifest = manifest.media_file_count,
                actual = staged.1
            );
        }
        Some(staged)
    } else {
        None
    };

    log_state(archive, RestoreState::Committing);
    let lock_dirs = commit_lock_dirs(&options.backup_dir, archive);
    let media_root = options.media_root.clone();
    let (dir_locks, live_lock) = task::spawn_blocking(move || {
        let dir_locks = lock_dirs
            .iter()
            .map(|dir| DirLock::acquire(dir))
            .collect::<Result<Vec<_>, _>>()?;
        let live_lock = LiveStateLock::exclusive(&media_root)?;
        Ok::<_, BackupError>((dir_locks, live_lock))
    })
    .await
    .map_err(task_error)?
    .map_err(|err| rolled_back(archive, RestoreState::Committing, err.to_string()))?;

    let records_restored = commit_dataset(pool, &data, options.hooks.before_commit.as_ref())
        .await
        .map_err(|err| rolled_back(archive, RestoreState::Committing, err.to_string()))?;
    tracing::info!(
        target: "datakult",
        event = "restore_data_committed",
        records = records_restored
    );

    let mut media_files_restored = 0;
    let mut retired = None;
    if let Some((mut staging, files)) = staged {
        let swapped = options
            .hooks
            .before_media_swap
            .as_ref()
            .map_or(Ok(()), |hook| hook())
            .and_then(|()| {
                swap_directory(
                    &options.media_root,
                    staging.path(),
                    &sibling_temp_dir(&options.media_root, "retired"),
                )
            });
        match swapped {
            Ok(previous) => {
                staging.disarm();
                media_files_restored = files;
                retired = Some(previous);
            }
            Err(err) => {
                tracing::error!(
                    target: "datakult",
                    event = "restore_partial",
                    archive = %archive.display(),
                    media_root = %options.media_root.display(),
                    error = %err,
                    "data was restored but the media swap failed; live media is unchanged"
                );
                return Err(BackupError::PartialRestore {
                    reason: err.to_string(),
                });
            }
        }
    }
    drop(live_lock);
    drop(dir_locks);

    if let Some(Some(old)) = retired.clone() {
        let cleanup = task::spawn_blocking(move || fs::remove_dir_all(&old).map_err(|err| (old, err)))
            .await
            .map_err(task_error)?;
        if let Err((old, err)) = cleanup {
            tracing::warn!(
                target: "datakult",
                event = "restore_retired_cleanup_failed",
                path = %old.display(),
                error = %err
            );
        }
    }

    log_state(archive, RestoreState::Complete);
    Ok(RestoreReport {
        archive: archive.to_path_buf(),
        manifest,
        state: RestoreState::Complete,
        records_restored,
        media_files_restored,
        media_swapped: retired.is_some(),
    })
}
