use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::available_space;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task;

use super::archive::{normalize_file_name, unique_archive_path, write_archive};
use super::lock::{DirLock, LiveStateLock};
use super::manifest::{sha256_hex, BackupManifest};
use super::retention::{apply_retention, RetentionReport};
use super::BackupError;
use crate::config::Settings;
use crate::db::dataset::export_dataset;
use crate::media::MediaInventory;
use crate::AppError;

const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MIN_REQUIRED_FREE_BYTES: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_dir: PathBuf,
    pub media_root: PathBuf,
    /// Operator supplied archive name; the timestamped default otherwise.
    pub file_name: Option<String>,
    /// Replaces the free-space lookup, for tests.
    pub available_space_override: Option<u64>,
}

impl BackupOptions {
    pub fn new(backup_dir: impl Into<PathBuf>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            media_root: media_root.into(),
            file_name: None,
            available_space_override: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.backup_dir, &settings.media_root)
    }
}

/// A completed archive on disk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub manifest: BackupManifest,
    pub size_bytes: u64,
}

impl BackupEntry {
    pub(crate) fn new(path: PathBuf, manifest: BackupManifest, size_bytes: u64) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            manifest,
            size_bytes,
        }
    }
}

/// Outcome of a scheduled "create then prune" run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRun {
    pub backup: BackupEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionReport>,
}

fn task_error(err: task::JoinError, operation: &str) -> BackupError {
    BackupError::Store(
        AppError::new("BACKUP/TASK", "Backup task panicked")
            .with_context("operation", operation.to_string())
            .with_context("error", err.to_string()),
    )
}

fn required_free_bytes(payload: u64) -> u64 {
    let scaled = (payload as f64 * REQUIRED_FREE_MULTIPLIER).ceil() as u64;
    scaled.max(MIN_REQUIRED_FREE_BYTES)
}

fn format_bytes(bytes: u64) -> String {
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}

fn free_space(dir: &Path, override_bytes: Option<u64>) -> Result<u64, BackupError> {
    match override_bytes {
        Some(bytes) => Ok(bytes),
        None => available_space(dir).map_err(|err| BackupError::io("available_space", dir, err)),
    }
}

/// Write one archive of the current store and media tree.
///
/// Holds the backup directory lock for the whole run, so a second caller gets
/// `BackupInProgress` instead of racing on the same temporary file. The
/// live-state lock is held shared while the store and media tree are read,
/// which waits out a restore's commit window.
pub async fn create_backup(
    pool: &SqlitePool,
    options: &BackupOptions,
) -> Result<BackupEntry, BackupError> {
    let requested_name = options
        .file_name
        .as_deref()
        .map(normalize_file_name)
        .transpose()?;

    let backup_dir = options.backup_dir.clone();
    fs::create_dir_all(&backup_dir).map_err(|err| BackupError::ArchiveWrite {
        path: backup_dir.clone(),
        reason: format!("create backup directory: {err}"),
    })?;
    let _lock = DirLock::try_acquire(&backup_dir)?;

    let live_root = options.media_root.clone();
    let live_lock = task::spawn_blocking(move || LiveStateLock::shared(&live_root))
        .await
        .map_err(|err| task_error(err, "lock_live_state"))??;

    let started_at = Utc::now();
    let data = export_dataset(pool).await?;
    let data_bytes = data.to_json_bytes().map_err(|err| {
        BackupError::Store(AppError::from(err).with_context("operation", "encode_data_export"))
    })?;

    let media_root = options.media_root.clone();
    let media = task::spawn_blocking(move || MediaInventory::scan(&media_root))
        .await
        .map_err(|err| task_error(err, "scan_media"))?
        .map_err(|err| BackupError::io("scan_media", &options.media_root, err))?;
    drop(live_lock);

    for cover in data.cover_paths() {
        if !media.contains(cover) {
            tracing::warn!(
                target: "datakult",
                event = "backup_cover_missing",
                cover = %cover,
                "media row references a cover file that does not exist"
            );
        }
    }

    let required = required_free_bytes(data_bytes.len() as u64 + media.total_bytes());
    let available = free_space(&backup_dir, options.available_space_override)?;
    if available < required {
        return Err(BackupError::ArchiveWrite {
            path: backup_dir,
            reason: format!(
                "not enough disk space (need ~{}, {} available)",
                format_bytes(required),
                format_bytes(available)
            ),
        });
    }

    let manifest = BackupManifest::new(
        started_at,
        data.record_count(),
        media.file_count(),
        data.schema_version,
        sha256_hex(&data_bytes),
    );
    let final_path = match requested_name {
        Some(name) => backup_dir.join(name),
        None => unique_archive_path(&backup_dir, &started_at)?,
    };

    let to_write = manifest.clone();
    let written = task::spawn_blocking(move || {
        write_archive(&final_path, &to_write, &data_bytes, &media)
    })
    .await
    .map_err(|err| task_error(err, "write_archive"))??;

    let size_bytes = fs::metadata(&written).map(|meta| meta.len()).unwrap_or(0);
    tracing::info!(
        target: "datakult",
        event = "backup_created",
        path = %written.display(),
        records = manifest.record_count,
        media_files = manifest.media_file_count,
        size_bytes
    );
    Ok(BackupEntry::new(written, manifest, size_bytes))
}

/// Create a backup, then prune the directory down to `keep` archives.
///
/// `keep` is validated before anything is written.
pub async fn create_backup_and_prune(
    pool: &SqlitePool,
    options: &BackupOptions,
    keep: Option<i64>,
) -> Result<BackupRun, BackupError> {
    if let Some(keep) = keep.filter(|keep| *keep < 1) {
        return Err(BackupError::InvalidRetention(keep));
    }

    let backup = create_backup(pool, options).await?;
    let retention = match keep {
        Some(keep) => {
            let dir = options.backup_dir.clone();
            let report = task::spawn_blocking(move || apply_retention(&dir, keep))
                .await
                .map_err(|err| task_error(err, "apply_retention"))??;
            Some(report)
        }
        None => None,
    };
    Ok(BackupRun { backup, retention })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{read_manifest, ArchiveReader};
    use crate::db::dataset::{replace_dataset, DataExport};
    use crate::db::open_pool;
    use crate::db::rows::AgentRow;
    use tempfile::tempdir;

    async fn seeded_pool(dir: &Path) -> SqlitePool {
        let pool = open_pool(&dir.join("db.sqlite3")).await.unwrap();
        let data = DataExport {
            agents: vec![AgentRow {
                id: 1,
                name: "FromSoftware".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
            }],
            ..DataExport::empty()
        };
        replace_dataset(&pool, &data).await.unwrap();
        pool
    }

    #[test]
    fn required_space_scales_with_payload() {
        assert_eq!(required_free_bytes(0), MIN_REQUIRED_FREE_BYTES);
        assert_eq!(required_free_bytes(10_000_000), 12_000_000);
        assert_eq!(format_bytes(12_000_000), "12 MB");
    }

    #[tokio::test]
    async fn creates_archive_with_counts_from_live_state() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let media_root = dir.path().join("media");
        fs::create_dir_all(media_root.join("covers")).unwrap();
        fs::write(media_root.join("covers/elden.jpg"), b"ring").unwrap();

        let options = BackupOptions::new(dir.path().join("backups"), &media_root);
        let entry = create_backup(&pool, &options).await.unwrap();

        assert!(entry.file_name.starts_with("datakult_backup_"));
        assert_eq!(entry.manifest.record_count, 1);
        assert_eq!(entry.manifest.media_file_count, 1);
        assert!(entry.size_bytes > 0);
        assert_eq!(read_manifest(&entry.path).unwrap(), entry.manifest);

        let mut reader = ArchiveReader::open(&entry.path).unwrap();
        let data = DataExport::from_json_slice(&reader.read_data_export().unwrap()).unwrap();
        assert_eq!(data.agents[0].name, "FromSoftware");
        pool.close().await;
    }

    #[tokio::test]
    async fn custom_name_gets_extension_and_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let mut options = BackupOptions::new(dir.path().join("backups"), dir.path().join("media"));
        options.file_name = Some("before-upgrade".into());

        let entry = create_backup(&pool, &options).await.unwrap();
        assert_eq!(entry.file_name, "before-upgrade.dkbackup");

        let err = create_backup(&pool, &options).await.unwrap_err();
        assert_eq!(err.code(), "BACKUP/ARCHIVE_WRITE");
        pool.close().await;
    }

    #[tokio::test]
    async fn low_disk_space_fails_before_any_file_is_created() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let backups = dir.path().join("backups");
        let mut options = BackupOptions::new(&backups, dir.path().join("media"));
        options.available_space_override = Some(10);

        let err = create_backup(&pool, &options).await.unwrap_err();
        assert_eq!(err.code(), "BACKUP/ARCHIVE_WRITE");
        let archives = fs::read_dir(&backups)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(archives, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn concurrent_backup_is_rejected() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let _held = DirLock::try_acquire(&backups).unwrap();

        let err = create_backup(&pool, &BackupOptions::new(&backups, dir.path().join("media")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::BackupInProgress { .. }));
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waits_for_an_exclusive_live_lock() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let media_root = dir.path().join("media");
        let backups = dir.path().join("backups");
        let restoring = LiveStateLock::exclusive(&media_root).unwrap();

        let options = BackupOptions::new(&backups, &media_root);
        let task_pool = pool.clone();
        let handle = tokio::spawn(async move { create_backup(&task_pool, &options).await });

        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!handle.is_finished());

        drop(restoring);
        let entry = handle.await.unwrap().unwrap();
        assert_eq!(entry.manifest.record_count, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn invalid_keep_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;
        let backups = dir.path().join("backups");
        let err = create_backup_and_prune(
            &pool,
            &BackupOptions::new(&backups, dir.path().join("media")),
            Some(0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::InvalidRetention(0)));
        assert!(!backups.exists());
        pool.close().await;
    }
}
