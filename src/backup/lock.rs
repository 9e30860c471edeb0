//! Advisory file locks.
//!
//! [`DirLock`] serialises writers of one backup directory: backups take it
//! with `try_acquire`, restores wait for it. [`LiveStateLock`] sits beside the
//! media root; backups hold it shared while reading live state and a restore
//! holds it exclusively while it commits.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::BackupError;

pub const BACKUP_LOCK_FILE: &str = ".datakult_backup.lock";
pub const LIVE_LOCK_FILE: &str = ".datakult_live.lock";

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Advisory lock serialising writers of one backup directory.
///
/// Released when dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Fail fast with `BackupInProgress` when another holder exists.
    pub fn try_acquire(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(BACKUP_LOCK_FILE);
        let file =
            open_lock_file(&path).map_err(|err| BackupError::io("open_backup_lock", &path, err))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if is_contended(&err) => Err(BackupError::BackupInProgress {
                dir: dir.to_path_buf(),
            }),
            Err(err) => Err(BackupError::io("lock_backup_dir", &path, err)),
        }
    }

    /// Wait until the directory is free.
    pub fn acquire(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(BACKUP_LOCK_FILE);
        let file =
            open_lock_file(&path).map_err(|err| BackupError::io("open_backup_lock", &path, err))?;
        file.lock_exclusive()
            .map_err(|err| BackupError::io("lock_backup_dir", &path, err))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock guarding the live store and media root.
#[derive(Debug)]
pub struct LiveStateLock {
    file: File,
}

impl LiveStateLock {
    pub fn lock_path(media_root: &Path) -> PathBuf {
        media_root
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(LIVE_LOCK_FILE)
    }

    pub fn exclusive(media_root: &Path) -> Result<Self, BackupError> {
        let path = Self::lock_path(media_root);
        let file =
            open_lock_file(&path).map_err(|err| BackupError::io("open_live_lock", &path, err))?;
        file.lock_exclusive()
            .map_err(|err| BackupError::io("lock_live_state", &path, err))?;
        Ok(Self { file })
    }

    pub fn shared(media_root: &Path) -> Result<Self, BackupError> {
        let path = Self::lock_path(media_root);
        let file =
            open_lock_file(&path).map_err(|err| BackupError::io("open_live_lock", &path, err))?;
        FileExt::lock_shared(&file)
            .map_err(|err| BackupError::io("lock_live_state", &path, err))?;
        Ok(Self { file })
    }
}

impl Drop for LiveStateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
