use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

fn ensure_same_parent(live: &Path, other: &Path, role: &str) -> AppResult<()> {
    let live_parent = live.parent().ok_or_else(|| {
        AppError::new(
            "MEDIA_SWAP/NO_PARENT",
            "Media root does not have a parent directory",
        )
        .with_context("path", live.display().to_string())
    })?;
    if other.parent() != Some(live_parent) {
        return Err(AppError::new(
            "MEDIA_SWAP/DIFFERENT_PARENT",
            "Swap paths must share the same parent directory",
        )
        .with_context("live", live.display().to_string())
        .with_context(role, other.display().to_string()));
    }
    Ok(())
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Replace the live media directory with a fully prepared staged one.
///
/// The current tree is renamed to `retired` first so a failed promotion can
/// be reverted; the caller removes `retired` once it no longer needs it.
/// Returns the retired path when there was a live tree to retire.
pub fn swap_directory(live: &Path, staged: &Path, retired: &Path) -> AppResult<Option<PathBuf>> {
    ensure_same_parent(live, staged, "staged")?;
    ensure_same_parent(live, retired, "retired")?;

    if !staged.is_dir() {
        return Err(
            AppError::new("MEDIA_SWAP/MISSING_STAGED", "Staged media directory is missing")
                .with_context("path", staged.display().to_string()),
        );
    }

    let had_live = live.exists();
    if had_live {
        fs::rename(live, retired).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "retire_live_media")
                .with_context("from", live.display().to_string())
                .with_context("to", retired.display().to_string())
        })?;
    }

    if let Err(err) = fs::rename(staged, live) {
        if had_live {
            if let Err(revert) = fs::rename(retired, live) {
                tracing::error!(
                    target: "datakult",
                    event = "media_swap_revert_failed",
                    live = %live.display(),
                    retired = %retired.display(),
                    error = %revert
                );
            }
        }
        return Err(AppError::from(err)
            .with_context("operation", "promote_staged_media")
            .with_context("from", staged.display().to_string())
            .with_context("to", live.display().to_string()));
    }

    if let Some(parent) = live.parent() {
        sync_dir(parent).ok();
    }
    Ok(had_live.then(|| retired.to_path_buf()))
}
