use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub mod swap;

/// One regular file under the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Path relative to the media root, `/`-separated.
    pub relative: String,
    pub absolute: PathBuf,
    pub size: u64,
}

/// Snapshot of the media tree taken before an archive is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInventory {
    pub root: PathBuf,
    pub files: Vec<MediaFile>,
    /// Directories (including empty ones) relative to the root.
    pub dirs: Vec<String>,
}

impl MediaInventory {
    /// Walk `root` in a stable order. A missing root is an empty tree.
    pub fn scan(root: &Path) -> io::Result<Self> {
        let mut inventory = MediaInventory {
            root: root.to_path_buf(),
            ..Default::default()
        };
        if !root.exists() {
            return Ok(inventory);
        }

        for entry in WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::from)?;
            let Some(relative) = relative_key(root, entry.path()) else {
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                inventory.dirs.push(relative);
            } else if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
                // Symlinked files are archived by content.
                let size = fs::metadata(entry.path())?.len();
                inventory.files.push(MediaFile {
                    relative,
                    absolute: entry.path().to_path_buf(),
                    size,
                });
            } else {
                tracing::warn!(
                    target: "datakult",
                    event = "media_entry_skipped",
                    path = %entry.path().display(),
                    "skipping media entry that is neither a file nor a directory"
                );
            }
        }
        Ok(inventory)
    }

    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.files.iter().any(|file| file.relative == relative)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Sibling path for a hidden temporary directory next to `media_root`,
/// e.g. `.media.staging-<uuid>`.
pub fn sibling_temp_dir(media_root: &Path, role: &str) -> PathBuf {
    let name = media_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    let parent = media_root.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}.{role}-{}", uuid::Uuid::new_v4()))
}

/// Removes a directory tree on drop unless disarmed.
pub struct TempDirGuard {
    path: PathBuf,
    armed: bool,
}

impl TempDirGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    target: "datakult",
                    event = "temp_dir_cleanup_failed",
                    path = %self.path.display(),
                    error = %err
                );
            }
        }
    }
}
