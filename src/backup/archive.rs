use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::manifest::{sha256_hex, BackupManifest, DATA_ENTRY, MANIFEST_ENTRY, MEDIA_DIR};
use super::BackupError;
use crate::media::MediaInventory;

pub const ARCHIVE_EXTENSION: &str = "dkbackup";
const ARCHIVE_PREFIX: &str = "datakult_backup_";
const PARTIAL_SUFFIX: &str = ".partial";
const MAX_MANIFEST_BYTES: u64 = 1_000_000;
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

/// `datakult_backup_YYYYMMDD_HHMMSS.dkbackup`, second resolution.
pub fn default_file_name(created_at: &DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}{}.{ARCHIVE_EXTENSION}",
        created_at.format("%Y%m%d_%H%M%S")
    )
}

/// Completed archives only; hidden temporaries never match.
pub fn is_archive_name(name: &str) -> bool {
    let suffix = format!(".{ARCHIVE_EXTENSION}");
    !name.starts_with('.') && name.len() > suffix.len() && name.ends_with(&suffix)
}

/// Validate an operator supplied archive name and append the extension.
pub fn normalize_file_name(requested: &str) -> Result<String, BackupError> {
    let name = requested.trim();
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).components().count() != 1;
    if invalid {
        return Err(BackupError::InvalidFileName(requested.to_string()));
    }
    if name.ends_with(&format!(".{ARCHIVE_EXTENSION}")) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.{ARCHIVE_EXTENSION}"))
    }
}

/// First free default name for `created_at`, adding `_NN` on collision.
pub fn unique_archive_path(dir: &Path, created_at: &DateTime<Utc>) -> Result<PathBuf, BackupError> {
    let stem = format!("{ARCHIVE_PREFIX}{}", created_at.format("%Y%m%d_%H%M%S"));
    for suffix in 0..100 {
        let candidate = if suffix == 0 {
            dir.join(format!("{stem}.{ARCHIVE_EXTENSION}"))
        } else {
            dir.join(format!("{stem}_{suffix:02}.{ARCHIVE_EXTENSION}"))
        };
        if !candidate.exists() && !partial_path(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(BackupError::ArchiveWrite {
        path: dir.join(format!("{stem}.{ARCHIVE_EXTENSION}")),
        reason: "unable to allocate a unique archive name".into(),
    })
}

fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

struct PartialArchiveGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialArchiveGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialArchiveGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(self.path);
        }
    }
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Pack `manifest`, the data export and the media tree into `final_path`.
///
/// Everything is written to a hidden `.partial` sibling which is renamed into
/// place only after it has been flushed; on any failure the partial file is
/// removed and nothing appears at `final_path`.
pub fn write_archive(
    final_path: &Path,
    manifest: &BackupManifest,
    data: &[u8],
    media: &MediaInventory,
) -> Result<PathBuf, BackupError> {
    let write_error = |reason: String| BackupError::ArchiveWrite {
        path: final_path.to_path_buf(),
        reason,
    };

    if final_path.exists() {
        return Err(write_error("an archive with this name already exists".into()));
    }
    let dir = final_path
        .parent()
        .ok_or_else(|| write_error("archive path has no parent directory".into()))?;

    let partial = partial_path(final_path);
    if partial.exists() {
        tracing::warn!(
            target: "datakult",
            event = "archive_stale_partial_removed",
            path = %partial.display()
        );
        fs::remove_file(&partial).map_err(|err| write_error(err.to_string()))?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial)
        .map_err(|err| write_error(format!("create {}: {err}", partial.display())))?;
    let mut guard = PartialArchiveGuard::new(&partial);

    let file = write_entries(file, manifest, data, media)
        .and_then(|file| {
            file.sync_all().context("flush archive to disk")?;
            Ok(file)
        })
        .map_err(|err| write_error(format!("{err:#}")))?;
    drop(file);

    // Re-checked under the directory lock so an existing archive is never replaced.
    if final_path.exists() {
        return Err(write_error("an archive with this name already exists".into()));
    }
    fs::rename(&partial, final_path)
        .map_err(|err| write_error(format!("finalize archive: {err}")))?;
    guard.disarm();
    sync_dir(dir).ok();

    Ok(final_path.to_path_buf())
}

fn write_entries(
    file: File,
    manifest: &BackupManifest,
    data: &[u8],
    media: &MediaInventory,
) -> anyhow::Result<File> {
    let mut writer = ZipWriter::new(file);
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // Stored so it can be read without inflating anything else.
    let manifest_bytes = manifest.to_json_bytes().context("encode manifest")?;
    writer
        .start_file(MANIFEST_ENTRY, stored)
        .context("start manifest entry")?;
    io::Write::write_all(&mut writer, &manifest_bytes).context("write manifest entry")?;

    writer
        .start_file(
            DATA_ENTRY,
            deflated.large_file(data.len() as u64 >= LARGE_FILE_THRESHOLD),
        )
        .context("start data entry")?;
    io::Write::write_all(&mut writer, data).context("write data entry")?;

    writer
        .add_directory(format!("{MEDIA_DIR}/"), deflated)
        .context("add media directory")?;
    for dir in &media.dirs {
        writer
            .add_directory(format!("{MEDIA_DIR}/{dir}/"), deflated)
            .with_context(|| format!("add media directory {dir}"))?;
    }
    for entry in &media.files {
        let mut source = File::open(&entry.absolute)
            .with_context(|| format!("open media file {}", entry.absolute.display()))?;
        writer
            .start_file(
                format!("{MEDIA_DIR}/{}", entry.relative),
                deflated.large_file(entry.size >= LARGE_FILE_THRESHOLD),
            )
            .with_context(|| format!("start media entry {}", entry.relative))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("copy media file {}", entry.absolute.display()))?;
    }

    writer.finish().context("finish archive")
}

fn corrupt(path: &Path, reason: impl ToString) -> BackupError {
    BackupError::ArchiveCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn open_container(path: &Path) -> Result<ZipArchive<File>, BackupError> {
    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => BackupError::ArchiveMissing {
            path: path.to_path_buf(),
        },
        _ => BackupError::io("open_archive", path, err),
    })?;
    ZipArchive::new(file).map_err(|err| corrupt(path, err))
}

fn read_manifest_bytes(zip: &mut ZipArchive<File>, path: &Path) -> Result<Vec<u8>, BackupError> {
    let manifest_error = |reason: String| BackupError::ArchiveManifest {
        path: path.to_path_buf(),
        reason,
    };
    let mut entry = match zip.by_name(MANIFEST_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(manifest_error(format!("{MANIFEST_ENTRY} not found")))
        }
        Err(err) => return Err(manifest_error(err.to_string())),
    };
    if entry.size() > MAX_MANIFEST_BYTES {
        return Err(manifest_error(format!(
            "{MANIFEST_ENTRY} is {} bytes",
            entry.size()
        )));
    }
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| manifest_error(err.to_string()))?;
    Ok(bytes)
}

fn read_manifest_entry(
    zip: &mut ZipArchive<File>,
    path: &Path,
) -> Result<BackupManifest, BackupError> {
    let bytes = read_manifest_bytes(zip, path)?;
    BackupManifest::decode(path, &bytes)
}

/// Cheap manifest-only read: the central directory plus one stored entry.
pub fn read_manifest(path: &Path) -> Result<BackupManifest, BackupError> {
    let mut zip = open_container(path)?;
    read_manifest_entry(&mut zip, path)
}

/// Manifest timestamp of an archive in any format version.
pub fn read_created_at(path: &Path) -> Result<DateTime<Utc>, BackupError> {
    let mut zip = open_container(path)?;
    let bytes = read_manifest_bytes(&mut zip, path)?;
    BackupManifest::decode_created_at(path, &bytes)
}

fn safe_entry_path(entry: &ZipFile<'_>) -> Option<PathBuf> {
    let enclosed = entry.enclosed_name()?;
    enclosed
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        .then(|| enclosed.to_path_buf())
}

#[derive(Debug, Clone)]
struct MediaIndex {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// An opened archive whose manifest has already been decoded.
pub struct ArchiveReader {
    path: PathBuf,
    manifest: BackupManifest,
    zip: ZipArchive<File>,
    media: Vec<MediaIndex>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("manifest", &self.manifest)
            .field("media_entries", &self.media.len())
            .finish()
    }
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, BackupError> {
        let mut zip = open_container(path)?;
        let manifest = read_manifest_entry(&mut zip, path)?;

        match zip.by_name(DATA_ENTRY) {
            Ok(_) => {}
            Err(ZipError::FileNotFound) => {
                return Err(corrupt(path, format!("{DATA_ENTRY} not found")))
            }
            Err(err) => return Err(corrupt(path, err)),
        }

        let mut media = Vec::new();
        for index in 0..zip.len() {
            let entry = zip.by_index(index).map_err(|err| corrupt(path, err))?;
            let Some(entry_path) = safe_entry_path(&entry) else {
                return Err(corrupt(
                    path,
                    format!("unsafe entry path {:?}", entry.name()),
                ));
            };
            let Ok(relative) = entry_path.strip_prefix(MEDIA_DIR) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }
            media.push(MediaIndex {
                index,
                relative: relative.to_path_buf(),
                is_dir: entry.is_dir(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            zip,
            media,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    pub fn media_file_count(&self) -> u64 {
        self.media.iter().filter(|entry| !entry.is_dir).count() as u64
    }

    /// Whether the media tree holds a file at `relative` (`/`-separated).
    pub fn has_media_file(&self, relative: &str) -> bool {
        let wanted = Path::new(relative);
        self.media
            .iter()
            .any(|entry| !entry.is_dir && entry.relative == wanted)
    }

    /// Inflate the data export and check it against the manifest digest.
    pub fn read_data_export(&mut self) -> Result<Vec<u8>, BackupError> {
        let mut entry = self
            .zip
            .by_name(DATA_ENTRY)
            .map_err(|err| corrupt(&self.path, err))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|err| corrupt(&self.path, err))?;
        drop(entry);

        if sha256_hex(&bytes) != self.manifest.data_sha256 {
            return Err(corrupt(
                &self.path,
                "data export does not match the manifest checksum",
            ));
        }
        Ok(bytes)
    }

    /// Stream the media tree one entry at a time.
    pub fn media_entries(&mut self) -> MediaEntries<'_> {
        MediaEntries {
            zip: &mut self.zip,
            path: &self.path,
            pending: self.media.iter(),
        }
    }
}

pub struct MediaEntries<'a> {
    zip: &'a mut ZipArchive<File>,
    path: &'a Path,
    pending: std::slice::Iter<'a, MediaIndex>,
}

impl MediaEntries<'_> {
    pub fn next_entry(&mut self) -> Option<Result<MediaEntry<'_>, BackupError>> {
        let item = self.pending.next()?;
        Some(match self.zip.by_index(item.index) {
            Ok(file) => Ok(MediaEntry {
                relative: &item.relative,
                is_dir: item.is_dir,
                file,
            }),
            Err(err) => Err(corrupt(self.path, err)),
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.len() == 0
    }
}

pub struct MediaEntry<'a> {
    relative: &'a Path,
    is_dir: bool,
    file: ZipFile<'a>,
}

impl MediaEntry<'_> {
    /// Path relative to the media root; never absolute and never escaping it.
    pub fn relative_path(&self) -> &Path {
        self.relative
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }
}

impl Read for MediaEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
