use std::path::Path;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::BackupError;

/// Newest archive layout this binary writes and reads.
pub const FORMAT_VERSION: u32 = 1;
/// Oldest archive layout the importer still accepts.
pub const MIN_SUPPORTED_FORMAT_VERSION: u32 = 1;

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const DATA_ENTRY: &str = "database.json";
pub const MEDIA_DIR: &str = "media";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Advisory; the data export is authoritative.
    pub record_count: u64,
    /// Advisory; the media entries are authoritative.
    pub media_file_count: u64,
    pub app_version: String,
    pub schema_version: i64,
    pub data_sha256: String,
}

/// Only the version field, so manifests from newer writers can be rejected
/// with a version error even when the rest of their layout changed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    format_version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimestampProbe {
    created_at: DateTime<Utc>,
}

impl BackupManifest {
    pub fn new(
        created_at: DateTime<Utc>,
        record_count: u64,
        media_file_count: u64,
        schema_version: i64,
        data_sha256: impl Into<String>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at,
            record_count,
            media_file_count,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version,
            data_sha256: data_sha256.into(),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Decode a manifest read from `archive`, checking the format version
    /// before the full layout is parsed.
    pub fn decode(archive: &Path, bytes: &[u8]) -> Result<Self, BackupError> {
        let probe: VersionProbe =
            serde_json::from_slice(bytes).map_err(|err| BackupError::ArchiveManifest {
                path: archive.to_path_buf(),
                reason: err.to_string(),
            })?;
        if probe.format_version > FORMAT_VERSION {
            return Err(BackupError::ArchiveVersion {
                found: probe.format_version,
                supported: FORMAT_VERSION,
            });
        }

        serde_json::from_slice(bytes).map_err(|err| BackupError::ArchiveManifest {
            path: archive.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Only `createdAt`, whatever the format version. Retention uses this to
    /// rank archives written by a newer release.
    pub fn decode_created_at(archive: &Path, bytes: &[u8]) -> Result<DateTime<Utc>, BackupError> {
        serde_json::from_slice::<TimestampProbe>(bytes)
            .map(|stamp| stamp.created_at)
            .map_err(|err| BackupError::ArchiveManifest {
                path: archive.to_path_buf(),
                reason: err.to_string(),
            })
    }

    /// Whether a newer release of the application wrote this archive.
    pub fn written_by_newer_app(&self) -> bool {
        let Ok(current) = Version::parse(env!("CARGO_PKG_VERSION")) else {
            return false;
        };
        match Version::parse(&self.app_version) {
            Ok(writer) => writer > current,
            Err(_) => false,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
