#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use datakult_lib::backup::archive::write_archive;
use datakult_lib::backup::manifest::sha256_hex;
use datakult_lib::backup::{BackupManifest, BackupOptions, RestoreOptions};
use datakult_lib::db::dataset::{replace_dataset, DataExport};
use datakult_lib::db::open_pool;
use datakult_lib::db::rows::{AgentRow, MediaContributorRow, MediaRow};
use datakult_lib::media::MediaInventory;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A throwaway install: database, media root and backup directory under one
/// temporary directory.
pub struct Install {
    pub tmp: TempDir,
    pub db_path: PathBuf,
    pub media_root: PathBuf,
    pub backup_dir: PathBuf,
}

impl Install {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let root = tmp.path().to_path_buf();
        Self {
            db_path: root.join("data").join("datakult.sqlite3"),
            media_root: root.join("data").join("media"),
            backup_dir: root.join("backups"),
            tmp,
        }
    }

    pub async fn pool(&self) -> SqlitePool {
        open_pool(&self.db_path).await.expect("open pool")
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions::new(&self.backup_dir, &self.media_root)
    }

    pub fn restore_options(&self) -> RestoreOptions {
        RestoreOptions::new(&self.backup_dir, &self.media_root)
    }

    pub fn write_media(&self, relative: &str, bytes: &[u8]) {
        let path = self.media_root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    /// Entries beside the media root other than the media root itself and
    /// the live-state lock file.
    pub fn media_siblings(&self) -> Vec<String> {
        let parent = self.media_root.parent().unwrap();
        let mut names: Vec<String> = fs::read_dir(parent)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".media."))
            .collect();
        names.sort();
        names
    }
}

pub fn sample_dataset() -> DataExport {
    DataExport {
        agents: vec![
            AgentRow {
                id: 1,
                name: "Hayao Miyazaki".into(),
                created_at: "2024-01-01T10:00:00Z".into(),
            },
            AgentRow {
                id: 2,
                name: "Joe Hisaishi".into(),
                created_at: "2024-01-01T10:05:00Z".into(),
            },
        ],
        media: vec![
            MediaRow {
                id: 1,
                title: "Spirited Away".into(),
                media_type: "FILM".into(),
                status: "COMPLETED".into(),
                pub_year: Some(2001),
                review: "A bathhouse for the gods.\n\n- **10/10**".into(),
                score: Some(10),
                review_date: Some("2023-08".into()),
                cover: Some("covers/spirited_away.jpg".into()),
                created_at: "2024-01-02T09:00:00Z".into(),
            },
            MediaRow {
                id: 2,
                title: "Nausicaä of the Valley of the Wind".into(),
                media_type: "COMIC".into(),
                status: "IN_PROGRESS".into(),
                pub_year: Some(1982),
                review: String::new(),
                score: None,
                review_date: None,
                cover: None,
                created_at: "2024-01-03T09:00:00Z".into(),
            },
        ],
        media_contributors: vec![
            MediaContributorRow {
                id: 1,
                media_id: 1,
                agent_id: 1,
            },
            MediaContributorRow {
                id: 2,
                media_id: 1,
                agent_id: 2,
            },
            MediaContributorRow {
                id: 3,
                media_id: 2,
                agent_id: 1,
            },
        ],
        ..DataExport::empty()
    }
}

pub async fn seed(install: &Install, pool: &SqlitePool) {
    replace_dataset(pool, &sample_dataset()).await.unwrap();
    install.write_media("covers/spirited_away.jpg", &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
    install.write_media("covers/nested/deep/poster.png", b"\x89PNG fake");
    install.write_media("readme.txt", b"uploaded by hand");
}

/// Every file under `root` keyed by its `/`-separated relative path.
pub fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let inventory = MediaInventory::scan(root).unwrap();
    inventory
        .files
        .iter()
        .map(|file| (file.relative.clone(), fs::read(&file.absolute).unwrap()))
        .collect()
}

/// Write an empty archive whose manifest claims `created_at`.
pub fn archive_at(dir: &Path, name: &str, created_at: DateTime<Utc>) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let mut data = DataExport::empty();
    data.exported_at = created_at;
    let bytes = data.to_json_bytes().unwrap();
    let manifest = BackupManifest::new(created_at, 0, 0, data.schema_version, sha256_hex(&bytes));
    write_archive(&dir.join(name), &manifest, &bytes, &MediaInventory::default()).unwrap()
}

/// Archive file names currently in `dir`, sorted.
pub fn archive_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".dkbackup") && !name.starts_with('.'))
        .collect();
    names.sort();
    names
}
