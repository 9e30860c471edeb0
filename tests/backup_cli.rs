#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use chrono::{TimeZone, Utc};
use datakult_lib::backup::lock::DirLock;
use datakult_lib::db::dataset::export_dataset;
use serde_json::Value;

#[path = "util.rs"]
mod util;

use util::{archive_at, archive_names, sample_dataset, seed, Install};

fn datakult(install: &Install) -> Result<Command> {
    let mut cmd = Command::cargo_bin("datakult")?;
    cmd.env("DATAKULT_DATA_DIR", install.db_path.parent().unwrap())
        .env("DATAKULT_BACKUP_DIR", &install.backup_dir)
        .env("DATAKULT_LOG", "off")
        .env_remove("DATAKULT_DB_PATH")
        .env_remove("DATAKULT_MEDIA_ROOT")
        .env_remove("DATAKULT_BACKUP_KEEP")
        .env_remove("DATAKULT_LOG_DIR")
        .env_remove("DATAKULT_RETENTION_FAKE_DELETE_FAILURE");
    Ok(cmd)
}

fn describe(output: &Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

async fn seeded() -> Install {
    let install = Install::new();
    let pool = install.pool().await;
    seed(&install, &pool).await;
    pool.close().await;
    install
}

#[tokio::test]
async fn create_writes_an_archive() -> Result<()> {
    let install = seeded().await;

    let output = datakult(&install)?.args(["backup", "create"]).output()?;
    assert!(output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Backup stored at"));

    let names = archive_names(&install.backup_dir);
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("datakult_backup_"));
    Ok(())
}

#[tokio::test]
async fn create_with_invalid_keep_exits_with_validation_code() -> Result<()> {
    let install = seeded().await;

    let output = datakult(&install)?
        .args(["backup", "create", "--keep", "0"])
        .output()?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("BACKUP/INVALID_RETENTION"));
    assert!(!install.backup_dir.exists() || archive_names(&install.backup_dir).is_empty());
    Ok(())
}

#[tokio::test]
async fn create_while_another_backup_runs_exits_in_progress() -> Result<()> {
    let install = seeded().await;
    fs::create_dir_all(&install.backup_dir)?;
    let _held = DirLock::try_acquire(&install.backup_dir).unwrap();

    let output = datakult(&install)?.args(["backup", "create"]).output()?;
    assert_eq!(output.status.code(), Some(5), "{}", describe(&output));
    assert!(archive_names(&install.backup_dir).is_empty());
    Ok(())
}

#[tokio::test]
async fn prune_reports_deleted_archives_as_json() -> Result<()> {
    let install = Install::new();
    for day in 1..=3 {
        let created = Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap();
        archive_at(&install.backup_dir, &format!("snap_{day}.dkbackup"), created);
    }

    let output = datakult(&install)?
        .args(["backup", "prune", "--keep", "1", "--json"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));

    let report: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["deleted"].as_array().map(Vec::len), Some(2));
    assert_eq!(report["failed"].as_array().map(Vec::len), Some(0));
    assert_eq!(archive_names(&install.backup_dir), vec!["snap_3.dkbackup"]);
    Ok(())
}

#[tokio::test]
async fn prune_with_a_failed_deletion_exits_incomplete() -> Result<()> {
    let install = Install::new();
    for day in 1..=3 {
        let created = Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap();
        archive_at(&install.backup_dir, &format!("snap_{day}.dkbackup"), created);
    }

    let output = datakult(&install)?
        .env("DATAKULT_RETENTION_FAKE_DELETE_FAILURE", "snap_1.dkbackup")
        .args(["backup", "prune", "--keep", "1", "--json"])
        .output()?;
    assert_eq!(output.status.code(), Some(6), "{}", describe(&output));

    let report: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["deleted"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["failed"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        archive_names(&install.backup_dir),
        vec!["snap_1.dkbackup", "snap_3.dkbackup"]
    );
    Ok(())
}

#[tokio::test]
async fn invalid_keep_in_environment_is_logged() -> Result<()> {
    let install = Install::new();

    let output = datakult(&install)?
        .env("DATAKULT_BACKUP_KEEP", "0")
        .env("DATAKULT_LOG", "datakult=warn")
        .args(["backup", "list"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config_invalid_keep"), "{}", describe(&output));
    assert!(stderr.contains("DATAKULT_BACKUP_KEEP"));
    Ok(())
}

#[tokio::test]
async fn list_and_inspect_show_manifests() -> Result<()> {
    let install = Install::new();
    let created = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let path = archive_at(&install.backup_dir, "june.dkbackup", created);

    let output = datakult(&install)?
        .args(["backup", "list", "--json"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let listed: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(listed[0]["fileName"], "june.dkbackup");
    assert_eq!(listed[0]["manifest"]["formatVersion"], 1);

    let output = datakult(&install)?
        .args(["backup", "inspect"])
        .arg(&path)
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let manifest: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(manifest["recordCount"], 0);
    assert_eq!(manifest["createdAt"], "2024-06-01T12:00:00Z");
    Ok(())
}

#[tokio::test]
async fn restore_rejects_unusable_archives() -> Result<()> {
    let install = seeded().await;
    fs::create_dir_all(&install.backup_dir)?;
    let text = install.backup_dir.join("notes.dkbackup");
    fs::write(&text, "plain text")?;

    let output = datakult(&install)?
        .args(["backup", "restore"])
        .arg(&text)
        .output()?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("BACKUP/ARCHIVE_CORRUPT"));

    let output = datakult(&install)?
        .args(["backup", "restore"])
        .arg(install.backup_dir.join("missing.dkbackup"))
        .output()?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("BACKUP/ARCHIVE_MISSING"));
    Ok(())
}

#[tokio::test]
async fn create_then_restore_round_trips_through_the_cli() -> Result<()> {
    let install = seeded().await;

    let output = datakult(&install)?
        .args(["backup", "create", "--filename", "before-edit"])
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let archive = install.backup_dir.join("before-edit.dkbackup");
    assert!(archive.exists());

    install.write_media("covers/extra.jpg", b"extra");
    let output = datakult(&install)?
        .args(["backup", "restore", "--json"])
        .arg(&archive)
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let report: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["state"], "complete");
    assert_eq!(report["recordsRestored"], 7);

    assert!(!install.media_root.join("covers/extra.jpg").exists());
    let pool = install.pool().await;
    let data = export_dataset(&pool).await.unwrap();
    assert_eq!(data.media, sample_dataset().media);
    pool.close().await;
    Ok(())
}
