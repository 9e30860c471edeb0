#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;

use datakult_lib::backup::{create_backup, restore_backup, RestoreState};
use datakult_lib::db::dataset::{export_dataset, replace_dataset, DataExport};

#[path = "util.rs"]
mod util;

use util::{sample_dataset, seed, snapshot_tree, Install};

fn same_records(left: &DataExport, right: &DataExport) {
    assert_eq!(left.agents, right.agents);
    assert_eq!(left.media, right.media);
    assert_eq!(left.media_contributors, right.media_contributors);
}

#[tokio::test]
async fn restore_into_empty_install_reproduces_data_and_media() {
    let source = Install::new();
    let pool = source.pool().await;
    seed(&source, &pool).await;
    let entry = create_backup(&pool, &source.backup_options()).await.unwrap();
    let expected_tree = snapshot_tree(&source.media_root);
    pool.close().await;

    assert_eq!(entry.manifest.record_count, 7);
    assert_eq!(entry.manifest.media_file_count, 3);

    let target = Install::new();
    let target_pool = target.pool().await;
    let report = restore_backup(&target_pool, &entry.path, &target.restore_options())
        .await
        .unwrap();

    assert_eq!(report.state, RestoreState::Complete);
    assert_eq!(report.records_restored, 7);
    assert_eq!(report.media_files_restored, 3);
    assert!(report.media_swapped);

    let restored = export_dataset(&target_pool).await.unwrap();
    same_records(&restored, &sample_dataset());
    assert_eq!(snapshot_tree(&target.media_root), expected_tree);
    assert!(target.media_siblings().is_empty(), "temp dirs left behind");
    target_pool.close().await;
}

#[tokio::test]
async fn restore_replaces_existing_state_entirely() {
    let install = Install::new();
    let pool = install.pool().await;
    seed(&install, &pool).await;
    let entry = create_backup(&pool, &install.backup_options()).await.unwrap();
    let expected_tree = snapshot_tree(&install.media_root);

    // Drift after the snapshot: new rows, new files, edited files.
    let mut drifted = sample_dataset();
    drifted.media[0].title = "Sen to Chihiro".into();
    drifted.media_contributors.pop();
    replace_dataset(&pool, &drifted).await.unwrap();
    install.write_media("covers/new_upload.jpg", b"new");
    install.write_media("readme.txt", b"edited");

    restore_backup(&pool, &entry.path, &install.restore_options())
        .await
        .unwrap();

    let restored = export_dataset(&pool).await.unwrap();
    same_records(&restored, &sample_dataset());
    assert_eq!(snapshot_tree(&install.media_root), expected_tree);
    assert!(!install.media_root.join("covers/new_upload.jpg").exists());
    assert!(install.media_siblings().is_empty());
    pool.close().await;
}

#[tokio::test]
async fn data_only_restore_leaves_media_untouched() {
    let install = Install::new();
    let pool = install.pool().await;
    seed(&install, &pool).await;
    let entry = create_backup(&pool, &install.backup_options()).await.unwrap();

    replace_dataset(&pool, &DataExport::empty()).await.unwrap();
    install.write_media("covers/after.jpg", b"after");
    let media_before = snapshot_tree(&install.media_root);

    let mut options = install.restore_options();
    options.restore_media = false;
    let report = restore_backup(&pool, &entry.path, &options).await.unwrap();

    assert!(!report.media_swapped);
    assert_eq!(report.media_files_restored, 0);
    same_records(&export_dataset(&pool).await.unwrap(), &sample_dataset());
    assert_eq!(snapshot_tree(&install.media_root), media_before);
    pool.close().await;
}

#[tokio::test]
async fn empty_install_round_trips() {
    let install = Install::new();
    let pool = install.pool().await;
    let entry = create_backup(&pool, &install.backup_options()).await.unwrap();
    assert_eq!(entry.manifest.record_count, 0);
    assert_eq!(entry.manifest.media_file_count, 0);

    let report = restore_backup(&pool, &entry.path, &install.restore_options())
        .await
        .unwrap();
    assert_eq!(report.records_restored, 0);
    assert!(install.media_root.is_dir());
    assert_eq!(fs::read_dir(&install.media_root).unwrap().count(), 0);
    pool.close().await;
}
