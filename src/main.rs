use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use datakult_lib::backup::error::{EXIT_FAILURE, EXIT_OK, EXIT_RETENTION_INCOMPLETE};
use datakult_lib::backup::{
    self, BackupError, BackupOptions, RestoreOptions, RestoreReport, RetentionReport,
};
use datakult_lib::config::Settings;
use datakult_lib::db;

#[derive(Debug, Parser)]
#[command(name = "datakult", about = "Datakult backup and restore", version)]
struct Cli {
    /// Live database file (overrides DATAKULT_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Live media root (overrides DATAKULT_MEDIA_ROOT).
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,
    /// Backup directory (overrides DATAKULT_BACKUP_DIR).
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create, restore and prune snapshot archives.
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Snapshot the database and media tree into a new archive.
    Create {
        /// Prune the directory to this many archives afterwards.
        #[arg(long, allow_negative_numbers = true)]
        keep: Option<i64>,
        /// Write the archive here instead of the backup directory.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Archive file name; `.dkbackup` is appended when missing.
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Replace the live database and media tree with an archive.
    Restore {
        archive: PathBuf,
        /// Restore the database only and leave media untouched.
        #[arg(long)]
        no_media: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete all but the newest archives.
    Prune {
        /// Archives to keep (defaults to DATAKULT_BACKUP_KEEP, then 7).
        #[arg(long, allow_negative_numbers = true)]
        keep: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// List archives, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print an archive's manifest without restoring it.
    Inspect { archive: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    let settings = match Settings::load() {
        Ok(mut settings) => {
            if let Some(db) = cli.db {
                settings.db_path = db;
            }
            if let Some(media_root) = cli.media_root {
                settings.media_root = media_root;
            }
            if let Some(backup_dir) = cli.backup_dir {
                settings.backup_dir = backup_dir;
            }
            settings
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(EXIT_FAILURE);
        }
    };

    let guard = datakult_lib::init_logging(settings.log_dir.as_deref());
    settings.log_ignored();
    let code = match run(cli.command, &settings) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            EXIT_FAILURE
        }
    };
    drop(guard);
    process::exit(code);
}

fn run(command: Commands, settings: &Settings) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    match command {
        Commands::Backup(cmd) => runtime.block_on(handle_backup_command(cmd, settings)),
    }
}

async fn handle_backup_command(command: BackupCommand, settings: &Settings) -> Result<i32> {
    match command {
        BackupCommand::Create {
            keep,
            output,
            filename,
            json,
        } => handle_create(settings, keep, output, filename, json).await,
        BackupCommand::Restore {
            archive,
            no_media,
            json,
        } => handle_restore(settings, archive, no_media, json).await,
        BackupCommand::Prune { keep, json } => {
            let keep = keep.unwrap_or(settings.default_keep);
            match backup::apply_retention(&settings.backup_dir, keep) {
                Ok(report) => print_retention(&report, json),
                Err(err) => Ok(report_failure(&err)),
            }
        }
        BackupCommand::List { json } => match backup::list_backups(&settings.backup_dir) {
            Ok(entries) => {
                if json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&entries).context("serialize backup list")?
                    );
                } else if entries.is_empty() {
                    println!("No backups in {}", settings.backup_dir.display());
                } else {
                    println!("{:<44} {:<26} {:>8} {:>12}", "Archive", "Created", "Records", "Bytes");
                    for entry in &entries {
                        println!(
                            "{:<44} {:<26} {:>8} {:>12}",
                            entry.file_name,
                            entry.manifest.created_at.to_rfc3339(),
                            entry.manifest.record_count,
                            entry.size_bytes
                        );
                    }
                }
                Ok(EXIT_OK)
            }
            Err(err) => Ok(report_failure(&err)),
        },
        BackupCommand::Inspect { archive } => match backup::read_manifest(&archive) {
            Ok(manifest) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&manifest).context("serialize manifest")?
                );
                Ok(EXIT_OK)
            }
            Err(err) => Ok(report_failure(&err)),
        },
    }
}

async fn handle_create(
    settings: &Settings,
    keep: Option<i64>,
    output: Option<PathBuf>,
    filename: Option<String>,
    emit_json: bool,
) -> Result<i32> {
    let mut options = BackupOptions::from_settings(settings);
    if let Some(output) = output {
        options.backup_dir = output;
    }
    options.file_name = filename;

    let pool = db::open_pool(&settings.db_path)
        .await
        .context("open database")?;
    let result = backup::create_backup_and_prune(&pool, &options, keep).await;
    pool.close().await;

    let run = match result {
        Ok(run) => run,
        Err(err) => return Ok(report_failure(&err)),
    };

    if emit_json {
        let serialized = serde_json::to_string_pretty(&run).context("serialize backup run")?;
        println!("{serialized}");
    } else {
        println!("Backup stored at {}", run.backup.path.display());
        println!(
            "Records: {}, media files: {}, size: {} bytes",
            run.backup.manifest.record_count, run.backup.manifest.media_file_count, run.backup.size_bytes
        );
        if let Some(report) = &run.retention {
            print_retention_summary(report);
        }
    }

    match &run.retention {
        Some(report) if !report.is_complete() => Ok(EXIT_RETENTION_INCOMPLETE),
        _ => Ok(EXIT_OK),
    }
}

async fn handle_restore(
    settings: &Settings,
    archive: PathBuf,
    no_media: bool,
    emit_json: bool,
) -> Result<i32> {
    let mut options = RestoreOptions::from_settings(settings);
    options.restore_media = !no_media;

    let pool = db::open_pool(&settings.db_path)
        .await
        .context("open database")?;
    let result = backup::restore_backup(&pool, &archive, &options).await;
    pool.close().await;

    match result {
        Ok(report) => {
            print_restore(&report, emit_json)?;
            Ok(EXIT_OK)
        }
        Err(err) => {
            if emit_json {
                let payload = json!({
                    "code": err.code(),
                    "message": err.to_string(),
                    "exitCode": err.exit_code(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).context("serialize restore error")?
                );
            }
            Ok(report_failure(&err))
        }
    }
}

fn print_restore(report: &RestoreReport, emit_json: bool) -> Result<()> {
    if emit_json {
        let serialized =
            serde_json::to_string_pretty(report).context("serialize restore report")?;
        println!("{serialized}");
        return Ok(());
    }
    println!("Restored {}", report.archive.display());
    println!(
        "Archive created: {}",
        report.manifest.created_at.to_rfc3339()
    );
    println!("Records restored: {}", report.records_restored);
    if report.media_swapped {
        println!("Media files restored: {}", report.media_files_restored);
    } else {
        println!("Media left unchanged.");
    }
    Ok(())
}

fn print_retention(report: &RetentionReport, emit_json: bool) -> Result<i32> {
    if emit_json {
        let serialized =
            serde_json::to_string_pretty(report).context("serialize retention report")?;
        println!("{serialized}");
    } else {
        print_retention_summary(report);
    }
    Ok(if report.is_complete() {
        EXIT_OK
    } else {
        EXIT_RETENTION_INCOMPLETE
    })
}

fn print_retention_summary(report: &RetentionReport) {
    println!(
        "Retention: {} kept, {} deleted, {} failed",
        report.retained.len(),
        report.deleted.len(),
        report.failed.len()
    );
    for path in &report.deleted {
        println!("  deleted {}", path.display());
    }
    for failure in &report.failed {
        println!("  FAILED  {} ({})", failure.path.display(), failure.error);
    }
    for path in &report.unreadable {
        println!("  unreadable manifest: {}", path.display());
    }
}

fn report_failure(err: &BackupError) -> i32 {
    if matches!(err, BackupError::PartialRestore { .. }) {
        eprintln!("Error: [{}] {err}", err.code());
        eprintln!("The database now matches the archive but the media directory does not.");
        eprintln!("Re-run the restore once the cause is fixed.");
    } else {
        eprintln!("Error: [{}] {err}", err.code());
    }
    err.exit_code()
}
