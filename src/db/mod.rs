use std::fs;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};

use crate::{AppError, AppResult};

pub mod dataset;
pub mod rows;

/// Version of the relational schema, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS media (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        media_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PLANNED',
        pub_year INTEGER CHECK (pub_year IS NULL OR pub_year BETWEEN -4000 AND 2200),
        review TEXT NOT NULL DEFAULT '',
        score INTEGER CHECK (score IS NULL OR score BETWEEN 1 AND 10),
        review_date TEXT,
        cover TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS media_contributors (
        id INTEGER PRIMARY KEY,
        media_id INTEGER NOT NULL REFERENCES media(id) ON DELETE CASCADE,
        agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        UNIQUE (media_id, agent_id)
    )",
    "CREATE INDEX IF NOT EXISTS media_contributors_agent_idx ON media_contributors(agent_id)",
];

/// Open the live store, creating the file and schema when missing.
pub async fn open_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_db_parent")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_pool")
                .with_context("path", db_path.display().to_string())
        })?;

    migrate(&pool).await?;
    tracing::info!(
        target: "datakult",
        event = "db_open",
        path = %db_path.display(),
        schema_version = SCHEMA_VERSION
    );
    Ok(pool)
}

/// Create the schema idempotently and stamp the schema version.
pub async fn migrate(pool: &SqlitePool) -> AppResult<()> {
    let current = schema_version(pool).await?;
    if current > SCHEMA_VERSION {
        return Err(AppError::new(
            "DB/SCHEMA_TOO_NEW",
            "Database schema is newer than this binary supports",
        )
        .with_context("found", current.to_string())
        .with_context("supported", SCHEMA_VERSION.to_string()));
    }

    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "migrate"))?;
    }

    if current < SCHEMA_VERSION {
        // PRAGMA arguments cannot be bound.
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "stamp_schema"))?;
    }
    Ok(())
}

pub async fn schema_version(pool: &SqlitePool) -> AppResult<i64> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "schema_version"))?;
    Ok(version)
}
