use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

use super::rows::{
    AgentRow, MediaContributorRow, MediaRow, MAX_PUB_YEAR, MEDIA_STATUSES, MEDIA_TYPES,
    MIN_PUB_YEAR,
};
use super::SCHEMA_VERSION;
use crate::{AppError, AppResult};

/// Engine-independent export of every structured record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataExport {
    pub schema_version: i64,
    pub exported_at: DateTime<Utc>,
    pub agents: Vec<AgentRow>,
    pub media: Vec<MediaRow>,
    pub media_contributors: Vec<MediaContributorRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityIssue {
    #[error("duplicate {table} id {id}")]
    DuplicateId { table: &'static str, id: i64 },
    #[error("media {id} has unknown media type {value}")]
    UnknownMediaType { id: i64, value: String },
    #[error("media {id} has unknown status {value}")]
    UnknownStatus { id: i64, value: String },
    #[error("media {id} score {score} is outside 1..=10")]
    ScoreOutOfRange { id: i64, score: i64 },
    #[error("media {id} release year {year} is outside {}..={}", MIN_PUB_YEAR, MAX_PUB_YEAR)]
    YearOutOfRange { id: i64, year: i64 },
    #[error("contributor row {id} references missing media {media_id}")]
    MissingMedia { id: i64, media_id: i64 },
    #[error("contributor row {id} references missing agent {agent_id}")]
    MissingAgent { id: i64, agent_id: i64 },
    #[error("media {media_id} lists agent {agent_id} more than once")]
    DuplicateContributor { media_id: i64, agent_id: i64 },
}

impl DataExport {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            exported_at: Utc::now(),
            agents: Vec::new(),
            media: Vec::new(),
            media_contributors: Vec::new(),
        }
    }

    pub fn record_count(&self) -> u64 {
        (self.agents.len() + self.media.len() + self.media_contributors.len()) as u64
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Cover paths referenced by media rows, relative to the media root.
    pub fn cover_paths(&self) -> impl Iterator<Item = &str> {
        self.media
            .iter()
            .filter_map(|row| row.cover.as_deref())
            .filter(|cover| !cover.is_empty())
    }

    /// Check referential consistency and value ranges without touching a store.
    pub fn validate(&self) -> Result<(), IntegrityIssue> {
        let mut agent_ids = HashSet::with_capacity(self.agents.len());
        for agent in &self.agents {
            if !agent_ids.insert(agent.id) {
                return Err(IntegrityIssue::DuplicateId {
                    table: "agents",
                    id: agent.id,
                });
            }
        }

        let mut media_ids = HashSet::with_capacity(self.media.len());
        for media in &self.media {
            if !media_ids.insert(media.id) {
                return Err(IntegrityIssue::DuplicateId {
                    table: "media",
                    id: media.id,
                });
            }
            if !MEDIA_TYPES.contains(&media.media_type.as_str()) {
                return Err(IntegrityIssue::UnknownMediaType {
                    id: media.id,
                    value: media.media_type.clone(),
                });
            }
            if !MEDIA_STATUSES.contains(&media.status.as_str()) {
                return Err(IntegrityIssue::UnknownStatus {
                    id: media.id,
                    value: media.status.clone(),
                });
            }
            if let Some(score) = media.score.filter(|score| !(1..=10).contains(score)) {
                return Err(IntegrityIssue::ScoreOutOfRange {
                    id: media.id,
                    score,
                });
            }
            if let Some(year) = media
                .pub_year
                .filter(|year| !(MIN_PUB_YEAR..=MAX_PUB_YEAR).contains(year))
            {
                return Err(IntegrityIssue::YearOutOfRange { id: media.id, year });
            }
        }

        let mut link_ids = HashSet::with_capacity(self.media_contributors.len());
        let mut pairs = HashSet::with_capacity(self.media_contributors.len());
        for link in &self.media_contributors {
            if !link_ids.insert(link.id) {
                return Err(IntegrityIssue::DuplicateId {
                    table: "media_contributors",
                    id: link.id,
                });
            }
            if !media_ids.contains(&link.media_id) {
                return Err(IntegrityIssue::MissingMedia {
                    id: link.id,
                    media_id: link.media_id,
                });
            }
            if !agent_ids.contains(&link.agent_id) {
                return Err(IntegrityIssue::MissingAgent {
                    id: link.id,
                    agent_id: link.agent_id,
                });
            }
            if !pairs.insert((link.media_id, link.agent_id)) {
                return Err(IntegrityIssue::DuplicateContributor {
                    media_id: link.media_id,
                    agent_id: link.agent_id,
                });
            }
        }

        Ok(())
    }
}

/// Read every table inside a single read transaction so the export observes
/// one consistent point of the store.
pub async fn export_dataset(pool: &SqlitePool) -> AppResult<DataExport> {
    let exported_at = Utc::now();
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "export_begin"))?;

    let schema_version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "export_schema_version"))?;

    let agents = sqlx::query("SELECT id, name, created_at FROM agents ORDER BY id")
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| export_error(err, "agents"))?
        .iter()
        .map(AgentRow::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| export_error(err, "agents"))?;

    let media = sqlx::query(
        "SELECT id, title, media_type, status, pub_year, review, score, review_date, cover, created_at
           FROM media ORDER BY id",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(|err| export_error(err, "media"))?
    .iter()
    .map(MediaRow::from_row)
    .collect::<Result<Vec<_>, _>>()
    .map_err(|err| export_error(err, "media"))?;

    let media_contributors =
        sqlx::query("SELECT id, media_id, agent_id FROM media_contributors ORDER BY id")
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| export_error(err, "media_contributors"))?
            .iter()
            .map(MediaContributorRow::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| export_error(err, "media_contributors"))?;

    // Read-only; nothing to commit.
    tx.rollback()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "export_end"))?;

    Ok(DataExport {
        schema_version,
        exported_at,
        agents,
        media,
        media_contributors,
    })
}

fn export_error(err: sqlx::Error, table: &str) -> AppError {
    AppError::from(err)
        .with_context("operation", "export_table")
        .with_context("table", table.to_string())
}

/// Replace every record on `conn` with the contents of `data`.
///
/// The caller owns the transaction; nothing here commits.
pub async fn write_dataset(conn: &mut SqliteConnection, data: &DataExport) -> AppResult<u64> {
    for table in ["media_contributors", "media", "agents"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "clear_table")
                    .with_context("table", table)
            })?;
    }

    for agent in &data.agents {
        sqlx::query("INSERT INTO agents (id, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(agent.id)
            .bind(&agent.name)
            .bind(&agent.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_error(err, "agents", agent.id))?;
    }

    for media in &data.media {
        sqlx::query(
            "INSERT INTO media (id, title, media_type, status, pub_year, review, score, review_date, cover, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(media.id)
        .bind(&media.title)
        .bind(&media.media_type)
        .bind(&media.status)
        .bind(media.pub_year)
        .bind(&media.review)
        .bind(media.score)
        .bind(&media.review_date)
        .bind(&media.cover)
        .bind(&media.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|err| insert_error(err, "media", media.id))?;
    }

    for link in &data.media_contributors {
        sqlx::query("INSERT INTO media_contributors (id, media_id, agent_id) VALUES (?1, ?2, ?3)")
            .bind(link.id)
            .bind(link.media_id)
            .bind(link.agent_id)
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_error(err, "media_contributors", link.id))?;
    }

    Ok(data.record_count())
}

fn insert_error(err: sqlx::Error, table: &'static str, id: i64) -> AppError {
    AppError::from(err)
        .with_context("operation", "insert_row")
        .with_context("table", table)
        .with_context("id", id.to_string())
}

/// Replace the whole dataset in one transaction.
pub async fn replace_dataset(pool: &SqlitePool, data: &DataExport) -> AppResult<u64> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "replace_begin"))?;
    tracing::info!(target: "datakult", event = "db_tx_begin");
    match write_dataset(&mut tx, data).await {
        Ok(count) => {
            tx.commit()
                .await
                .map_err(|err| AppError::from(err).with_context("operation", "replace_commit"))?;
            tracing::info!(target: "datakult", event = "db_tx_commit", records = count);
            Ok(count)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                tracing::error!(target: "datakult", event = "db_tx_rollback_failed", error = %rb);
            } else {
                tracing::warn!(target: "datakult", event = "db_tx_rollback");
            }
            Err(err)
        }
    }
}
