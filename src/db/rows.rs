use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub const MEDIA_TYPES: &[&str] = &[
    "BOOK",
    "GAME",
    "MUSIC",
    "COMIC",
    "FILM",
    "TV",
    "PERF",
    "BROADCAST",
];

pub const MEDIA_STATUSES: &[&str] = &["PLANNED", "IN_PROGRESS", "COMPLETED", "PAUSED", "DNF"];

pub const MIN_PUB_YEAR: i64 = -4000;
pub const MAX_PUB_YEAR: i64 = 2200;

/// A person or organisation credited on a piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentRow {
    pub id: i64,
    pub name: String,
    #[serde(alias = "createdAt")]
    pub created_at: String,
}

impl AgentRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MediaRow {
    pub id: i64,
    pub title: String,
    #[serde(alias = "mediaType")]
    pub media_type: String,
    pub status: String,
    #[serde(alias = "pubYear")]
    pub pub_year: Option<i64>,
    #[serde(default)]
    pub review: String,
    pub score: Option<i64>,
    /// Partial date as entered by the user ("2021", "2021-04", "2021-04-09").
    #[serde(alias = "reviewDate")]
    pub review_date: Option<String>,
    /// Cover image path relative to the media root.
    pub cover: Option<String>,
    #[serde(alias = "createdAt")]
    pub created_at: String,
}

impl MediaRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            media_type: row.try_get("media_type")?,
            status: row.try_get("status")?,
            pub_year: row.try_get("pub_year")?,
            review: row.try_get("review")?,
            score: row.try_get("score")?,
            review_date: row.try_get("review_date")?,
            cover: row.try_get("cover")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Join row between media and agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MediaContributorRow {
    pub id: i64,
    #[serde(alias = "mediaId")]
    pub media_id: i64,
    #[serde(alias = "agentId")]
    pub agent_id: i64,
}

impl MediaContributorRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            media_id: row.try_get("media_id")?,
            agent_id: row.try_get("agent_id")?,
        })
    }
}
