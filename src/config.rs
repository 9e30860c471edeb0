use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const DATA_DIR_ENV: &str = "DATAKULT_DATA_DIR";
pub const DB_PATH_ENV: &str = "DATAKULT_DB_PATH";
pub const MEDIA_ROOT_ENV: &str = "DATAKULT_MEDIA_ROOT";
pub const BACKUP_DIR_ENV: &str = "DATAKULT_BACKUP_DIR";
pub const BACKUP_KEEP_ENV: &str = "DATAKULT_BACKUP_KEEP";
pub const LOG_DIR_ENV: &str = "DATAKULT_LOG_DIR";

pub const DB_FILE_NAME: &str = "datakult.sqlite3";
pub const DEFAULT_KEEP: i64 = 7;
const APP_DIR_NAME: &str = "datakult";

/// An environment value that was rejected in favour of a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredSetting {
    pub key: &'static str,
    pub value: String,
}

/// Paths and defaults shared by the CLI and the scheduler entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub media_root: PathBuf,
    pub backup_dir: PathBuf,
    pub default_keep: i64,
    pub log_dir: Option<PathBuf>,
    /// Settings are resolved before logging starts, so rejected values are
    /// kept here for [`Settings::log_ignored`].
    pub ignored: Vec<IgnoredSetting>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve settings through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let data_dir = match var(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .or_else(|| env::current_dir().ok())
                .ok_or_else(|| anyhow!("failed to resolve application data directory"))?
                .join(APP_DIR_NAME),
        };

        let mut ignored = Vec::new();
        let default_keep = match var(BACKUP_KEEP_ENV) {
            None => DEFAULT_KEEP,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(keep) if keep >= 1 => keep,
                _ => {
                    ignored.push(IgnoredSetting {
                        key: BACKUP_KEEP_ENV,
                        value: raw,
                    });
                    DEFAULT_KEEP
                }
            },
        };

        Ok(Self {
            db_path: var(DB_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(DB_FILE_NAME)),
            media_root: var(MEDIA_ROOT_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("media")),
            backup_dir: var(BACKUP_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("backups")),
            default_keep,
            log_dir: var(LOG_DIR_ENV).map(PathBuf::from),
            ignored,
        })
    }

    /// Warn about every rejected value. Call once the subscriber is installed.
    pub fn log_ignored(&self) {
        for setting in &self.ignored {
            tracing::warn!(
                target: "datakult",
                event = "config_invalid_keep",
                key = setting.key,
                value = %setting.value,
                default = DEFAULT_KEEP
            );
        }
    }
}
