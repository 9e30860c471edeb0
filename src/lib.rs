use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub mod backup;
pub mod config;
pub mod db;
mod error;
pub mod media;

pub use error::{AppError, AppResult};

pub const LOG_FILTER_ENV: &str = "DATAKULT_LOG";
pub const DEFAULT_LOG_FILTER: &str = "datakult=info,sqlx=warn";

/// Install the global subscriber: JSON lines on stderr, plus a daily rolling
/// file under `log_dir` when one is configured.
///
/// Keep the returned guard alive until exit so buffered file output is
/// flushed.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let mut file_error = None;
    let (file_layer, guard) = match log_dir.map(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("datakult")
            .filename_suffix("log")
            .build(dir)
    }) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            file_error = Some(err);
            (None, None)
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    if let (Some(err), Some(dir)) = (file_error, log_dir) {
        tracing::warn!(
            target: "datakult",
            event = "log_file_unavailable",
            dir = %dir.display(),
            error = %err
        );
    }
    guard
}
