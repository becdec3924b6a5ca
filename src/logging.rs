//! File-based logging for spm.
//!
//! Each run writes a timestamped file under ~/.spm/logs/; files older than
//! the retention window are removed at startup.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::spm_dir;

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging configuration (`[log]` section).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Whether logging is enabled.
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: true,
        }
    }
}

impl LogConfig {
    /// Normalises a level name.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Returns the log directory path (~/.spm/logs/).
#[must_use]
pub fn log_directory() -> PathBuf {
    spm_dir().join("logs")
}

/// Returns a fresh log file name for this run.
#[must_use]
pub fn log_file_name() -> String {
    let now = chrono::Local::now();
    format!("spm_{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes `.log` files in `log_dir` older than the retention period.
///
/// # Errors
/// Returns error if the directory cannot be read.
pub fn cleanup_old_logs(log_dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted_count = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) && fs::remove_file(&path).is_ok() {
            deleted_count += 1;
        }
    }

    Ok(deleted_count)
}

/// Initializes file logging.
///
/// Returns the writer guard, which must be held until exit so buffered
/// lines are flushed. `None` when logging is disabled.
///
/// # Errors
/// Returns error if the log directory or file cannot be created.
pub fn init(config: &LogConfig) -> io::Result<Option<WorkerGuard>> {
    if !config.enabled || config.level == "off" {
        return Ok(None);
    }

    let log_dir = log_directory();
    fs::create_dir_all(&log_dir)?;

    let deleted = cleanup_old_logs(&log_dir, config.retention_hours)?;

    let log_path = log_dir.join(log_file_name());
    let log_file = File::create(&log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(log_file);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!("spm logging initialized");
    tracing::info!("Log file: {}", log_path.display());
    tracing::info!("Log level: {}", config.level);
    if deleted > 0 {
        tracing::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(Some(guard))
}
