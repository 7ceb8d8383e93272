//! Structured logging for Loremaster
//!
//! Writes daily log files to the platform log directory with categories:
//! - DISCOVERY: intent classification and recipe changes
//! - PROMPT: prompt assembly
//! - QUEUE: job lifecycle in the execution queue
//! - STREAM: thinking/answer segmentation
//! - MODEL: calls to the model backend
//! - ERROR: errors and recoveries

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Result;

const LOG_FILE_PREFIX: &str = "loremaster.log";
const LOG_RETENTION_DAYS: i64 = 7;

/// Log categories for structured logging
#[derive(Debug, Clone, Copy)]
pub enum LogCategory {
    Discovery,
    Prompt,
    Queue,
    Stream,
    Model,
    Error,
}

impl LogCategory {
    fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Discovery => "DISCOVERY",
            LogCategory::Prompt => "PROMPT",
            LogCategory::Queue => "QUEUE",
            LogCategory::Stream => "STREAM",
            LogCategory::Model => "MODEL",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Default log directory (`<data_local_dir>/loremaster/logs`)
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("loremaster")
        .join("logs")
}

/// Initialize logging: console output plus a daily rolling file in `log_dir`.
///
/// `RUST_LOG` overrides `level`. Calling this twice is harmless; the second
/// subscriber is ignored.
pub fn init_logging(log_dir: &Path, level: &str) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);

    let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
    let console_layer = fmt::layer().with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    log(LogCategory::Queue, None, "Loremaster logging initialized");
    Ok(())
}

/// Log a message with category and optional job context
pub fn log(category: LogCategory, job_id: Option<&str>, message: &str) {
    let job = job_id.map(|id| id.get(..8).unwrap_or(id)).unwrap_or("-");
    match category {
        LogCategory::Error => tracing::error!(category = category.as_str(), job, "{}", message),
        LogCategory::Stream => tracing::debug!(category = category.as_str(), job, "{}", message),
        _ => tracing::info!(category = category.as_str(), job, "{}", message),
    }
}

pub fn log_discovery(message: &str) {
    log(LogCategory::Discovery, None, message);
}

pub fn log_prompt(job_id: Option<&str>, message: &str) {
    log(LogCategory::Prompt, job_id, message);
}

pub fn log_queue(job_id: Option<&str>, message: &str) {
    log(LogCategory::Queue, job_id, message);
}

pub fn log_stream(job_id: Option<&str>, message: &str) {
    log(LogCategory::Stream, job_id, message);
}

pub fn log_model(job_id: Option<&str>, message: &str) {
    log(LogCategory::Model, job_id, message);
}

pub fn log_error(job_id: Option<&str>, message: &str) {
    log(LogCategory::Error, job_id, message);
}

/// Clean up old log files (keep last 7 days)
pub fn cleanup_old_logs(log_dir: &Path) -> Result<usize> {
    let mut deleted = 0;

    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_ours {
            continue;
        }

        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified_time: chrono::DateTime<Utc> = modified.into();
            if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(cleanup_old_logs(&missing).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_keeps_fresh_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("loremaster.log.2026-10-15"), "fresh").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a log").unwrap();

        assert_eq!(cleanup_old_logs(dir.path()).unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
