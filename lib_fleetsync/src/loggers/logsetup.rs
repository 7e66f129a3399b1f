//! # Log Setup
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter`, a readable
//! stdout layer and a daily-rolling file layer written off-thread.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter '{0}'")]
    Filter(String),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogOptions {
    pub dir: PathBuf,
    /// Rolled files are named `<prefix>.<date>`.
    pub file_prefix: String,
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// Number of old log files kept at start-up.
    pub retention: usize,
    /// Write the file layer as JSON lines.
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_prefix: "fleetsync.log".to_string(),
            level: "info".to_string(),
            retention: 7,
            json: false,
        }
    }
}

/// Installs the global subscriber. Hold the returned guard until exit, dropping
/// it flushes the file writer.
pub fn init_logging(options: &LogOptions) -> Result<WorkerGuard, LogError> {
    fs::create_dir_all(&options.dir).map_err(|source| LogError::Io {
        path: options.dir.clone(),
        source,
    })?;
    let removed = cleanup_old_logs(&options.dir, &options.file_prefix, options.retention)?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.level).map_err(|_| LogError::Filter(options.level.clone()))?,
    };

    let appender = tracing_appender::rolling::daily(&options.dir, &options.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stdout_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);
    let result = if options.json {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()
    };
    result.map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        dir = %options.dir.display(),
        level = %options.level,
        removed_files = removed,
        "Logging initialized"
    );
    Ok(guard)
}

/// Deletes all but the `keep` most recently modified files in `dir` whose name
/// starts with `prefix`. Returns how many were removed.
pub fn cleanup_old_logs(dir: &Path, prefix: &str, keep: usize) -> Result<usize, LogError> {
    let entries = fs::read_dir(dir).map_err(|source| LogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((meta.modified().ok()?, entry.path()))
        })
        .collect();

    // Newest first.
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = 0;
    for (_, path) in files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {e}", path.display()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[test]
    fn keeps_only_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "fleetsync.log.2026-01-01", 300);
        touch(dir.path(), "fleetsync.log.2026-01-02", 200);
        touch(dir.path(), "fleetsync.log.2026-01-03", 100);
        touch(dir.path(), "other.txt", 1000);

        let removed = cleanup_old_logs(dir.path(), "fleetsync.log", 2).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("fleetsync.log.2026-01-01").exists());
        assert!(dir.path().join("fleetsync.log.2026-01-03").exists());
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn zero_retention_clears_everything_matching() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "fleetsync.log.2026-01-01", 10);
        assert_eq!(cleanup_old_logs(dir.path(), "fleetsync.log", 0).unwrap(), 1);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(matches!(
            cleanup_old_logs(&gone, "fleetsync.log", 1),
            Err(LogError::Io { .. })
        ));
    }

    #[test]
    fn options_default_from_partial_json() {
        let options: LogOptions = serde_json::from_str(r#"{"level":"debug"}"#).unwrap();
        assert_eq!(options.level, "debug");
        assert_eq!(options.retention, 7);
    }
}
