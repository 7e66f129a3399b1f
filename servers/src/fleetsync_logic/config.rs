use anyhow::{Context, Result};
use clap::Parser;
use lib_fleetsync::LogOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Vehicle telemetry sync server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FLEETSYNC_PORT", help = "Port the control API listens on.")]
    pub port: Option<u16>,

    #[clap(long, env = "FLEETSYNC_CONFIG_PATH", help = "Path to the JSON server configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FLEETSYNC_SYNC_CONFIG_PATH", help = "Path to the JSON engine tuning file.")]
    pub sync_config_path: Option<PathBuf>,

    #[clap(long, env = "FLEETSYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FLEETSYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FLEETSYNC_LOG_RETENTION", help = "Number of old log files kept at start-up.")]
    pub log_retention: Option<usize>,

    #[clap(long, env = "FLEETSYNC_CREDENTIALS_PATH", help = "JSON credentials file. Falls back to FLEETSYNC_* variables.")]
    pub credentials_path: Option<PathBuf>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL of the durable sink.")]
    pub database_url: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis URL of the snapshot cache.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "FLEETSYNC_SNAPSHOT_PATH", help = "Snapshot file used when no Redis URL is set.")]
    pub snapshot_path: Option<PathBuf>,

    #[clap(long, env = "FLEETSYNC_REQUEST_TIMEOUT_MS", help = "Per-request timeout for provider calls.")]
    pub request_timeout_ms: Option<u64>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            sync_config_path: other.sync_config_path.or(self.sync_config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_retention: other.log_retention.or(self.log_retention),
            credentials_path: other.credentials_path.or(self.credentials_path),
            database_url: other.database_url.or(self.database_url),
            redis_url: other.redis_url.or(self.redis_url),
            snapshot_path: other.snapshot_path.or(self.snapshot_path),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_retention: Some(7),
            snapshot_path: Some(PathBuf::from("./fleetsync_snapshot.json")),
            request_timeout_ms: Some(15_000),
            ..Default::default()
        }
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log: LogOptions,
    pub sync_config_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub snapshot_path: PathBuf,
    pub request_timeout: Duration,
}

impl From<Config> for Settings {
    fn from(config: Config) -> Self {
        let fallback = Config::defaults();
        let log_defaults = LogOptions::default();
        Settings {
            port: config.port.or(fallback.port).unwrap_or(9010),
            log: LogOptions {
                dir: config.log_dir.unwrap_or(log_defaults.dir),
                level: config.log_level.unwrap_or(log_defaults.level),
                retention: config.log_retention.unwrap_or(log_defaults.retention),
                file_prefix: "server_fleetsync.log".to_string(),
                json: false,
            },
            sync_config_path: config.sync_config_path,
            credentials_path: config.credentials_path,
            database_url: config.database_url.filter(|u| !u.is_empty()),
            redis_url: config.redis_url.filter(|u| !u.is_empty()),
            snapshot_path: config
                .snapshot_path
                .unwrap_or_else(|| PathBuf::from("./fleetsync_snapshot.json")),
            request_timeout: Duration::from_millis(config.request_timeout_ms.unwrap_or(15_000)),
        }
    }
}

/// Defaults, then the JSON file, then environment and CLI.
pub fn load_config() -> Result<Settings> {
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> Result<Settings> {
    let mut current = Config::defaults();

    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_fleetsync.conf"));

    if config_file_path.exists() {
        let raw = fs::read_to_string(&config_file_path)
            .with_context(|| format!("reading {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", config_file_path.display()))?;
        current = current.merge(file_config);
    }

    Ok(current.merge(cli).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 8200, "logLevel": "debug", "redisUrl": "redis://cache/"}}"#).unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(8300),
            ..Default::default()
        };
        let settings = load_config_from(cli).unwrap();

        assert_eq!(settings.port, 8300);
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache/"));
        assert_eq!(settings.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn missing_file_means_defaults() {
        let cli = Config {
            config_path: Some(PathBuf::from("/nonexistent/server_fleetsync.conf")),
            ..Default::default()
        };
        let settings = load_config_from(cli).unwrap();
        assert_eq!(settings.port, 9010);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_config_from(cli).is_err());
    }
}
