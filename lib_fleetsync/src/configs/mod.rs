//! # Configuration Modules
//!
//! Engine tuning loaded from JSON and the read-only credential stores the
//! engine authenticates with.

/// Engine tuning (`SyncConfig`) and its validation rules.
pub mod config_sync;

/// Provider credentials and the stores that supply them.
pub mod credentials;

use std::path::PathBuf;
use thiserror::Error;

pub use config_sync::{RetryConfig, SyncConfig};
pub use credentials::{CredentialStore, Credentials, EnvCredentialStore, JsonFileCredentialStore};

/// Missing, unreadable or invalid configuration. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment variable {0} is not present")]
    MissingEnvVar(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid engine configuration: {0}")]
    Invalid(String),
}
