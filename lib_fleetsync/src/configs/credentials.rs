//! # Provider Credentials
//!
//! The engine only ever reads credentials. Where they come from is the host's
//! choice: a JSON file, the environment, or any other `CredentialStore`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

use super::ConfigError;

/// Length of the provider's pre-hashed password (hex MD5 digest).
pub const PASSWORD_HASH_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    /// Hex digest, never the clear-text password.
    pub password_hash: String,
    pub base_url: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Credentials {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::InvalidCredentials("username is empty".into()));
        }
        if self.password_hash.len() != PASSWORD_HASH_LEN
            || !self.password_hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ConfigError::InvalidCredentials(format!(
                "password hash must be a {PASSWORD_HASH_LEN}-character hex digest"
            )));
        }
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::InvalidCredentials(format!("base URL {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidCredentials(format!(
                "base URL must be http(s), got {}",
                url.scheme()
            )));
        }
        Ok(())
    }
}

/// Read-only source of provider credentials.
pub trait CredentialStore: Send + Sync {
    /// Loads and validates the credentials.
    fn load(&self) -> Result<Credentials, ConfigError>;
}

/// Credentials kept in a JSON file: `{"username", "passwordHash", "baseUrl"}`.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStore {
    path: PathBuf,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn load(&self) -> Result<Credentials, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let credentials: Credentials = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        credentials.validate()?;
        Ok(credentials)
    }
}

/// Credentials from `<PREFIX>_USERNAME`, `<PREFIX>_PASSWORD_HASH` and `<PREFIX>_BASE_URL`.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl EnvCredentialStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn var(&self, name: &str) -> Result<String, ConfigError> {
        let key = format!("{}_{}", self.prefix, name);
        std::env::var(&key).map_err(|_| ConfigError::MissingEnvVar(key))
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new("FLEETSYNC")
    }
}

impl CredentialStore for EnvCredentialStore {
    fn load(&self) -> Result<Credentials, ConfigError> {
        let credentials = Credentials {
            username: self.var("USERNAME")?,
            password_hash: self.var("PASSWORD_HASH")?,
            base_url: self.var("BASE_URL")?,
        };
        credentials.validate()?;
        Ok(credentials)
    }
}
