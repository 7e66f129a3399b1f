//! # Engine Tuning
//!
//! `SyncConfig` collects every knob of the engine. Each field has a default, so a
//! JSON file only needs to carry the values it wants to change:
//!
//! ```json
//! {
//!   "tickMs": 2000,
//!   "gatekeeper": { "maxRequestsPerMinute": 60 },
//!   "tiers": { "active": { "intervalMs": 10000, "batchSize": 10, "maxRetries": 4 } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::ConfigError;
use crate::core::classifier::{ActivityThresholds, ActivityTier, TierPolicy};
use crate::core::emergency::EmergencyConfig;
use crate::core::gatekeeper::GatekeeperConfig;

/// Bounds of the exponential backoff between retries of a failed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub gatekeeper: GatekeeperConfig,
    pub tiers: TierPolicy,
    pub activity: ActivityThresholds,
    pub retry: RetryConfig,
    pub emergency: EmergencyConfig,
    /// Period of the control loop.
    pub tick_ms: u64,
    /// How often the full device roster is re-fetched.
    pub roster_refresh_ms: u64,
    /// Age after which a session token is renewed before use.
    pub token_ttl_ms: u64,
    /// Longest a throttled batch may wait for admission inside one cycle.
    pub max_queue_wait_ms: u64,
    /// Position batches in flight at once.
    pub max_concurrent_batches: usize,
    /// How far a fix may be ahead of the local clock before it is rejected.
    pub max_future_skew_ms: u64,
    /// Snapshots buffered per subscriber.
    pub subscriber_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gatekeeper: GatekeeperConfig::default(),
            tiers: TierPolicy::default(),
            activity: ActivityThresholds::default(),
            retry: RetryConfig::default(),
            emergency: EmergencyConfig::default(),
            tick_ms: 5_000,
            roster_refresh_ms: 300_000,
            token_ttl_ms: 6 * 60 * 60 * 1000,
            max_queue_wait_ms: 2_000,
            max_concurrent_batches: 2,
            max_future_skew_ms: 5 * 60 * 1000,
            subscriber_buffer: 16,
        }
    }
}

impl SyncConfig {
    /// Reads `path` over the defaults. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No engine config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Engine config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let intervals: Vec<u64> = ActivityTier::ALL
            .iter()
            .map(|t| self.tiers.settings(*t).interval_ms)
            .collect();
        if !intervals.windows(2).all(|w| w[0] < w[1]) {
            return invalid(format!(
                "tier intervals must strictly increase from active to inactive, got {intervals:?}"
            ));
        }
        for tier in ActivityTier::ALL {
            if self.tiers.settings(tier).batch_size == 0 {
                return invalid(format!("batch size of tier {} must be at least 1", tier.as_str()));
            }
        }
        if self.tiers.attention_floor_ms > self.tiers.active.interval_ms {
            return invalid("attention floor may not exceed the active tier interval".into());
        }
        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return invalid("minBackoffMs must not exceed maxBackoffMs".into());
        }
        if !(1..=4).contains(&self.max_concurrent_batches) {
            return invalid(format!(
                "maxConcurrentBatches must be between 1 and 4, got {}",
                self.max_concurrent_batches
            ));
        }
        if self.gatekeeper.max_requests_per_minute == 0 {
            return invalid("maxRequestsPerMinute must be at least 1".into());
        }
        if self.gatekeeper.failure_threshold == 0 {
            return invalid("failureThreshold must be at least 1".into());
        }
        if self.gatekeeper.cooldown_ms > self.gatekeeper.max_cooldown_ms {
            return invalid("cooldownMs must not exceed maxCooldownMs".into());
        }
        if self.tick_ms == 0 {
            return invalid("tickMs must be at least 1".into());
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn roster_refresh(&self) -> Duration {
        Duration::from_millis(self.roster_refresh_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }

    pub fn max_future_skew(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_future_skew_ms as i64)
    }
}
