//! # Emergency / Degradation Manager
//!
//! Turns gatekeeper metrics and account-wide failures into a `Health` verdict.
//!
//! ```text
//! healthy  --[success rate < degraded | circuit half-open | account failure]--> degraded
//! any      --[circuit open | success rate < critical | sustained account failures]--> critical (latched)
//! critical --[force_reset() only]--> healthy
//! ```
//!
//! Critical is latched on purpose: automatic recovery would let a flapping
//! provider pull the engine in and out of emergency mode on every cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::SyncError;
use crate::core::gatekeeper::{CircuitState, RequestMetrics};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencyConfig {
    /// Window success rate below which the engine reports degraded.
    pub degraded_success_rate: f64,
    /// Window success rate below which emergency mode is entered.
    pub critical_success_rate: f64,
    /// Outcomes required in the window before the success rate is judged.
    pub min_samples: usize,
    /// Consecutive cycles ending in an account-wide failure before emergency mode.
    pub account_failure_cycles: u32,
    /// Consecutive cycles that left due devices unfetched for lack of rate
    /// budget before the engine reports degraded. Zero disables the rule.
    pub starved_cycles: u32,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            degraded_success_rate: 0.8,
            critical_success_rate: 0.5,
            min_samples: 5,
            account_failure_cycles: 3,
            starved_cycles: 3,
        }
    }
}

/// Snapshot of the manager for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStatus {
    pub health: Health,
    pub active: bool,
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub account_failures: u32,
    pub starved_cycles: u32,
}

#[derive(Debug)]
pub struct EmergencyManager {
    config: EmergencyConfig,
    health: Health,
    active: bool,
    reason: Option<String>,
    since: Option<DateTime<Utc>>,
    account_failures: u32,
    last_account_error: Option<String>,
    starved_cycles: u32,
}

impl EmergencyManager {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            config,
            health: Health::Healthy,
            active: false,
            reason: None,
            since: None,
            account_failures: 0,
            last_account_error: None,
            starved_cycles: 0,
        }
    }

    /// Notes a cycle that ended on an auth, config or circuit-open failure.
    pub fn record_account_failure(&mut self, error: &SyncError) {
        self.account_failures += 1;
        self.last_account_error = Some(error.to_string());
        tracing::warn!(
            consecutive = self.account_failures,
            error = %error,
            "Account-wide failure reported to emergency manager"
        );
    }

    /// Notes a cycle that reached the provider without an account-wide failure.
    pub fn record_cycle_success(&mut self) {
        self.account_failures = 0;
        self.last_account_error = None;
    }

    /// Notes whether the finished cycle ran out of rate budget before every
    /// due device was fetched.
    pub fn record_budget(&mut self, starved: bool) {
        if starved {
            self.starved_cycles += 1;
            tracing::debug!(consecutive = self.starved_cycles, "Cycle starved by the rate budget");
        } else {
            self.starved_cycles = 0;
        }
    }

    /// Re-evaluates health from the latest gatekeeper metrics.
    pub fn evaluate(&mut self, metrics: &RequestMetrics) -> Health {
        self.evaluate_at(metrics, Utc::now())
    }

    pub fn evaluate_at(&mut self, metrics: &RequestMetrics, now: DateTime<Utc>) -> Health {
        if self.active {
            return Health::Critical;
        }

        let judged_rate = metrics
            .window_success_rate
            .filter(|_| metrics.window_samples >= self.config.min_samples.max(1));

        let (health, reason) = if metrics.circuit == CircuitState::Open {
            (Health::Critical, Some("circuit breaker open".to_string()))
        } else if judged_rate.is_some_and(|r| r < self.config.critical_success_rate) {
            (
                Health::Critical,
                judged_rate.map(|r| format!("success rate {:.0}% below critical threshold", r * 100.0)),
            )
        } else if self.config.account_failure_cycles > 0
            && self.account_failures >= self.config.account_failure_cycles
        {
            (
                Health::Critical,
                Some(format!(
                    "{} consecutive account-wide failures: {}",
                    self.account_failures,
                    self.last_account_error.as_deref().unwrap_or("unknown")
                )),
            )
        } else if metrics.circuit == CircuitState::HalfOpen {
            (Health::Degraded, Some("circuit breaker half-open".to_string()))
        } else if judged_rate.is_some_and(|r| r < self.config.degraded_success_rate) {
            (
                Health::Degraded,
                judged_rate.map(|r| format!("success rate {:.0}% below degraded threshold", r * 100.0)),
            )
        } else if self.account_failures > 0 {
            (Health::Degraded, self.last_account_error.clone())
        } else if self.config.starved_cycles > 0 && self.starved_cycles >= self.config.starved_cycles {
            (
                Health::Degraded,
                Some(format!(
                    "{} consecutive cycles short of rate budget ({} throttled rejections)",
                    self.starved_cycles, metrics.rejected_throttled
                )),
            )
        } else {
            (Health::Healthy, None)
        };

        if health != self.health {
            match health {
                Health::Critical => {
                    tracing::error!(reason = reason.as_deref().unwrap_or(""), "Entering EMERGENCY mode")
                }
                Health::Degraded => {
                    tracing::warn!(reason = reason.as_deref().unwrap_or(""), "Engine degraded")
                }
                Health::Healthy => tracing::info!("Engine healthy"),
            }
            self.since = Some(now);
        }
        if health == Health::Critical {
            self.active = true;
        }
        self.health = health;
        self.reason = reason;
        health
    }

    /// Operator escape hatch: leaves emergency mode and forgets failure history.
    pub fn force_reset(&mut self) {
        tracing::warn!(was_active = self.active, "Emergency manager force reset");
        *self = EmergencyManager::new(self.config.clone());
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn status(&self) -> EmergencyStatus {
        EmergencyStatus {
            health: self.health,
            active: self.active,
            reason: self.reason.clone(),
            since: self.since,
            account_failures: self.account_failures,
            starved_cycles: self.starved_cycles,
        }
    }
}
