//! # Sync Error Taxonomy
//!
//! Every failure the engine can observe is one of these variants. The variant
//! decides three things: whether the attempt is retried, which reason is
//! reported to the gatekeeper, and whether it escalates past the current batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::configs::ConfigError;
use crate::connections::SinkError;
use crate::core::model::ValidationError;

/// Reason attached to every gatekeeper rejection and reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateReason {
    /// Request budget or minimum spacing would be exceeded.
    Throttled,
    /// Circuit breaker is open (or half-open with its trial in flight).
    CircuitOpen,
    /// Transport failure or timeout.
    Network,
    /// Credentials rejected or token expired.
    Auth,
    /// Provider answered with an error status or an unusable payload.
    ServerError,
}

impl GateReason {
    /// Stable string used in logs, metrics and the HTTP API.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::Throttled => "throttled",
            GateReason::CircuitOpen => "circuit-open",
            GateReason::Network => "network",
            GateReason::Auth => "auth",
            GateReason::ServerError => "server-error",
        }
    }

    /// Failures that count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, GateReason::Network | GateReason::ServerError)
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the provider client and the sync executor.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request rejected: {0}")]
    Throttled(GateReason),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider server error: {0}")]
    ServerError(String),

    #[error("provider returned status {status}: {message}")]
    Provider { status: i64, message: String },

    #[error("invalid position: {0}")]
    Validation(#[from] ValidationError),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SyncError {
    /// Reason reported to the gatekeeper for a failed admitted call.
    pub fn gate_reason(&self) -> GateReason {
        match self {
            SyncError::Auth(_) | SyncError::Config(_) => GateReason::Auth,
            SyncError::Throttled(reason) => *reason,
            SyncError::Network(_) => GateReason::Network,
            SyncError::ServerError(_)
            | SyncError::Provider { .. }
            | SyncError::Validation(_)
            | SyncError::Persistence(_) => GateReason::ServerError,
        }
    }

    /// Whether the executor may retry the same batch with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::ServerError(_) | SyncError::Provider { .. }
        )
    }

    /// Failures that affect the whole account rather than one batch.
    ///
    /// A throttled login or roster call means the budget is exhausted before
    /// any position could be fetched, so it counts too.
    pub fn is_account_wide(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Config(_)
                | SyncError::Throttled(GateReason::CircuitOpen | GateReason::Throttled)
        )
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl From<SinkError> for SyncError {
    fn from(e: SinkError) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_never_retried() {
        assert!(!SyncError::Auth("bad password".into()).is_retryable());
        assert!(SyncError::Network("timeout".into()).is_retryable());
        assert!(!SyncError::Throttled(GateReason::Throttled).is_retryable());
    }

    #[test]
    fn only_transport_and_server_failures_trip_the_breaker() {
        assert!(SyncError::Network("reset".into()).gate_reason().trips_breaker());
        assert!(SyncError::Provider { status: 1, message: "busy".into() }
            .gate_reason()
            .trips_breaker());
        assert!(!SyncError::Auth("expired".into()).gate_reason().trips_breaker());
    }

    #[test]
    fn budget_and_circuit_rejections_are_account_wide() {
        assert!(SyncError::Throttled(GateReason::Throttled).is_account_wide());
        assert!(SyncError::Throttled(GateReason::CircuitOpen).is_account_wide());
        assert!(!SyncError::Network("reset".into()).is_account_wide());
    }

    #[test]
    fn reasons_render_in_kebab_case() {
        assert_eq!(GateReason::CircuitOpen.to_string(), "circuit-open");
        assert_eq!(
            serde_json::to_string(&GateReason::ServerError).unwrap(),
            "\"server-error\""
        );
    }
}
