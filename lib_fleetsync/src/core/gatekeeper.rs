//! # Request Gatekeeper
//!
//! Every outbound provider call must be admitted here first. The gatekeeper is
//! pure policy: it never performs I/O itself, it only decides and keeps score.
//!
//! ## Admission
//!
//! - **Rolling window**: at most `max_requests_per_minute` admissions in any
//!   `window_ms` span, and at least `min_spacing_ms` between two admissions.
//! - **Circuit breaker**:
//!
//! ```text
//! Closed   --[N consecutive failures | error rate >= threshold]--> Open
//! Open     --[cool-down elapsed, next acquire]--------------------> HalfOpen (one trial permit)
//! HalfOpen --[trial succeeds]---------------------------------------> Closed (cool-down reset)
//! HalfOpen --[trial fails]------------------------------------------> Open (cool-down doubled, capped)
//! ```
//!
//! Callers choose between rejecting (`acquire`) and queueing
//! (`acquire_queued`) when the budget is exhausted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::errors::GateReason;

/// Tuning for the rate window and the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatekeeperConfig {
    pub max_requests_per_minute: u32,
    pub min_spacing_ms: u64,
    pub window_ms: u64,
    /// Consecutive breaker-relevant failures that open the circuit.
    pub failure_threshold: u32,
    /// Failure fraction inside the window that opens the circuit.
    pub error_rate_threshold: f64,
    /// Outcomes needed in the window before the error rate is trusted.
    pub min_samples: usize,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            min_spacing_ms: 500,
            window_ms: 60_000,
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            min_samples: 10,
            cooldown_ms: 30_000,
            max_cooldown_ms: 600_000,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Proof of admission. Must be handed back through [`Gatekeeper::report`].
#[derive(Debug)]
pub struct Permit {
    id: u64,
    trial: bool,
    issued_at: Instant,
}

impl Permit {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True for the single trial call admitted while half-open.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// Refusal to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: GateReason,
    /// Earliest moment a new attempt could be admitted.
    pub retry_after: Duration,
}

/// Result of an admitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(GateReason),
}

/// Read-only view of the gatekeeper's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetrics {
    /// Admissions inside the current rolling window.
    pub window_requests: usize,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub rejected_throttled: u64,
    pub rejected_circuit_open: u64,
    /// Exponentially weighted average latency of reported calls.
    pub avg_latency_ms: f64,
    /// Outcomes recorded inside the rolling window.
    pub window_samples: usize,
    /// Success fraction inside the window, `None` without samples.
    pub window_success_rate: Option<f64>,
    pub circuit: CircuitState,
    pub current_cooldown_ms: u64,
    pub last_failure: Option<GateReason>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

/// Rate limiter plus circuit breaker for the provider account.
#[derive(Debug)]
pub struct Gatekeeper {
    config: GatekeeperConfig,
    admissions: VecDeque<Instant>,
    /// Outcomes inside the window; `None` marks a success.
    outcomes: VecDeque<(Instant, Option<GateReason>)>,
    last_admission: Option<Instant>,
    breaker: Breaker,
    next_permit: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    rejected_throttled: u64,
    rejected_circuit_open: u64,
    avg_latency_ms: f64,
    last_failure: Option<GateReason>,
}

const LATENCY_SMOOTHING: f64 = 0.2;

impl Gatekeeper {
    pub fn new(config: GatekeeperConfig) -> Self {
        let cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            config,
            admissions: VecDeque::new(),
            outcomes: VecDeque::new(),
            last_admission: None,
            breaker: Breaker {
                state: CircuitState::Closed,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
            },
            next_permit: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            rejected_throttled: 0,
            rejected_circuit_open: 0,
            avg_latency_ms: 0.0,
            last_failure: None,
        }
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// Tries to admit one call now.
    pub fn acquire(&mut self) -> Result<Permit, Rejection> {
        self.acquire_at(Instant::now())
    }

    /// Tries to admit one call at `now`.
    pub fn acquire_at(&mut self, now: Instant) -> Result<Permit, Rejection> {
        self.prune(now);

        // Circuit first: an open circuit rejects before the budget is touched.
        match self.breaker.state {
            CircuitState::Open => {
                let opened_at = self.breaker.opened_at.unwrap_or(now);
                let reopen_at = opened_at + self.breaker.cooldown;
                if now < reopen_at {
                    return Err(self.reject(GateReason::CircuitOpen, reopen_at - now));
                }
                self.breaker.state = CircuitState::HalfOpen;
                self.breaker.trial_in_flight = false;
                tracing::info!(
                    cooldown_ms = self.breaker.cooldown.as_millis() as u64,
                    "Circuit breaker half-open: admitting one trial call"
                );
            }
            CircuitState::HalfOpen if self.breaker.trial_in_flight => {
                return Err(self.reject(GateReason::CircuitOpen, self.breaker.cooldown));
            }
            _ => {}
        }

        let window = Duration::from_millis(self.config.window_ms);
        if self.admissions.len() >= self.config.max_requests_per_minute as usize {
            let oldest = self.admissions.front().copied().unwrap_or(now);
            let wait = (oldest + window).saturating_duration_since(now);
            return Err(self.reject(GateReason::Throttled, wait));
        }

        let spacing = Duration::from_millis(self.config.min_spacing_ms);
        if let Some(last) = self.last_admission {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < spacing {
                return Err(self.reject(GateReason::Throttled, spacing - elapsed));
            }
        }

        let trial = self.breaker.state == CircuitState::HalfOpen;
        if trial {
            self.breaker.trial_in_flight = true;
        }
        self.admissions.push_back(now);
        self.last_admission = Some(now);
        self.next_permit += 1;

        Ok(Permit {
            id: self.next_permit,
            trial,
            issued_at: now,
        })
    }

    /// Admits one call, sleeping through `throttled` rejections as long as the
    /// total wait stays within `max_wait`.
    ///
    /// `circuit-open` is never waited on.
    pub async fn acquire_queued(&mut self, max_wait: Duration) -> Result<Permit, Rejection> {
        let mut waited = Duration::ZERO;
        loop {
            match self.acquire() {
                Ok(permit) => return Ok(permit),
                Err(rejection)
                    if rejection.reason == GateReason::Throttled
                        && waited + rejection.retry_after <= max_wait =>
                {
                    tracing::debug!(
                        wait_ms = rejection.retry_after.as_millis() as u64,
                        "Gatekeeper queueing request"
                    );
                    tokio::time::sleep(rejection.retry_after).await;
                    waited += rejection.retry_after;
                }
                Err(rejection) => return Err(rejection),
            }
        }
    }

    /// Records the outcome of an admitted call.
    pub fn report(&mut self, permit: Permit, outcome: Outcome, latency: Duration) {
        self.report_at(permit, outcome, latency, Instant::now());
    }

    /// Records the outcome of an admitted call at `now`.
    pub fn report_at(&mut self, permit: Permit, outcome: Outcome, latency: Duration, now: Instant) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.successes + self.failures == 0 {
            latency_ms
        } else {
            self.avg_latency_ms + LATENCY_SMOOTHING * (latency_ms - self.avg_latency_ms)
        };

        self.prune(now);
        let failure = match outcome {
            Outcome::Success => None,
            Outcome::Failure(reason) => Some(reason),
        };
        self.outcomes.push_back((now, failure));

        match outcome {
            Outcome::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
            }
            Outcome::Failure(reason) => {
                self.failures += 1;
                self.last_failure = Some(reason);
                if reason.trips_breaker() {
                    self.consecutive_failures += 1;
                }
                tracing::warn!(
                    permit = permit.id,
                    reason = reason.as_str(),
                    consecutive = self.consecutive_failures,
                    latency_ms = latency_ms as u64,
                    "Provider call failed"
                );
            }
        }

        if permit.trial {
            self.breaker.trial_in_flight = false;
            match outcome {
                Outcome::Failure(reason) if reason.trips_breaker() => {
                    let doubled = self.breaker.cooldown.saturating_mul(2);
                    let cap = Duration::from_millis(self.config.max_cooldown_ms);
                    self.breaker.cooldown = doubled.min(cap);
                    self.open(now, "trial call failed");
                }
                _ => self.close(),
            }
            return;
        }

        if self.breaker.state != CircuitState::Closed {
            return;
        }

        if self.consecutive_failures >= self.config.failure_threshold {
            self.open(now, "consecutive failure threshold reached");
        } else if failure.is_some_and(|r| r.trips_breaker()) {
            if let Some(rate) = self.failure_rate() {
                if rate >= self.config.error_rate_threshold {
                    self.open(now, "error rate threshold reached");
                }
            }
        }
    }

    /// Clears every counter and closes the circuit.
    pub fn reset(&mut self) {
        *self = Gatekeeper::new(self.config.clone());
        tracing::info!("Gatekeeper reset: metrics cleared, circuit closed");
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state
    }

    pub fn metrics(&self) -> RequestMetrics {
        let window_samples = self.outcomes.len();
        let window_success_rate = if window_samples == 0 {
            None
        } else {
            let ok = self.outcomes.iter().filter(|(_, failure)| failure.is_none()).count();
            Some(ok as f64 / window_samples as f64)
        };
        RequestMetrics {
            window_requests: self.admissions.len(),
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            rejected_throttled: self.rejected_throttled,
            rejected_circuit_open: self.rejected_circuit_open,
            avg_latency_ms: self.avg_latency_ms,
            window_samples,
            window_success_rate,
            circuit: self.breaker.state,
            current_cooldown_ms: self.breaker.cooldown.as_millis() as u64,
            last_failure: self.last_failure,
        }
    }

    fn failure_rate(&self) -> Option<f64> {
        if self.outcomes.len() < self.config.min_samples.max(1) {
            return None;
        }
        let failed = self
            .outcomes
            .iter()
            .filter(|(_, failure)| failure.is_some_and(|r| r.trips_breaker()))
            .count();
        Some(failed as f64 / self.outcomes.len() as f64)
    }

    fn reject(&mut self, reason: GateReason, retry_after: Duration) -> Rejection {
        match reason {
            GateReason::CircuitOpen => self.rejected_circuit_open += 1,
            _ => self.rejected_throttled += 1,
        }
        tracing::debug!(
            reason = reason.as_str(),
            retry_after_ms = retry_after.as_millis() as u64,
            "Gatekeeper rejected request"
        );
        Rejection { reason, retry_after }
    }

    fn open(&mut self, now: Instant, why: &str) {
        self.breaker.state = CircuitState::Open;
        self.breaker.opened_at = Some(now);
        self.breaker.trial_in_flight = false;
        tracing::warn!(
            cooldown_ms = self.breaker.cooldown.as_millis() as u64,
            consecutive_failures = self.consecutive_failures,
            "Circuit breaker OPEN: {}",
            why
        );
    }

    fn close(&mut self) {
        self.breaker.state = CircuitState::Closed;
        self.breaker.opened_at = None;
        self.breaker.cooldown = Duration::from_millis(self.config.cooldown_ms);
        self.consecutive_failures = 0;
        // A fresh start: failures from before the outage must not re-trip the rate rule.
        self.outcomes.clear();
        tracing::info!("Circuit breaker closed");
    }

    fn prune(&mut self, now: Instant) {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some(front) = self.admissions.front() {
            if now.saturating_duration_since(*front) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
        while let Some((at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(*at) >= window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatekeeperConfig {
        GatekeeperConfig {
            max_requests_per_minute: 100,
            min_spacing_ms: 0,
            window_ms: 60_000,
            failure_threshold: 5,
            error_rate_threshold: 0.9,
            min_samples: 20,
            cooldown_ms: 1_000,
            max_cooldown_ms: 3_000,
        }
    }

    fn fail(gk: &mut Gatekeeper, now: Instant) {
        let permit = gk.acquire_at(now).expect("admitted");
        gk.report_at(permit, Outcome::Failure(GateReason::Network), Duration::from_millis(5), now);
    }

    #[test]
    fn budget_rejects_once_window_is_full() {
        let mut gk = Gatekeeper::new(GatekeeperConfig {
            max_requests_per_minute: 3,
            ..config()
        });
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(gk.acquire_at(t0 + Duration::from_millis(i)).is_ok());
        }
        let rejection = gk.acquire_at(t0 + Duration::from_secs(1)).unwrap_err();
        assert_eq!(rejection.reason, GateReason::Throttled);
        assert_eq!(rejection.retry_after, Duration::from_secs(59));

        // The oldest admission falls out of the window.
        assert!(gk.acquire_at(t0 + Duration::from_secs(60)).is_ok());
        assert_eq!(gk.metrics().rejected_throttled, 1);
    }

    #[test]
    fn minimum_spacing_is_enforced() {
        let mut gk = Gatekeeper::new(GatekeeperConfig {
            min_spacing_ms: 250,
            ..config()
        });
        let t0 = Instant::now();
        assert!(gk.acquire_at(t0).is_ok());
        let rejection = gk.acquire_at(t0 + Duration::from_millis(100)).unwrap_err();
        assert_eq!(rejection.reason, GateReason::Throttled);
        assert_eq!(rejection.retry_after, Duration::from_millis(150));
        assert!(gk.acquire_at(t0 + Duration::from_millis(250)).is_ok());
    }

    #[test]
    fn opens_after_exactly_the_failure_threshold() {
        let mut gk = Gatekeeper::new(config());
        let t0 = Instant::now();
        for i in 0..4 {
            fail(&mut gk, t0 + Duration::from_millis(i));
            assert_eq!(gk.circuit_state(), CircuitState::Closed);
        }
        fail(&mut gk, t0 + Duration::from_millis(4));
        assert_eq!(gk.circuit_state(), CircuitState::Open);

        let rejection = gk.acquire_at(t0 + Duration::from_millis(10)).unwrap_err();
        assert_eq!(rejection.reason, GateReason::CircuitOpen);
        assert_eq!(gk.metrics().rejected_circuit_open, 1);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let mut gk = Gatekeeper::new(config());
        let t0 = Instant::now();
        for i in 0..5 {
            fail(&mut gk, t0 + Duration::from_millis(i));
        }
        let opened = t0 + Duration::from_millis(4);

        // Still cooling down.
        assert!(gk.acquire_at(opened + Duration::from_millis(999)).is_err());

        let trial = gk.acquire_at(opened + Duration::from_secs(1)).expect("trial");
        assert!(trial.is_trial());
        assert_eq!(gk.circuit_state(), CircuitState::HalfOpen);
        let second = gk.acquire_at(opened + Duration::from_millis(1_001)).unwrap_err();
        assert_eq!(second.reason, GateReason::CircuitOpen);

        gk.report_at(trial, Outcome::Success, Duration::from_millis(20), opened + Duration::from_secs(2));
        assert_eq!(gk.circuit_state(), CircuitState::Closed);
        assert_eq!(gk.metrics().consecutive_failures, 0);
    }

    #[test]
    fn failed_trial_doubles_cooldown_up_to_cap() {
        let mut gk = Gatekeeper::new(config());
        let mut now = Instant::now();
        for _ in 0..5 {
            fail(&mut gk, now);
        }
        let expected = [2_000u64, 3_000, 3_000];
        for cooldown_ms in expected {
            now += Duration::from_millis(gk.metrics().current_cooldown_ms);
            let trial = gk.acquire_at(now).expect("trial admitted");
            gk.report_at(trial, Outcome::Failure(GateReason::Network), Duration::ZERO, now);
            assert_eq!(gk.circuit_state(), CircuitState::Open);
            assert_eq!(gk.metrics().current_cooldown_ms, cooldown_ms);
        }
    }

    #[test]
    fn auth_failures_do_not_trip_the_breaker() {
        let mut gk = Gatekeeper::new(config());
        let t0 = Instant::now();
        for i in 0..10 {
            let permit = gk.acquire_at(t0 + Duration::from_millis(i)).unwrap();
            gk.report_at(permit, Outcome::Failure(GateReason::Auth), Duration::ZERO, t0);
        }
        assert_eq!(gk.circuit_state(), CircuitState::Closed);
        assert_eq!(gk.metrics().failures, 10);
    }

    #[test]
    fn error_rate_opens_without_consecutive_run() {
        let mut gk = Gatekeeper::new(GatekeeperConfig {
            error_rate_threshold: 0.5,
            min_samples: 6,
            ..config()
        });
        let t0 = Instant::now();
        for i in 0..6u64 {
            let permit = gk.acquire_at(t0 + Duration::from_millis(i)).unwrap();
            let outcome = if i % 2 == 0 {
                Outcome::Success
            } else {
                Outcome::Failure(GateReason::ServerError)
            };
            gk.report_at(permit, outcome, Duration::ZERO, t0 + Duration::from_millis(i));
        }
        assert_eq!(gk.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn reset_clears_everything() {
        let mut gk = Gatekeeper::new(config());
        let t0 = Instant::now();
        for i in 0..5 {
            fail(&mut gk, t0 + Duration::from_millis(i));
        }
        gk.reset();
        let m = gk.metrics();
        assert_eq!(m.circuit, CircuitState::Closed);
        assert_eq!(m.failures, 0);
        assert_eq!(m.window_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_acquire_waits_out_spacing() {
        let mut gk = Gatekeeper::new(GatekeeperConfig {
            min_spacing_ms: 200,
            ..config()
        });
        gk.acquire().unwrap();
        let started = Instant::now();
        let permit = gk.acquire_queued(Duration::from_secs(1)).await;
        assert!(permit.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(200));

        // A wait longer than allowed is refused immediately.
        let refused = gk.acquire_queued(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(refused.reason, GateReason::Throttled);
    }
}
