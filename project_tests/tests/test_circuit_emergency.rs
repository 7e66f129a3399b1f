//! Circuit breaker opening, emergency latching and the operator reset.

use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::time::Instant;

use lib_fleetsync::core::{CircuitState, Gatekeeper, GatekeeperConfig, Outcome};
use lib_fleetsync::{GateReason, Health, SyncError};
use project_tests::{device, executor, fast_config, position, FakeProvider};

#[test]
fn five_network_errors_open_the_circuit_before_any_call() {
    let mut gatekeeper = Gatekeeper::new(GatekeeperConfig {
        failure_threshold: 5,
        min_spacing_ms: 0,
        ..GatekeeperConfig::default()
    });
    let now = Instant::now();

    for _ in 0..5 {
        let permit = gatekeeper.acquire_at(now).expect("closed circuit admits");
        gatekeeper.report_at(permit, Outcome::Failure(GateReason::Network), Duration::from_millis(20), now);
    }

    assert_eq!(gatekeeper.circuit_state(), CircuitState::Open);
    let rejection = gatekeeper.acquire_at(now).expect_err("open circuit rejects");
    assert_eq!(rejection.reason, GateReason::CircuitOpen);
    assert!(rejection.retry_after > Duration::ZERO);
    assert_eq!(gatekeeper.metrics().rejected_circuit_open, 1);
}

#[tokio::test(start_paused = true)]
async fn failing_batches_latch_emergency_until_force_reset() {
    let mut config = fast_config();
    config.tiers.inactive.max_retries = 4;
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("v1", false)]);
    provider.set_positions(vec![position("v1", false, ChronoDuration::minutes(10))]);
    provider.set_cursor(Some(5_000));
    for _ in 0..5 {
        provider.push_page(Err(SyncError::Network("connection reset".into())));
    }
    let (executor, merger, _attention) = executor(config, provider.clone());

    let first = executor.run_cycle().await;

    assert_eq!(provider.position_calls().len(), 5);
    assert_eq!(first.health, Health::Critical);
    assert!(matches!(first.errors.as_slice(), [SyncError::Network(_)]));
    assert_eq!(first.cursor, 0);
    let core = executor.snapshot().await;
    assert_eq!(core.metrics.circuit, CircuitState::Open);
    assert!(core.emergency.active);
    assert!(core.paused);
    assert!(merger.latest().stale);
    assert_eq!(merger.latest().health, Health::Critical);

    // Latched: no provider traffic at all while in emergency mode.
    provider.clear_calls();
    tokio::time::advance(Duration::from_secs(3_600)).await;
    let second = executor.run_cycle().await;
    assert!(provider.calls().is_empty());
    assert_eq!(second.health, Health::Critical);

    executor.force_reset().await;
    let third = executor.run_cycle().await;

    let calls = provider.position_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, 0, "reset rewinds the cursor for a full resync");
    assert_eq!(third.health, Health::Healthy);
    assert!(third.errors.is_empty());
    assert_eq!(third.cursor, 5_000);
    assert!(!merger.latest().stale);
    assert!(!executor.snapshot().await.paused);
}

#[tokio::test(start_paused = true)]
async fn repeated_auth_failures_escalate_to_critical() {
    let mut config = fast_config();
    config.emergency.account_failure_cycles = 3;
    let provider = FakeProvider::new();
    for _ in 0..3 {
        provider.push_login(Err(SyncError::Auth("bad password".into())));
    }
    let (executor, _merger, _attention) = executor(config, provider.clone());

    let first = executor.run_cycle().await;
    assert_eq!(first.health, Health::Degraded);
    assert!(matches!(first.errors.as_slice(), [SyncError::Auth(_)]));

    executor.run_cycle().await;
    let third = executor.run_cycle().await;

    assert_eq!(third.health, Health::Critical);
    assert_eq!(executor.snapshot().await.metrics.circuit, CircuitState::Closed);
    assert_eq!(provider.calls().len(), 3, "only the three login attempts were made");
}
