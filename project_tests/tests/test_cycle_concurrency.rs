//! Single-writer discipline: overlapping cycles are skipped and a reset waits
//! for the cycle in flight.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

use project_tests::{device, executor, fast_config, position, FakeProvider};

async fn wait_for_first_fetch(provider: &FakeProvider) {
    for _ in 0..1_000 {
        if !provider.position_calls().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cycle never reached lastposition");
}

#[tokio::test(start_paused = true)]
async fn overlapping_cycle_is_skipped() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", true)]);
    provider.set_positions(vec![position("a", false, ChronoDuration::minutes(3))]);
    provider.set_cursor(Some(500));
    provider.set_position_delay(Duration::from_secs(5));
    let (executor, _merger, _attention) = executor(fast_config(), provider.clone());

    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.run_cycle().await })
    };
    wait_for_first_fetch(&provider).await;
    let calls_before = provider.calls().len();

    let overlapping = executor.run_cycle().await;

    assert!(overlapping.skipped_cycle);
    assert_eq!(overlapping.devices_processed, 0);
    assert_eq!(provider.calls().len(), calls_before);

    let finished = running.await.unwrap();
    assert!(!finished.skipped_cycle);
    assert_eq!(finished.devices_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn force_reset_runs_after_the_cycle_in_flight() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", true)]);
    provider.set_positions(vec![position("a", false, ChronoDuration::minutes(3))]);
    provider.set_cursor(Some(500));
    provider.set_position_delay(Duration::from_secs(5));
    let (executor, _merger, _attention) = executor(fast_config(), provider.clone());

    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.run_cycle().await })
    };
    wait_for_first_fetch(&provider).await;

    let reset = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.force_reset().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reset.is_finished(), "reset must wait for the running cycle");

    let finished = running.await.unwrap();
    assert_eq!(finished.cursor, 500);
    reset.await.unwrap();

    assert_eq!(executor.snapshot().await.cursor, 0);
}
