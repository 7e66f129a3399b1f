//! Incremental fetching: cursor commits, merge retention and position validation.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use lib_fleetsync::core::ValidationError;
use lib_fleetsync::provider::PositionPage;
use lib_fleetsync::SyncError;
use project_tests::{device, executor, fast_config, position, position_at, FakeProvider};

#[tokio::test(start_paused = true)]
async fn unchanged_devices_keep_their_prior_positions() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", false), device("b", false), device("c", false)]);
    provider.set_positions(vec![
        position("a", false, ChronoDuration::minutes(10)),
        position("b", false, ChronoDuration::minutes(10)),
        position("c", false, ChronoDuration::minutes(10)),
    ]);
    provider.set_cursor(Some(173_000));
    let (executor, merger, _attention) = executor(fast_config(), provider.clone());

    let first = executor.run_cycle().await;
    assert_eq!(first.cursor, 173_000);
    assert_eq!(first.positions_stored, 3);
    let before = merger.latest();

    // Only "b" changed since 173000.
    let mut moved = position("b", true, ChronoDuration::minutes(1));
    moved.latitude = 49.01;
    provider.set_positions(vec![moved.clone()]);
    provider.set_cursor(Some(174_500));
    provider.clear_calls();
    tokio::time::advance(Duration::from_secs(1_801)).await;

    let second = executor.run_cycle().await;

    let calls = provider.position_calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|(_, cursor)| *cursor == 173_000));
    assert_eq!(second.cursor, 174_500);
    assert_eq!(second.positions_stored, 1);

    let after = merger.latest();
    assert_eq!(after.position("a"), before.position("a"));
    assert_eq!(after.position("c"), before.position("c"));
    assert_eq!(after.position("b"), Some(&moved));
    assert!(after.sequence > before.sequence);
}

#[tokio::test(start_paused = true)]
async fn cursor_never_moves_backwards() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", false)]);
    provider.set_positions(vec![position("a", false, ChronoDuration::minutes(10))]);
    provider.set_cursor(Some(174_500));
    let (executor, _merger, _attention) = executor(fast_config(), provider.clone());
    executor.run_cycle().await;

    provider.set_cursor(Some(170_000));
    tokio::time::advance(Duration::from_secs(1_801)).await;
    let result = executor.run_cycle().await;

    assert_eq!(result.cursor, 174_500);
}

#[tokio::test(start_paused = true)]
async fn pages_without_a_cursor_leave_it_alone() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", false)]);
    provider.set_positions(vec![position("a", false, ChronoDuration::minutes(10))]);
    provider.set_cursor(None);
    let (executor, _merger, _attention) = executor(fast_config(), provider.clone());

    let result = executor.run_cycle().await;

    assert_eq!(result.positions_stored, 1);
    assert_eq!(result.cursor, 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_batch_holds_the_cursor() {
    let mut config = fast_config();
    config.tiers.inactive.batch_size = 1;
    config.tiers.inactive.max_retries = 0;
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", false), device("b", false)]);
    provider.push_page(Ok(PositionPage {
        positions: Vec::new(),
        rejected: Vec::new(),
        cursor: Some(9_000),
    }));
    provider.push_page(Err(SyncError::Provider {
        status: 3,
        message: "lastposition: busy".into(),
    }));
    let (executor, _merger, _attention) = executor(config, provider.clone());

    let result = executor.run_cycle().await;

    assert_eq!(result.devices_processed, 1);
    assert!(matches!(result.errors.as_slice(), [SyncError::Provider { status: 3, .. }]));
    assert_eq!(result.cursor, 0);

    // The abandoned device is fetched again from the same watermark.
    provider.clear_calls();
    let retry = executor.run_cycle().await;
    let calls = provider.position_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, 0);
    assert!(retry.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_positions_are_skipped_not_fatal() {
    let provider = FakeProvider::new();
    provider.set_devices(vec![device("ok", false), device("north", false), device("later", false)]);
    let mut off_globe = position("north", false, ChronoDuration::minutes(5));
    off_globe.latitude = 123.0;
    provider.set_positions(vec![
        position("ok", false, ChronoDuration::minutes(5)),
        off_globe,
        position_at("later", false, Utc::now() + ChronoDuration::hours(1)),
    ]);
    provider.set_cursor(Some(10));
    let (executor, merger, _attention) = executor(fast_config(), provider.clone());

    let result = executor.run_cycle().await;

    assert!(result.errors.is_empty());
    assert_eq!(result.positions_stored, 1);
    assert_eq!(result.skipped.len(), 2);
    let north = result.skipped.iter().find(|s| s.device_id == "north").unwrap();
    assert_eq!(north.reason, ValidationError::LatitudeOutOfRange(123.0));
    let later = result.skipped.iter().find(|s| s.device_id == "later").unwrap();
    assert!(matches!(later.reason, ValidationError::TimestampInFuture(_)));

    let state = merger.latest();
    assert!(state.position("ok").is_some());
    assert!(state.position("north").is_none());
    assert_eq!(result.cursor, 10);
}

#[tokio::test(start_paused = true)]
async fn durable_sink_receives_roster_and_valid_positions() {
    use lib_fleetsync::connections::MemorySink;
    use lib_fleetsync::core::{AttentionRegistry, StateMerger, SyncExecutor};
    use project_tests::credentials;
    use std::sync::Arc;

    let provider = FakeProvider::new();
    provider.set_devices(vec![device("a", true), device("b", false)]);
    let mut broken = position("b", false, ChronoDuration::minutes(10));
    broken.longitude = 181.0;
    provider.set_positions(vec![position("a", true, ChronoDuration::minutes(1)), broken]);
    provider.set_cursor(Some(9_000));

    let config = fast_config();
    let sink = Arc::new(MemorySink::new());
    let merger = Arc::new(StateMerger::new(config.activity.clone(), config.subscriber_buffer));
    let executor = SyncExecutor::new(
        config,
        Ok(credentials()),
        provider.clone(),
        merger,
        Arc::new(AttentionRegistry::new()),
    )
    .with_sink(sink.clone());

    let result = executor.run_cycle().await;

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    let mut ids: Vec<String> = sink.devices().into_iter().map(|d| d.id).collect();
    ids.sort();
    assert_eq!(ids, ["a", "b"]);
    let stored = sink.positions();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].device_id, "a");
}
