//! # Test Doubles
//!
//! Shared fixtures for the integration suite under `tests/`: a scripted
//! `TrackingProvider` that records every call, an in-memory snapshot cache and
//! small builders for devices, positions and configs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lib_fleetsync::core::{AttentionRegistry, StateMerger, SyncExecutor};
use lib_fleetsync::provider::PositionPage;
use lib_fleetsync::{
    Credentials, Device, DeviceId, LiveState, Position, SinkError, SnapshotCache, SyncConfig, SyncError,
    TrackingProvider,
};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Login,
    MonitorList,
    LastPosition { device_ids: Vec<DeviceId>, cursor: i64 },
}

#[derive(Default)]
struct Script {
    devices: Vec<Device>,
    positions: HashMap<DeviceId, Position>,
    cursor: Option<i64>,
    logins: VecDeque<Result<String, SyncError>>,
    rosters: VecDeque<Result<Vec<Device>, SyncError>>,
    pages: VecDeque<Result<PositionPage, SyncError>>,
    position_delay: Duration,
    calls: Vec<Call>,
    login_count: u32,
}

/// Provider whose answers are set up front by the test.
///
/// Queued results are consumed first; once a queue is empty the provider falls
/// back to the standing roster, positions and cursor.
#[derive(Default)]
pub struct FakeProvider {
    script: Mutex<Script>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.script().devices = devices;
    }

    /// Replaces the standing positions. Only requested devices are returned.
    pub fn set_positions(&self, positions: Vec<Position>) {
        self.script().positions = positions.into_iter().map(|p| (p.device_id.clone(), p)).collect();
    }

    pub fn set_cursor(&self, cursor: Option<i64>) {
        self.script().cursor = cursor;
    }

    pub fn push_login(&self, result: Result<String, SyncError>) {
        self.script().logins.push_back(result);
    }

    pub fn push_roster(&self, result: Result<Vec<Device>, SyncError>) {
        self.script().rosters.push_back(result);
    }

    pub fn push_page(&self, result: Result<PositionPage, SyncError>) {
        self.script().pages.push_back(result);
    }

    /// Every `lastposition` call sleeps this long first.
    pub fn set_position_delay(&self, delay: Duration) {
        self.script().position_delay = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    pub fn position_calls(&self) -> Vec<(Vec<DeviceId>, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::LastPosition { device_ids, cursor } => Some((device_ids, cursor)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }
}

impl TrackingProvider for FakeProvider {
    fn login<'a>(&'a self, _credentials: &'a Credentials) -> BoxFuture<'a, Result<String, SyncError>> {
        async move {
            let mut script = self.script();
            script.calls.push(Call::Login);
            script.login_count += 1;
            let count = script.login_count;
            script
                .logins
                .pop_front()
                .unwrap_or_else(|| Ok(format!("token-{count}")))
        }
        .boxed()
    }

    fn query_monitor_list<'a>(&'a self, _token: &'a str, _username: &'a str)
        -> BoxFuture<'a, Result<Vec<Device>, SyncError>> {
        async move {
            let mut script = self.script();
            script.calls.push(Call::MonitorList);
            let standing = script.devices.clone();
            script.rosters.pop_front().unwrap_or(Ok(standing))
        }
        .boxed()
    }

    fn last_position<'a>(
        &'a self,
        _token: &'a str,
        device_ids: &'a [DeviceId],
        cursor: i64,
    ) -> BoxFuture<'a, Result<PositionPage, SyncError>> {
        async move {
            let delay = {
                let mut script = self.script();
                script.calls.push(Call::LastPosition {
                    device_ids: device_ids.to_vec(),
                    cursor,
                });
                script.position_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script();
            if let Some(result) = script.pages.pop_front() {
                return result;
            }
            let positions = device_ids
                .iter()
                .filter_map(|id| script.positions.get(id).cloned())
                .collect();
            Ok(PositionPage {
                positions,
                rejected: Vec::new(),
                cursor: script.cursor,
            })
        }
        .boxed()
    }
}

/// Snapshot cache kept in memory.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<Option<LiveState>>,
    stores: Mutex<u32>,
}

impl MemoryCache {
    pub fn with_state(state: LiveState) -> Arc<Self> {
        let cache = Self::default();
        *cache.state.lock().unwrap_or_else(|p| p.into_inner()) = Some(state);
        Arc::new(cache)
    }

    pub fn stored(&self) -> Option<LiveState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn store_count(&self) -> u32 {
        *self.stores.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SnapshotCache for MemoryCache {
    fn load(&self) -> BoxFuture<'_, Result<Option<LiveState>, SinkError>> {
        async move { Ok(self.stored()) }.boxed()
    }

    fn store<'a>(&'a self, state: &'a LiveState) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            *self.state.lock().unwrap_or_else(|p| p.into_inner()) = Some(state.clone());
            *self.stores.lock().unwrap_or_else(|p| p.into_inner()) += 1;
            Ok(())
        }
        .boxed()
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        username: "fleet-ops".into(),
        password_hash: "5f4dcc3b5aa765d61d8327deb882cf99".into(),
        base_url: "http://tracker.invalid/".into(),
    }
}

pub fn device(id: &str, assigned: bool) -> Device {
    Device {
        id: id.into(),
        name: format!("Vehicle {id}"),
        device_type: 1,
        last_active: None,
        assigned,
        group: Some("default".into()),
    }
}

/// A valid fix `age` before now.
pub fn position(id: &str, moving: bool, age: ChronoDuration) -> Position {
    position_at(id, moving, Utc::now() - age)
}

pub fn position_at(id: &str, moving: bool, updated_at: DateTime<Utc>) -> Position {
    Position {
        device_id: id.into(),
        latitude: 48.85,
        longitude: 2.35,
        speed: if moving { 42.0 } else { 0.0 },
        heading: 90.0,
        moving,
        ignition: Some(moving),
        updated_at,
        fuel: None,
        temperature: None,
        voltage: None,
        alarm: None,
    }
}

/// Defaults without request spacing, so batch order is deterministic.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.gatekeeper.min_spacing_ms = 0;
    config
}

/// An executor wired to `provider`, plus its merger and attention registry.
pub fn executor(
    config: SyncConfig,
    provider: Arc<FakeProvider>,
) -> (Arc<SyncExecutor>, Arc<StateMerger>, Arc<AttentionRegistry>) {
    let merger = Arc::new(StateMerger::new(config.activity.clone(), config.subscriber_buffer));
    let attention = Arc::new(AttentionRegistry::new());
    let executor = SyncExecutor::new(
        config,
        Ok(credentials()),
        provider,
        Arc::clone(&merger),
        Arc::clone(&attention),
    );
    (Arc::new(executor), merger, attention)
}
