//! # Sync Engine
//!
//! Owns the control loop and wires the executor, the state merger and the
//! attention registry together. Hosts talk to a running engine through a
//! cloneable [`EngineHandle`].
//!
//! ## Control loop
//!
//! One task per engine. It wakes on the tick or on a nudge (priority sync),
//! runs a cycle to completion and publishes an [`EngineStatus`] on a watch
//! channel. Stopping cancels the loop between cycles: a cycle that is already
//! running always finishes, so the cursor is never left half-committed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::configs::{ConfigError, CredentialStore, Credentials, SyncConfig};
use crate::connections::{SnapshotCache, TelemetrySink};
use crate::core::attention::AttentionRegistry;
use crate::core::emergency::Health;
use crate::core::errors::SyncError;
use crate::core::executor::{CycleResult, SyncExecutor};
use crate::core::gatekeeper::RequestMetrics;
use crate::core::merger::{LiveState, StateMerger};
use crate::core::model::DeviceId;
use crate::provider::TrackingProvider;

/// Everything a consumer needs to judge how fresh and trustworthy the data is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub health: Health,
    /// Emergency mode is latched; only a force reset lifts it.
    pub emergency: bool,
    pub reason: Option<String>,
    /// Set when credentials are missing or invalid. No provider calls are made.
    pub config_error: Option<String>,
    pub metrics: Option<RequestMetrics>,
    pub cursor: i64,
    pub paused: bool,
    pub running: bool,
    pub stale: bool,
    pub scheduled_devices: usize,
    pub attention_sessions: usize,
    pub subscribers: usize,
    pub last_cycle: Option<CycleResult>,
}

struct Shared {
    executor: SyncExecutor,
    attention: Arc<AttentionRegistry>,
    merger: Arc<StateMerger>,
    status: watch::Sender<EngineStatus>,
    nudge: Notify,
    running: AtomicBool,
}

impl Shared {
    async fn publish_status(&self) {
        let core = self.executor.snapshot().await;
        let latest = self.merger.latest();
        let status = EngineStatus {
            health: core.emergency.health,
            emergency: core.emergency.active,
            reason: core.emergency.reason.clone(),
            config_error: self.executor.config_error().map(|e| e.to_string()),
            metrics: Some(core.metrics),
            cursor: core.cursor,
            paused: core.paused,
            running: self.running.load(Ordering::Acquire),
            stale: latest.stale,
            scheduled_devices: core.scheduled_devices,
            attention_sessions: self.attention.session_count(),
            subscribers: self.merger.subscriber_count(),
            last_cycle: core.last_cycle,
        };
        self.status.send_replace(status);
    }
}

/// Collects the engine's collaborators.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    provider: Arc<dyn TrackingProvider>,
    credentials: Result<Credentials, ConfigError>,
    sink: Option<Arc<dyn TelemetrySink>>,
    cache: Option<Arc<dyn SnapshotCache>>,
}

impl SyncEngineBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Ok(credentials);
        self
    }

    /// Takes an already loaded result. A failure is kept and reported in the
    /// engine status rather than aborting the build.
    pub fn credentials_from(mut self, loaded: Result<Credentials, ConfigError>) -> Self {
        self.credentials = loaded;
        self
    }

    pub fn credential_store(self, store: &dyn CredentialStore) -> Self {
        let loaded = store.load();
        self.credentials_from(loaded)
    }

    pub fn sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Builds the engine. Only invalid tuning is an error here.
    pub fn build(self) -> Result<SyncEngine, ConfigError> {
        self.config.validate()?;

        let credentials = self
            .credentials
            .and_then(|c| c.validate().map(|_| c))
            .map_err(|e| {
                tracing::error!(error = %e, "Credentials unusable, engine will not contact the provider");
                SyncError::from(e)
            });

        let merger = Arc::new(StateMerger::new(
            self.config.activity.clone(),
            self.config.subscriber_buffer,
        ));
        let attention = Arc::new(AttentionRegistry::new());
        let mut executor = SyncExecutor::new(
            self.config,
            credentials,
            self.provider,
            Arc::clone(&merger),
            Arc::clone(&attention),
        );
        if let Some(sink) = self.sink {
            executor = executor.with_sink(sink);
        }
        if let Some(cache) = self.cache {
            executor = executor.with_cache(cache);
        }

        let initial = EngineStatus {
            config_error: executor.config_error().map(|e| e.to_string()),
            ..EngineStatus::default()
        };
        let (status, _) = watch::channel(initial);

        Ok(SyncEngine {
            shared: Arc::new(Shared {
                executor,
                attention,
                merger,
                status,
                nudge: Notify::new(),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
            restored: AtomicBool::new(false),
        })
    }
}

/// The running control loop and the token that stops it.
struct LoopTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    task: Mutex<Option<LoopTask>>,
    /// The cache is only read on the first start; later starts keep live state.
    restored: AtomicBool,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig, provider: Arc<dyn TrackingProvider>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            provider,
            credentials: Err(ConfigError::InvalidCredentials("no credentials configured".into())),
            sink: None,
            cache: None,
        }
    }

    /// A handle that works whether or not the loop is running.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Restores the cached snapshot and spawns the control loop.
    ///
    /// Calling it on a running engine just returns another handle. A stopped
    /// engine can be started again; cursor, metrics and state carry over.
    pub async fn start(&self) -> EngineHandle {
        {
            let task = self.task.lock().unwrap_or_else(|p| p.into_inner());
            if task.is_some() {
                return self.handle();
            }
        }

        let shared = Arc::clone(&self.shared);
        if !self.restored.swap(true, Ordering::AcqRel) {
            shared.executor.restore_from_cache().await;
        }
        shared.running.store(true, Ordering::Release);
        shared.publish_status().await;

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let tick = shared.executor.config().tick();
        let loop_shared = Arc::clone(&shared);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(tick_ms = tick.as_millis() as u64, "Sync engine started");

            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    _ = loop_shared.nudge.notified() => {
                        tracing::debug!("Control loop nudged");
                    }
                    _ = ticker.tick() => {}
                }
                // Runs outside the select so a stop never interrupts a cycle.
                loop_shared.executor.run_cycle().await;
                loop_shared.publish_status().await;
            }

            loop_shared.running.store(false, Ordering::Release);
            loop_shared.publish_status().await;
            tracing::info!("Sync engine stopped");
        });

        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(LoopTask { cancel, join });
        self.handle()
    }

    /// Stops the loop and waits for the in-flight cycle, if any.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(LoopTask { cancel, join }) = task {
            cancel.cancel();
            if let Err(e) = join.await {
                tracing::error!(error = %e, "Control loop task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

/// Cheap, cloneable access to a sync engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn latest_state(&self) -> Arc<LiveState> {
        self.shared.merger.latest()
    }

    /// Receives every published snapshot, starting with the current one.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<LiveState>>) {
        self.shared.merger.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.merger.unsubscribe(id)
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status.subscribe()
    }

    /// Operator reset. Waits for a running cycle, then resets and wakes the loop.
    pub async fn force_reset(&self) {
        self.shared.executor.force_reset().await;
        self.shared.publish_status().await;
        self.shared.nudge.notify_one();
    }

    /// Polls `device_ids` on the next cycle and wakes the loop for it.
    pub fn force_vehicle_update(&self, device_ids: &[DeviceId]) {
        self.shared.attention.request_priority_sync(device_ids);
        self.shared.nudge.notify_one();
    }

    pub fn register_attention(&self, session_id: &str, device_ids: Vec<DeviceId>, realtime: bool) {
        self.shared.attention.register(session_id, device_ids, realtime);
    }

    pub fn unregister_attention(&self, session_id: &str) -> bool {
        self.shared.attention.unregister(session_id)
    }

    pub fn set_assignments(&self, assignments: HashMap<DeviceId, bool>) {
        self.shared.executor.set_assignments(assignments);
    }

    /// Runs a cycle right now, outside the tick. Skips if one is running.
    pub async fn run_cycle_now(&self) -> CycleResult {
        let result = self.shared.executor.run_cycle().await;
        if !result.skipped_cycle {
            self.shared.publish_status().await;
        }
        result
    }
}
