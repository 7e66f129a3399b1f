//! # Sync Executor
//!
//! Runs one polling cycle:
//!
//! 1. make sure a session token exists (one re-login per cycle at most)
//! 2. refresh the device roster when it is due
//! 3. ask the scheduler who is due, forced devices first
//! 4. fetch positions in tier-sized batches, a few in flight at a time, each
//!    attempt admitted by the gatekeeper
//! 5. merge, persist, commit the cursor, and let the emergency manager judge
//!
//! ## Single writer
//!
//! Gatekeeper, cursor, scheduler and emergency state live in one `SyncCore`
//! behind an async mutex. A cycle holds it from start to finish; a second
//! `run_cycle` that finds it taken returns at once with `skipped_cycle = true`.
//! `force_reset` waits for the lock, so it is serialized behind the running cycle.
//! Batch futures never touch the core: they return their results as values and
//! the cycle task applies them.

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryDecision, RetryPolicy};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use crate::configs::{Credentials, SyncConfig};
use crate::connections::{SnapshotCache, TelemetrySink};
use crate::core::attention::AttentionRegistry;
use crate::core::classifier::{ActivityTier, TierPolicy};
use crate::core::cursor::SyncCursor;
use crate::core::emergency::{EmergencyManager, EmergencyStatus, Health};
use crate::core::errors::{GateReason, SyncError};
use crate::core::gatekeeper::{Gatekeeper, Outcome, Permit, RequestMetrics};
use crate::core::merger::{validate_positions, StateMerger};
use crate::core::model::{Device, DeviceId, Position, SkippedPosition};
use crate::core::scheduler::{DueDevice, Scheduler};
use crate::provider::{PositionPage, TrackingProvider};

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    /// Devices whose batch completed successfully.
    pub devices_processed: usize,
    /// Validated positions merged into the live state.
    pub positions_stored: usize,
    /// Positions dropped by validation.
    pub skipped: Vec<SkippedPosition>,
    /// Devices that were due but not fetched because the rate budget ran out.
    pub deferred: Vec<DeviceId>,
    pub errors: Vec<SyncError>,
    /// Cursor after the cycle.
    pub cursor: i64,
    pub health: Health,
    pub roster_refreshed: bool,
    /// True when another cycle was already running and this call did nothing.
    pub skipped_cycle: bool,
}

impl CycleResult {
    fn skipped() -> Self {
        Self {
            skipped_cycle: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct SessionToken {
    value: String,
    acquired_at: Instant,
}

/// State mutated only by the cycle task (and by `force_reset`).
struct SyncCore {
    gatekeeper: Gatekeeper,
    cursor: SyncCursor,
    scheduler: Scheduler,
    emergency: EmergencyManager,
    token: Option<SessionToken>,
    last_roster_refresh: Option<Instant>,
    last_cycle: Option<CycleResult>,
}

/// Read-only view of the core for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSnapshot {
    pub metrics: RequestMetrics,
    pub cursor: i64,
    pub emergency: EmergencyStatus,
    pub paused: bool,
    pub scheduled_devices: usize,
    pub last_cycle: Option<CycleResult>,
}

#[derive(Debug, Clone)]
struct BatchJob {
    ids: Vec<DeviceId>,
    tier: ActivityTier,
    forced: bool,
    attempt: u32,
    max_retries: u32,
    /// Time already spent queueing for admission.
    waited: Duration,
}

enum BatchEvent {
    Finished {
        job: BatchJob,
        permit: Permit,
        started: Instant,
        result: Result<PositionPage, SyncError>,
    },
    Ready(BatchJob),
}

/// Everything the batch phase produced.
#[derive(Default)]
struct BatchOutcome {
    positions: Vec<Position>,
    rejected: Vec<SkippedPosition>,
    succeeded: Vec<DeviceId>,
    unserved_forced: Vec<DeviceId>,
    deferred: Vec<DeviceId>,
    errors: Vec<SyncError>,
    max_cursor: Option<i64>,
    abandoned: bool,
    account_failure: Option<SyncError>,
}

/// Splits the due list into batches. Consecutive devices of one tier share a
/// batch up to that tier's size, so the due-list order is preserved.
fn plan_batches(due: &[DueDevice], policy: &TierPolicy) -> Vec<BatchJob> {
    let mut jobs: Vec<BatchJob> = Vec::new();
    for d in due {
        let settings = policy.settings(d.tier);
        match jobs.last_mut() {
            Some(job) if job.tier == d.tier && job.ids.len() < settings.batch_size => {
                job.ids.push(d.device_id.clone());
                job.forced |= d.forced;
            }
            _ => jobs.push(BatchJob {
                ids: vec![d.device_id.clone()],
                tier: d.tier,
                forced: d.forced,
                attempt: 0,
                max_retries: settings.max_retries,
                waited: Duration::ZERO,
            }),
        }
    }
    jobs
}

pub struct SyncExecutor {
    core: tokio::sync::Mutex<SyncCore>,
    provider: Arc<dyn TrackingProvider>,
    merger: Arc<StateMerger>,
    attention: Arc<AttentionRegistry>,
    sink: Option<Arc<dyn TelemetrySink>>,
    cache: Option<Arc<dyn SnapshotCache>>,
    credentials: Result<Credentials, SyncError>,
    assignments: Mutex<HashMap<DeviceId, bool>>,
    assignments_dirty: AtomicBool,
    config: SyncConfig,
}

impl SyncExecutor {
    pub fn new(
        config: SyncConfig,
        credentials: Result<Credentials, SyncError>,
        provider: Arc<dyn TrackingProvider>,
        merger: Arc<StateMerger>,
        attention: Arc<AttentionRegistry>,
    ) -> Self {
        let core = SyncCore {
            gatekeeper: Gatekeeper::new(config.gatekeeper.clone()),
            cursor: SyncCursor::new(),
            scheduler: Scheduler::new(config.tiers.clone(), config.activity.clone()),
            emergency: EmergencyManager::new(config.emergency.clone()),
            token: None,
            last_roster_refresh: None,
            last_cycle: None,
        };
        Self {
            core: tokio::sync::Mutex::new(core),
            provider,
            merger,
            attention,
            sink: None,
            cache: None,
            credentials,
            assignments: Mutex::new(HashMap::new()),
            assignments_dirty: AtomicBool::new(false),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn merger(&self) -> &Arc<StateMerger> {
        &self.merger
    }

    /// The configuration problem that keeps the engine from syncing, if any.
    pub fn config_error(&self) -> Option<&SyncError> {
        self.credentials.as_ref().err()
    }

    /// Overrides the roster's assignment flag for the given devices.
    pub fn set_assignments(&self, assignments: HashMap<DeviceId, bool>) {
        let count = assignments.len();
        self.assignments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(assignments);
        self.assignments_dirty.store(true, Ordering::Release);
        tracing::info!(device_count = count, "Assignment overrides updated");
    }

    /// Loads the cached snapshot, if a cache is configured and holds one.
    pub async fn restore_from_cache(&self) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.load().await {
            Ok(Some(state)) => {
                self.merger.restore(state, Utc::now());
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot cache could not be read");
                false
            }
        }
    }

    /// Status of the core. Waits for a running cycle to finish.
    pub async fn snapshot(&self) -> CoreSnapshot {
        let core = self.core.lock().await;
        CoreSnapshot {
            metrics: core.gatekeeper.metrics(),
            cursor: core.cursor.current(),
            emergency: core.emergency.status(),
            paused: core.scheduler.is_paused(),
            scheduled_devices: core.scheduler.len(),
            last_cycle: core.last_cycle.clone(),
        }
    }

    /// Operator reset: clears metrics, closes the circuit, rewinds the cursor to 0,
    /// leaves emergency mode and resumes the scheduler.
    ///
    /// Runs after any in-flight cycle has completed.
    pub async fn force_reset(&self) {
        let mut core = self.core.lock().await;
        core.gatekeeper.reset();
        core.cursor.reset();
        core.emergency.force_reset();
        core.scheduler.resume();
        core.last_roster_refresh = None;
        tracing::warn!("Force reset complete: full resync on next cycle");
    }

    /// Runs one cycle, or returns immediately if one is already running.
    pub async fn run_cycle(&self) -> CycleResult {
        let Ok(mut core) = self.core.try_lock() else {
            tracing::debug!("Cycle already in flight, skipping");
            return CycleResult::skipped();
        };
        let started = Instant::now();
        let result = self.cycle(&mut core).await;
        tracing::info!(
            devices_processed = result.devices_processed,
            positions_stored = result.positions_stored,
            skipped = result.skipped.len(),
            deferred = result.deferred.len(),
            errors = result.errors.len(),
            cursor = result.cursor,
            health = ?result.health,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync cycle finished"
        );
        core.last_cycle = Some(result.clone());
        result
    }

    async fn cycle(&self, core: &mut SyncCore) -> CycleResult {
        let mut result = CycleResult {
            cursor: core.cursor.current(),
            health: core.emergency.health(),
            ..CycleResult::default()
        };

        let credentials = match &self.credentials {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Cannot sync without valid credentials");
                result.errors.push(e.clone());
                return result;
            }
        };

        if core.emergency.is_active() {
            core.scheduler.pause();
            result.health = Health::Critical;
            return result;
        }

        let mut relogged = false;

        // 1. session token
        let token = match self.ensure_token(core, credentials, &mut relogged).await {
            Ok(token) => token,
            Err(e) => return self.fail(core, result, e, false),
        };

        // 2. roster
        let mut token = token;
        let mut roster: Option<Vec<Device>> = None;
        let roster_due = core
            .last_roster_refresh
            .map_or(true, |at| at.elapsed() >= self.config.roster_refresh());
        if roster_due {
            let mut fetched = self.fetch_roster(core, &token, &credentials.username).await;
            if matches!(fetched, Err(SyncError::Auth(_))) && !relogged {
                core.token = None;
                match self.ensure_token(core, credentials, &mut relogged).await {
                    Ok(fresh) => {
                        token = fresh;
                        fetched = self.fetch_roster(core, &token, &credentials.username).await;
                    }
                    Err(e) => return self.fail(core, result, e, true),
                }
            }
            match fetched {
                Ok(devices) => {
                    core.last_roster_refresh = Some(Instant::now());
                    result.roster_refreshed = true;
                    roster = Some(devices);
                }
                Err(e) if e.is_account_wide() => return self.fail(core, result, e, true),
                Err(e) => {
                    tracing::warn!(error = %e, "Roster refresh failed, keeping previous roster");
                    result.errors.push(e);
                }
            }
        }

        let prev = self.merger.latest();
        if roster.is_none() && self.assignments_dirty.load(Ordering::Acquire) {
            roster = Some(prev.devices.clone());
        }
        if let Some(devices) = roster.as_mut() {
            self.apply_assignments(devices);
        }

        // 3. schedule
        let now_wall = Utc::now();
        let devices_now: &[Device] = roster.as_deref().unwrap_or(prev.devices.as_slice());
        core.scheduler
            .refresh(devices_now, &prev.positions, &self.attention.levels(), now_wall);
        let forced = self.attention.take_priority_requests();
        let due = core.scheduler.devices_due_now(Instant::now(), &forced);
        let jobs = plan_batches(&due, core.scheduler.policy());
        tracing::debug!(due = due.len(), batches = jobs.len(), forced = forced.len(), "Cycle planned");

        // 4. batches
        let cycle_cursor = core.cursor.current();
        let batches = self
            .run_batches(core, jobs, token, cycle_cursor, credentials, &mut relogged)
            .await;

        if !batches.unserved_forced.is_empty() {
            self.attention.requeue_priority(batches.unserved_forced.clone());
        }

        // 5. merge, persist, commit
        let now_wall = Utc::now();
        let (valid, mut skipped) = validate_positions(batches.positions, now_wall, self.config.max_future_skew());
        skipped.extend(batches.rejected);
        result.skipped = skipped;
        result.deferred = batches.deferred;
        result.errors.extend(batches.errors);
        result.devices_processed = batches.succeeded.len();
        result.positions_stored = valid.len();

        core.scheduler.mark_polled(&batches.succeeded, Instant::now());

        if let Some(sink) = &self.sink {
            if let Some(devices) = &roster {
                if let Err(e) = sink.upsert_devices(devices).await {
                    tracing::warn!(error = %e, "Device upsert failed");
                    result.errors.push(e.into());
                }
            }
            if !valid.is_empty() {
                if let Err(e) = sink.upsert_positions(&valid).await {
                    tracing::warn!(error = %e, "Position upsert failed");
                    result.errors.push(e.into());
                }
            }
        }

        let publish = roster.is_some() || !batches.succeeded.is_empty();
        if publish {
            let health = core.emergency.health();
            let state = self.merger.apply(roster, valid, health, now_wall);
            self.assignments_dirty.store(false, Ordering::Release);
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store(&state).await {
                    tracing::warn!(error = %e, "Snapshot cache write failed");
                    result.errors.push(e.into());
                }
            }
        }

        if batches.abandoned {
            tracing::warn!(cursor = cycle_cursor, "Batch abandoned, holding cursor");
        } else if let Some(next) = batches.max_cursor {
            core.cursor.advance(next);
        }

        let reached = !batches.succeeded.is_empty() || result.roster_refreshed;
        self.finish(core, result, batches.account_failure, reached)
    }

    /// Ends the cycle early on `error`.
    fn fail(
        &self,
        core: &mut SyncCore,
        mut result: CycleResult,
        error: SyncError,
        reached_provider: bool,
    ) -> CycleResult {
        if error.is_account_wide() {
            return self.finish(core, result, Some(error), reached_provider);
        }
        tracing::warn!(error = %error, "Cycle ended early");
        result.errors.push(error);
        self.finish(core, result, None, reached_provider)
    }

    /// Emergency evaluation and the final shape of the result.
    fn finish(
        &self,
        core: &mut SyncCore,
        mut result: CycleResult,
        account_failure: Option<SyncError>,
        reached_provider: bool,
    ) -> CycleResult {
        if let Some(e) = account_failure {
            core.emergency.record_account_failure(&e);
            result.errors.push(e);
        } else if reached_provider {
            core.emergency.record_cycle_success();
        }
        let starved = !result.deferred.is_empty()
            || result
                .errors
                .iter()
                .any(|e| matches!(e, SyncError::Throttled(GateReason::Throttled)));
        core.emergency.record_budget(starved);

        let was_active = core.emergency.is_active();
        let health = core.emergency.evaluate(&core.gatekeeper.metrics());
        if core.emergency.is_active() {
            core.scheduler.pause();
            if !was_active {
                self.merger.mark_stale(Health::Critical);
            }
        } else if health != self.merger.latest().health {
            let latest = self.merger.latest();
            if latest.stale {
                self.merger.mark_stale(health);
            } else {
                self.merger.apply(None, Vec::new(), health, latest.last_update.unwrap_or_else(Utc::now));
            }
        }

        result.health = health;
        result.cursor = core.cursor.current();
        result
    }

    fn apply_assignments(&self, devices: &mut [Device]) {
        let overrides = self.assignments.lock().unwrap_or_else(|p| p.into_inner());
        if overrides.is_empty() {
            return;
        }
        for d in devices.iter_mut() {
            if let Some(assigned) = overrides.get(&d.id) {
                d.assigned = *assigned;
            }
        }
    }

    /// Returns a live token, logging in when there is none or it has expired.
    async fn ensure_token(
        &self,
        core: &mut SyncCore,
        credentials: &Credentials,
        relogged: &mut bool,
    ) -> Result<String, SyncError> {
        if let Some(token) = &core.token {
            if token.acquired_at.elapsed() < self.config.token_ttl() {
                return Ok(token.value.clone());
            }
            tracing::info!("Session token expired, logging in again");
        }
        if *relogged {
            return Err(SyncError::Auth("token rejected right after login".into()));
        }
        *relogged = true;
        core.token = None;

        let permit = core
            .gatekeeper
            .acquire_queued(self.config.max_queue_wait())
            .await
            .map_err(|r| SyncError::Throttled(r.reason))?;
        let started = Instant::now();
        let login = self.provider.login(credentials).await;
        report(&mut core.gatekeeper, permit, started, &login);
        let value = login?;
        core.token = Some(SessionToken {
            value: value.clone(),
            acquired_at: Instant::now(),
        });
        Ok(value)
    }

    async fn fetch_roster(&self, core: &mut SyncCore, token: &str, username: &str) -> Result<Vec<Device>, SyncError> {
        let permit = core
            .gatekeeper
            .acquire_queued(self.config.max_queue_wait())
            .await
            .map_err(|r| SyncError::Throttled(r.reason))?;
        let started = Instant::now();
        let roster = self.provider.query_monitor_list(token, username).await;
        report(&mut core.gatekeeper, permit, started, &roster);
        if let Ok(devices) = &roster {
            tracing::info!(device_count = devices.len(), "Roster refreshed");
        }
        roster
    }

    /// Backoff before retry number `attempt` (1-based), with full jitter.
    fn backoff(&self, attempt: u32, max_retries: u32) -> Duration {
        let min = Duration::from_millis(self.config.retry.min_backoff_ms);
        let max = Duration::from_millis(self.config.retry.max_backoff_ms);
        let policy = ExponentialBackoff::builder()
            .retry_bounds(min, max)
            .build_with_max_retries(max_retries.max(attempt));
        let now = SystemTime::now();
        match policy.should_retry(now, attempt.saturating_sub(1)) {
            RetryDecision::Retry { execute_after } => execute_after.duration_since(now).unwrap_or(min),
            RetryDecision::DoNotRetry => max,
        }
    }

    async fn run_batches(
        &self,
        core: &mut SyncCore,
        jobs: Vec<BatchJob>,
        mut token: String,
        cursor: i64,
        credentials: &Credentials,
        relogged: &mut bool,
    ) -> BatchOutcome {
        let mut out = BatchOutcome::default();
        let mut pending: VecDeque<BatchJob> = jobs.into();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, BatchEvent>> = FuturesUnordered::new();
        let mut auth_failed: Vec<BatchJob> = Vec::new();
        let mut halted = false;
        let max_in_flight = self.config.max_concurrent_batches.max(1);
        let max_wait = self.config.max_queue_wait();

        loop {
            while !halted && auth_failed.is_empty() && in_flight.len() < max_in_flight {
                let Some(mut job) = pending.pop_front() else {
                    break;
                };
                match core.gatekeeper.acquire() {
                    Ok(permit) => in_flight.push(self.fetch(job, permit, token.clone(), cursor)),
                    Err(rejection)
                        if rejection.reason == GateReason::Throttled
                            && job.waited + rejection.retry_after <= max_wait =>
                    {
                        job.waited += rejection.retry_after;
                        in_flight.push(delayed(job, rejection.retry_after));
                    }
                    Err(rejection) if rejection.reason == GateReason::Throttled => {
                        pending.push_front(job);
                        for j in pending.drain(..) {
                            if j.forced {
                                out.unserved_forced.extend(j.ids.iter().cloned());
                            }
                            out.abandoned |= j.attempt > 0;
                            out.deferred.extend(j.ids);
                        }
                        tracing::info!(
                            deferred = out.deferred.len(),
                            retry_after_ms = rejection.retry_after.as_millis() as u64,
                            "Rate budget exhausted, deferring remaining devices"
                        );
                        halted = true;
                    }
                    Err(rejection) => {
                        pending.push_front(job);
                        let unserved: Vec<BatchJob> = pending.drain(..).collect();
                        tracing::warn!(batches = unserved.len(), "Circuit open, aborting remaining batches");
                        for j in unserved.iter().filter(|j| j.forced) {
                            out.unserved_forced.extend(j.ids.iter().cloned());
                        }
                        out.abandoned = true;
                        out.account_failure = Some(SyncError::Throttled(rejection.reason));
                        halted = true;
                    }
                }
            }

            let Some(event) = in_flight.next().await else {
                if auth_failed.is_empty() {
                    break;
                }
                // Every in-flight batch has landed; renew the token once and rerun.
                core.token = None;
                match self.ensure_token(core, credentials, relogged).await {
                    Ok(fresh) => {
                        token = fresh;
                        for job in auth_failed.drain(..).rev() {
                            pending.push_front(job);
                        }
                        continue;
                    }
                    Err(e) => {
                        let mut abandoned: Vec<BatchJob> = auth_failed.drain(..).collect();
                        abandoned.extend(pending.drain(..));
                        for j in abandoned.iter().filter(|j| j.forced) {
                            out.unserved_forced.extend(j.ids.iter().cloned());
                        }
                        out.abandoned = true;
                        out.account_failure = Some(e);
                        break;
                    }
                }
            };

            match event {
                BatchEvent::Ready(job) => pending.push_front(job),
                BatchEvent::Finished {
                    mut job,
                    permit,
                    started,
                    result,
                } => {
                    report(&mut core.gatekeeper, permit, started, &result);
                    match result {
                        Ok(page) => {
                            if let Some(c) = page.cursor {
                                out.max_cursor = Some(out.max_cursor.map_or(c, |m| m.max(c)));
                            }
                            out.positions.extend(page.positions);
                            out.rejected.extend(page.rejected);
                            out.succeeded.extend(job.ids);
                        }
                        Err(SyncError::Auth(msg)) => {
                            if *relogged {
                                tracing::error!(error = %msg, "Auth failed again after re-login");
                                if job.forced {
                                    out.unserved_forced.extend(job.ids.iter().cloned());
                                }
                                out.abandoned = true;
                                if out.account_failure.is_none() {
                                    out.account_failure = Some(SyncError::Auth(msg));
                                }
                                halted = true;
                            } else {
                                tracing::info!(error = %msg, "Token rejected, batch parked for re-login");
                                auth_failed.push(job);
                            }
                        }
                        Err(e) if e.is_retryable() && job.attempt < job.max_retries && !halted => {
                            job.attempt += 1;
                            let delay = self.backoff(job.attempt, job.max_retries);
                            tracing::warn!(
                                error = %e,
                                attempt = job.attempt,
                                max_retries = job.max_retries,
                                tier = job.tier.as_str(),
                                backoff_ms = delay.as_millis() as u64,
                                "Batch failed, retrying"
                            );
                            in_flight.push(delayed(job, delay));
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                devices = job.ids.len(),
                                attempts = job.attempt + 1,
                                "Batch abandoned for this cycle"
                            );
                            if job.forced {
                                out.unserved_forced.extend(job.ids.iter().cloned());
                            }
                            out.abandoned = true;
                            out.errors.push(e);
                        }
                    }
                }
            }
        }

        // Jobs that came back from a wait after the cycle halted.
        for j in pending.drain(..) {
            if j.forced {
                out.unserved_forced.extend(j.ids.iter().cloned());
            }
            out.abandoned |= j.attempt > 0;
            out.deferred.extend(j.ids);
        }

        out
    }

    fn fetch(&self, job: BatchJob, permit: Permit, token: String, cursor: i64) -> BoxFuture<'static, BatchEvent> {
        let provider = Arc::clone(&self.provider);
        async move {
            let started = Instant::now();
            let result = provider.last_position(&token, &job.ids, cursor).await;
            BatchEvent::Finished {
                job,
                permit,
                started,
                result,
            }
        }
        .boxed()
    }
}

fn delayed(job: BatchJob, wait: Duration) -> BoxFuture<'static, BatchEvent> {
    async move {
        tokio::time::sleep(wait).await;
        BatchEvent::Ready(job)
    }
    .boxed()
}

fn report<T>(gatekeeper: &mut Gatekeeper, permit: Permit, started: Instant, result: &Result<T, SyncError>) {
    let outcome = match result {
        Ok(_) => Outcome::Success,
        Err(e) => Outcome::Failure(e.gate_reason()),
    };
    gatekeeper.report(permit, outcome, started.elapsed());
}
