//! # State Merger
//!
//! Folds fresh roster and position data into the latest known fleet state and
//! fans the result out to subscribers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Pure merge**: [`merge`] is a function of the previous snapshot and the
//!     new inputs. It never mutates the previous snapshot.
//!
//! 2.  **Atomic replacement**: consumers hold `Arc<LiveState>` pointers. A new
//!     snapshot is swapped in whole, so nobody ever sees devices without their
//!     classification or a half-applied batch.
//!
//! 3.  **Zero-copy fan-out**: every subscriber receives a clone of the same `Arc`.
//!     Channels are bounded; a subscriber that is not keeping up skips snapshots
//!     (the next one supersedes them anyway) and a closed subscriber is dropped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::core::classifier::{classify_activity, ActivityThresholds, ActivityTier};
use crate::core::emergency::Health;
use crate::core::model::{Device, DeviceId, Position, SkippedPosition};

/// Display counters derived from the per-device classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBuckets {
    pub active: usize,
    /// Idle-assigned plus idle-available.
    pub idle: usize,
    pub inactive: usize,
}

impl ActivityBuckets {
    fn from_classification(classification: &HashMap<DeviceId, ActivityTier>) -> Self {
        let mut buckets = ActivityBuckets::default();
        for tier in classification.values() {
            match tier {
                ActivityTier::Active => buckets.active += 1,
                ActivityTier::IdleAssigned | ActivityTier::IdleAvailable => buckets.idle += 1,
                ActivityTier::Inactive => buckets.inactive += 1,
            }
        }
        buckets
    }
}

/// The engine's external contract: one consistent view of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    pub devices: Vec<Device>,
    pub positions: HashMap<DeviceId, Position>,
    pub classification: HashMap<DeviceId, ActivityTier>,
    pub buckets: ActivityBuckets,
    pub last_update: Option<DateTime<Utc>>,
    /// True when the data is served from cache or frozen by emergency mode.
    pub stale: bool,
    pub health: Health,
    /// Increases by one with every published snapshot.
    pub sequence: u64,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            positions: HashMap::new(),
            classification: HashMap::new(),
            buckets: ActivityBuckets::default(),
            last_update: None,
            stale: false,
            health: Health::Healthy,
            sequence: 0,
        }
    }
}

impl LiveState {
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn tier(&self, id: &str) -> Option<ActivityTier> {
        self.classification.get(id).copied()
    }

    /// Recomputes classification and buckets for the current devices.
    fn reclassify(&mut self, now: DateTime<Utc>, thresholds: &ActivityThresholds) {
        self.classification = self
            .devices
            .iter()
            .map(|d| (d.id.clone(), classify_activity(d, self.positions.get(&d.id), now, thresholds)))
            .collect();
        self.buckets = ActivityBuckets::from_classification(&self.classification);
    }
}

/// Splits raw positions into storable ones and the ones that failed validation.
pub fn validate_positions(
    raw: Vec<Position>,
    now: DateTime<Utc>,
    max_future_skew: Duration,
) -> (Vec<Position>, Vec<SkippedPosition>) {
    let mut valid = Vec::with_capacity(raw.len());
    let mut skipped = Vec::new();
    for p in raw {
        match p.validate(now, max_future_skew) {
            Ok(()) => valid.push(p),
            Err(reason) => {
                tracing::debug!(device = %p.device_id, %reason, "Dropping invalid position");
                skipped.push(SkippedPosition {
                    device_id: p.device_id,
                    reason,
                });
            }
        }
    }
    (valid, skipped)
}

/// Builds the next snapshot from `prev` and the data of one cycle.
///
/// - `devices` replaces the roster only when a fresh roster was fetched.
/// - each position replaces the prior one of its device, unless it is older.
/// - devices absent from `positions` keep their previous fix.
pub fn merge(
    prev: &LiveState,
    devices: Option<Vec<Device>>,
    positions: Vec<Position>,
    now: DateTime<Utc>,
    thresholds: &ActivityThresholds,
) -> LiveState {
    let mut next = LiveState {
        devices: devices.unwrap_or_else(|| prev.devices.clone()),
        positions: prev.positions.clone(),
        classification: HashMap::new(),
        buckets: ActivityBuckets::default(),
        last_update: Some(now),
        stale: false,
        health: prev.health,
        sequence: prev.sequence + 1,
    };

    for p in positions {
        let newer = next
            .positions
            .get(&p.device_id)
            .map_or(true, |existing| p.updated_at >= existing.updated_at);
        if newer {
            next.positions.insert(p.device_id.clone(), p);
        }
    }

    next.reclassify(now, thresholds);
    next
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Arc<LiveState>>,
}

/// Owner of the current snapshot and its subscribers.
pub struct StateMerger {
    current: RwLock<Arc<LiveState>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    thresholds: ActivityThresholds,
    channel_capacity: usize,
}

impl StateMerger {
    pub fn new(thresholds: ActivityThresholds, channel_capacity: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(LiveState::default())),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            thresholds,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// The latest published snapshot.
    pub fn latest(&self) -> Arc<LiveState> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Registers a subscriber. The current snapshot is delivered right away.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<LiveState>>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = tx.try_send(self.latest());
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.push(Subscriber { id, sender: tx });
        tracing::debug!(subscriber = id, total = subs.len(), "Subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Merges one cycle's data and publishes the result.
    pub fn apply(
        &self,
        devices: Option<Vec<Device>>,
        positions: Vec<Position>,
        health: Health,
        now: DateTime<Utc>,
    ) -> Arc<LiveState> {
        let prev = self.latest();
        let mut next = merge(&prev, devices, positions, now, &self.thresholds);
        next.health = health;
        self.publish(next)
    }

    /// Republishes the current data flagged as stale.
    pub fn mark_stale(&self, health: Health) -> Arc<LiveState> {
        let prev = self.latest();
        let mut next = (*prev).clone();
        next.stale = true;
        next.health = health;
        next.sequence = prev.sequence + 1;
        self.publish(next)
    }

    /// Installs a snapshot loaded from the cache. It is always served as stale.
    pub fn restore(&self, mut cached: LiveState, now: DateTime<Utc>) -> Arc<LiveState> {
        let prev = self.latest();
        cached.stale = true;
        cached.sequence = prev.sequence.max(cached.sequence) + 1;
        cached.reclassify(now, &self.thresholds);
        tracing::info!(
            device_count = cached.devices.len(),
            position_count = cached.positions.len(),
            "Restored cached snapshot"
        );
        self.publish(cached)
    }

    fn publish(&self, state: LiveState) -> Arc<LiveState> {
        let state = Arc::new(state);
        {
            let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
            *guard = Arc::clone(&state);
        }

        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| match s.sender.try_send(Arc::clone(&state)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscriber = s.id, "Subscriber lagging, snapshot skipped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = s.id, "Subscriber closed, removing");
                false
            }
        });
        state
    }
}
