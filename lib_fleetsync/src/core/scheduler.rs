//! # Priority Scheduler
//!
//! Owns one `PollingStrategy` per device and answers "who is due now?".
//!
//! ## Ordering
//!
//! The gatekeeper may admit only a prefix of a cycle's batches, so the due list
//! is ordered so that starvation hits the least important devices:
//!
//! 1. forced devices (priority-sync requests), in request order
//! 2. then by tier, active first
//! 3. then by time since last poll, never-polled first
//!
//! The scheduler is only touched from the single control path; it holds no
//! locks of its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::classifier::{classify_activity, ActivityThresholds, ActivityTier, AttentionLevel, TierPolicy};
use crate::core::model::{Device, DeviceId, Position};

/// Polling plan of a single device.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingStrategy {
    pub tier: ActivityTier,
    pub interval: Duration,
    pub attention: AttentionLevel,
    pub last_polled: Option<Instant>,
}

/// One entry of the due list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueDevice {
    pub device_id: DeviceId,
    /// Tier used for batching. Forced devices are batched as active.
    pub tier: ActivityTier,
    pub forced: bool,
}

#[derive(Debug)]
pub struct Scheduler {
    policy: TierPolicy,
    thresholds: ActivityThresholds,
    strategies: HashMap<DeviceId, PollingStrategy>,
    paused: bool,
}

impl Scheduler {
    pub fn new(policy: TierPolicy, thresholds: ActivityThresholds) -> Self {
        Self {
            policy,
            thresholds,
            strategies: HashMap::new(),
            paused: false,
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Tier and interval for one device under the given attention.
    pub fn classify(
        &self,
        device: &Device,
        position: Option<&Position>,
        attention: AttentionLevel,
        now: DateTime<Utc>,
    ) -> (ActivityTier, Duration) {
        let tier = classify_activity(device, position, now, &self.thresholds);
        (tier, self.policy.interval_for(tier, attention))
    }

    /// Recomputes every strategy from the current roster, positions and attention.
    ///
    /// Poll history survives reclassification; devices that left the roster are
    /// forgotten.
    pub fn refresh(
        &mut self,
        devices: &[Device],
        positions: &HashMap<DeviceId, Position>,
        attention: &HashMap<DeviceId, AttentionLevel>,
        now: DateTime<Utc>,
    ) {
        let mut next = HashMap::with_capacity(devices.len());
        for device in devices {
            let level = attention.get(&device.id).copied().unwrap_or_default();
            let (tier, interval) = self.classify(device, positions.get(&device.id), level, now);
            let last_polled = self.strategies.get(&device.id).and_then(|s| s.last_polled);
            next.insert(
                device.id.clone(),
                PollingStrategy {
                    tier,
                    interval,
                    attention: level,
                    last_polled,
                },
            );
        }
        self.strategies = next;
        tracing::debug!(device_count = self.strategies.len(), "Polling strategies refreshed");
    }

    /// Devices whose interval has elapsed, plus every `forced` device that is
    /// on the roster. Forced ids the roster does not know are dropped.
    ///
    /// Empty while paused.
    pub fn devices_due_now(&self, now: Instant, forced: &[DeviceId]) -> Vec<DueDevice> {
        if self.paused {
            return Vec::new();
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut due: Vec<DueDevice> = Vec::new();
        for id in forced {
            if !self.strategies.contains_key(id) {
                tracing::warn!(device_id = %id, "Priority sync for a device outside the roster ignored");
                continue;
            }
            if seen.insert(id.as_str()) {
                due.push(DueDevice {
                    device_id: id.clone(),
                    tier: ActivityTier::Active,
                    forced: true,
                });
            }
        }

        let mut scheduled: Vec<(&DeviceId, &PollingStrategy)> = self
            .strategies
            .iter()
            .filter(|(id, _)| !seen.contains(id.as_str()))
            .filter(|(_, s)| match s.last_polled {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= s.interval,
            })
            .collect();
        // Option<Instant> orders None first, and an older instant means a longer wait.
        scheduled.sort_by(|(a_id, a), (b_id, b)| {
            a.tier
                .cmp(&b.tier)
                .then(a.last_polled.cmp(&b.last_polled))
                .then(a_id.cmp(b_id))
        });

        due.extend(scheduled.into_iter().map(|(id, s)| DueDevice {
            device_id: id.clone(),
            tier: s.tier,
            forced: false,
        }));
        due
    }

    pub fn mark_polled<'a>(&mut self, device_ids: impl IntoIterator<Item = &'a DeviceId>, now: Instant) {
        for id in device_ids {
            if let Some(s) = self.strategies.get_mut(id) {
                s.last_polled = Some(now);
            }
        }
    }

    pub fn strategy(&self, device_id: &str) -> Option<&PollingStrategy> {
        self.strategies.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn pause(&mut self) {
        if !self.paused {
            tracing::warn!("Scheduler paused");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            tracing::info!("Scheduler resumed");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, assigned: bool) -> Device {
        Device {
            id: id.into(),
            name: id.to_uppercase(),
            device_type: 1,
            last_active: None,
            assigned,
            group: None,
        }
    }

    fn moving(id: &str, at: DateTime<Utc>) -> Position {
        Position {
            device_id: id.into(),
            latitude: 1.0,
            longitude: 1.0,
            speed: 30.0,
            heading: 90.0,
            moving: true,
            ignition: Some(true),
            updated_at: at,
            fuel: None,
            temperature: None,
            voltage: None,
            alarm: None,
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(TierPolicy::default(), ActivityThresholds::default())
    }

    #[test]
    fn active_devices_come_first() {
        let now = Utc::now();
        let devices: Vec<_> = (0..6).map(|i| device(&format!("d{i}"), false)).collect();
        let positions: HashMap<_, _> = ["d4", "d5"]
            .iter()
            .map(|id| (id.to_string(), moving(id, now)))
            .collect();

        let mut s = scheduler();
        s.refresh(&devices, &positions, &HashMap::new(), now);
        let due = s.devices_due_now(Instant::now(), &[]);
        assert_eq!(due.len(), 6);
        assert_eq!(due[0].device_id, "d4");
        assert_eq!(due[1].device_id, "d5");
        assert!(due[2..].iter().all(|d| d.tier == ActivityTier::Inactive));
    }

    #[test]
    fn polled_devices_wait_for_their_interval() {
        let now = Utc::now();
        let devices = vec![device("a", false), device("b", false)];
        let positions: HashMap<_, _> = [("a".to_string(), moving("a", now))].into_iter().collect();
        let mut s = scheduler();
        s.refresh(&devices, &positions, &HashMap::new(), now);

        let t0 = Instant::now();
        s.mark_polled(&["a".to_string(), "b".to_string()], t0);
        assert!(s.devices_due_now(t0 + Duration::from_secs(29), &[]).is_empty());

        let due = s.devices_due_now(t0 + Duration::from_secs(30), &[]);
        assert_eq!(due.iter().map(|d| d.device_id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn longest_waiting_device_wins_a_tie() {
        let now = Utc::now();
        let devices = vec![device("a", false), device("b", false), device("c", false)];
        let mut s = scheduler();
        s.refresh(&devices, &HashMap::new(), &HashMap::new(), now);
        let t0 = Instant::now();
        s.mark_polled(&["b".to_string()], t0);
        s.mark_polled(&["a".to_string()], t0 + Duration::from_secs(10));

        let due = s.devices_due_now(t0 + Duration::from_secs(3_600), &[]);
        let order: Vec<_> = due.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn forced_devices_lead_and_bypass_intervals() {
        let now = Utc::now();
        let devices = vec![device("a", false), device("b", false)];
        let mut s = scheduler();
        s.refresh(&devices, &HashMap::new(), &HashMap::new(), now);
        let t0 = Instant::now();
        s.mark_polled(&["a".to_string(), "b".to_string()], t0);

        let due = s.devices_due_now(t0 + Duration::from_secs(1), &["b".to_string(), "b".to_string()]);
        assert_eq!(due.len(), 1);
        assert!(due[0].forced);
        assert_eq!(due[0].tier, ActivityTier::Active);
    }

    #[test]
    fn forced_ids_outside_the_roster_are_dropped() {
        let mut s = scheduler();
        s.refresh(&[device("a", false)], &HashMap::new(), &HashMap::new(), Utc::now());
        let t0 = Instant::now();
        s.mark_polled(&["a".to_string()], t0);

        let due = s.devices_due_now(t0, &["ghost".to_string(), "a".to_string()]);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].device_id, "a");
        assert!(due[0].forced);
    }

    #[test]
    fn attention_shortens_interval_and_survives_refresh() {
        let now = Utc::now();
        let devices = vec![device("a", true)];
        let mut attention = HashMap::new();
        attention.insert("a".to_string(), AttentionLevel::Realtime);
        let mut s = scheduler();
        s.refresh(&devices, &HashMap::new(), &attention, now);
        let strategy = s.strategy("a").expect("strategy");
        assert_eq!(strategy.tier, ActivityTier::Inactive);
        assert_eq!(strategy.interval, Duration::from_millis(5_000));

        let t0 = Instant::now();
        s.mark_polled(&["a".to_string()], t0);
        s.refresh(&devices, &HashMap::new(), &HashMap::new(), now);
        assert_eq!(s.strategy("a").and_then(|st| st.last_polled), Some(t0));
    }

    #[test]
    fn paused_scheduler_has_nothing_due() {
        let mut s = scheduler();
        s.refresh(&[device("a", false)], &HashMap::new(), &HashMap::new(), Utc::now());
        s.pause();
        assert!(s.devices_due_now(Instant::now(), &["a".to_string()]).is_empty());
        s.resume();
        assert_eq!(s.devices_due_now(Instant::now(), &[]).len(), 1);
    }
}
