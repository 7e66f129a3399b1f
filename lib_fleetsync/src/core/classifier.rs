//! # Activity Classification
//!
//! One pure function decides which tier a device belongs to. The scheduler uses
//! the tier to pick a polling interval and the state merger uses the same tier to
//! fill the display buckets, so both views can never disagree.
//!
//! | Tier | Name           | Rule                                                     |
//! |------|----------------|----------------------------------------------------------|
//! | 1    | active         | fix younger than `active_window` and moving/ignition on  |
//! | 2    | idle-assigned  | assigned and seen within `recent_window`                 |
//! | 3    | idle-available | not assigned and seen within `recent_window`             |
//! | 4    | inactive       | anything else                                            |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::model::{Device, Position};

/// Priority tier of a device. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityTier {
    Active = 1,
    IdleAssigned = 2,
    IdleAvailable = 3,
    Inactive = 4,
}

impl ActivityTier {
    pub const ALL: [ActivityTier; 4] = [
        ActivityTier::Active,
        ActivityTier::IdleAssigned,
        ActivityTier::IdleAvailable,
        ActivityTier::Inactive,
    ];

    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityTier::Active => "active",
            ActivityTier::IdleAssigned => "idle-assigned",
            ActivityTier::IdleAvailable => "idle-available",
            ActivityTier::Inactive => "inactive",
        }
    }
}

/// Time windows behind the tier rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityThresholds {
    pub active_window_ms: u64,
    pub recent_window_ms: u64,
}

impl Default for ActivityThresholds {
    fn default() -> Self {
        Self {
            active_window_ms: 5 * 60 * 1000,
            recent_window_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Classifies one device from its roster entry and latest known fix.
pub fn classify_activity(
    device: &Device,
    position: Option<&Position>,
    now: DateTime<Utc>,
    thresholds: &ActivityThresholds,
) -> ActivityTier {
    let active_window = chrono::Duration::milliseconds(thresholds.active_window_ms as i64);
    let recent_window = chrono::Duration::milliseconds(thresholds.recent_window_ms as i64);

    if let Some(p) = position {
        if now - p.updated_at <= active_window && p.is_in_motion() {
            return ActivityTier::Active;
        }
    }

    let last_seen = match (position.map(|p| p.updated_at), device.last_active) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let recently_seen = last_seen.is_some_and(|seen| now - seen <= recent_window);

    match (recently_seen, device.assigned) {
        (true, true) => ActivityTier::IdleAssigned,
        (true, false) => ActivityTier::IdleAvailable,
        (false, _) => ActivityTier::Inactive,
    }
}

/// Polling parameters of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSettings {
    pub interval_ms: u64,
    /// Devices per `lastposition` call. Smaller for urgent tiers.
    pub batch_size: usize,
    /// Retries of a failed batch before it is abandoned for the cycle.
    pub max_retries: u32,
}

/// How closely a device is being watched right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionLevel {
    #[default]
    None,
    Watched,
    Realtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TierPolicy {
    pub active: TierSettings,
    pub idle_assigned: TierSettings,
    pub idle_available: TierSettings,
    pub inactive: TierSettings,
    /// Interval for a device someone has open on screen.
    pub watched_interval_ms: u64,
    /// Interval for a device on a realtime view.
    pub realtime_interval_ms: u64,
    /// No attention level may poll faster than this.
    pub attention_floor_ms: u64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            active: TierSettings {
                interval_ms: 30_000,
                batch_size: 10,
                max_retries: 4,
            },
            idle_assigned: TierSettings {
                interval_ms: 120_000,
                batch_size: 20,
                max_retries: 3,
            },
            idle_available: TierSettings {
                interval_ms: 300_000,
                batch_size: 30,
                max_retries: 2,
            },
            inactive: TierSettings {
                interval_ms: 1_800_000,
                batch_size: 50,
                max_retries: 1,
            },
            watched_interval_ms: 15_000,
            realtime_interval_ms: 5_000,
            attention_floor_ms: 5_000,
        }
    }
}

impl TierPolicy {
    pub fn settings(&self, tier: ActivityTier) -> &TierSettings {
        match tier {
            ActivityTier::Active => &self.active,
            ActivityTier::IdleAssigned => &self.idle_assigned,
            ActivityTier::IdleAvailable => &self.idle_available,
            ActivityTier::Inactive => &self.inactive,
        }
    }

    /// Polling interval for a tier under the given attention.
    ///
    /// Attention only ever shortens the base interval and never below the floor.
    pub fn interval_for(&self, tier: ActivityTier, attention: AttentionLevel) -> Duration {
        let base = self.settings(tier).interval_ms;
        let ms = match attention {
            AttentionLevel::None => base,
            AttentionLevel::Watched => base.min(self.watched_interval_ms.max(self.attention_floor_ms)),
            AttentionLevel::Realtime => base.min(self.realtime_interval_ms.max(self.attention_floor_ms)),
        };
        Duration::from_millis(ms)
    }
}
