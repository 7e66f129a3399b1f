//! # Attention Registry
//!
//! Tracks which devices viewers are watching, keyed by session, plus the
//! out-of-band priority-sync requests issued by the presentation layer. Both are
//! written from request handlers and read by the control loop, so the maps sit
//! behind short-lived `std::sync::Mutex` locks that are never held across an
//! `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::core::classifier::AttentionLevel;
use crate::core::model::DeviceId;

#[derive(Debug, Clone, Default)]
struct Session {
    device_ids: HashSet<DeviceId>,
    realtime: bool,
}

#[derive(Debug, Default)]
pub struct AttentionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    priority: Mutex<Vec<DeviceId>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Plain data behind the lock; a panicked writer cannot leave it half-built.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AttentionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) what a session is watching.
    pub fn register(&self, session_id: &str, device_ids: Vec<DeviceId>, realtime: bool) {
        let count = device_ids.len();
        guard(&self.sessions).insert(
            session_id.to_string(),
            Session {
                device_ids: device_ids.into_iter().collect(),
                realtime,
            },
        );
        tracing::debug!(session = session_id, device_count = count, realtime, "Attention registered");
    }

    /// Drops a session. Returns false if it was not registered.
    pub fn unregister(&self, session_id: &str) -> bool {
        let removed = guard(&self.sessions).remove(session_id).is_some();
        if removed {
            tracing::debug!(session = session_id, "Attention unregistered");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        guard(&self.sessions).len()
    }

    /// Strongest attention any session gives to `device_id`.
    pub fn level_for(&self, device_id: &str) -> AttentionLevel {
        let sessions = guard(&self.sessions);
        let mut level = AttentionLevel::None;
        for s in sessions.values().filter(|s| s.device_ids.contains(device_id)) {
            if s.realtime {
                return AttentionLevel::Realtime;
            }
            level = AttentionLevel::Watched;
        }
        level
    }

    /// Attention level of every watched device.
    pub fn levels(&self) -> HashMap<DeviceId, AttentionLevel> {
        let sessions = guard(&self.sessions);
        let mut out: HashMap<DeviceId, AttentionLevel> = HashMap::new();
        for s in sessions.values() {
            let level = if s.realtime {
                AttentionLevel::Realtime
            } else {
                AttentionLevel::Watched
            };
            for id in &s.device_ids {
                let entry = out.entry(id.clone()).or_insert(level);
                if level == AttentionLevel::Realtime {
                    *entry = level;
                }
            }
        }
        out
    }

    /// Queues devices to be polled on the next cycle regardless of schedule.
    pub fn request_priority_sync(&self, device_ids: &[DeviceId]) {
        let mut queue = guard(&self.priority);
        for id in device_ids {
            if !queue.contains(id) {
                queue.push(id.clone());
            }
        }
        tracing::info!(queued = queue.len(), "Priority sync requested");
    }

    /// Takes every pending priority request, in request order.
    pub fn take_priority_requests(&self) -> Vec<DeviceId> {
        std::mem::take(&mut *guard(&self.priority))
    }

    /// Puts requests back at the front, e.g. when a cycle could not serve them.
    pub fn requeue_priority(&self, device_ids: Vec<DeviceId>) {
        let mut queue = guard(&self.priority);
        let mut merged = device_ids;
        for id in queue.drain(..) {
            if !merged.contains(&id) {
                merged.push(id);
            }
        }
        *queue = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_wins_over_watched() {
        let reg = AttentionRegistry::new();
        reg.register("a", vec!["d1".into(), "d2".into()], false);
        reg.register("b", vec!["d2".into()], true);

        assert_eq!(reg.level_for("d1"), AttentionLevel::Watched);
        assert_eq!(reg.level_for("d2"), AttentionLevel::Realtime);
        assert_eq!(reg.level_for("d3"), AttentionLevel::None);

        let levels = reg.levels();
        assert_eq!(levels.get("d2"), Some(&AttentionLevel::Realtime));
        assert_eq!(levels.len(), 2);
    }

    #[test]
    fn unregister_removes_session_attention() {
        let reg = AttentionRegistry::new();
        reg.register("a", vec!["d1".into()], true);
        assert!(reg.unregister("a"));
        assert!(!reg.unregister("a"));
        assert_eq!(reg.level_for("d1"), AttentionLevel::None);
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn priority_requests_are_deduplicated_and_drained() {
        let reg = AttentionRegistry::new();
        reg.request_priority_sync(&["d1".into(), "d2".into()]);
        reg.request_priority_sync(&["d2".into(), "d3".into()]);
        assert_eq!(reg.take_priority_requests(), vec!["d1", "d2", "d3"]);
        assert!(reg.take_priority_requests().is_empty());

        reg.request_priority_sync(&["d9".into()]);
        reg.requeue_priority(vec!["d1".into()]);
        assert_eq!(reg.take_priority_requests(), vec!["d1", "d9"]);
    }
}
