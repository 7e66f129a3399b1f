//! # Persistence Seams
//!
//! The engine hands synced devices and validated positions to a `TelemetrySink`
//! and keeps its last good snapshot in a `SnapshotCache`. Both are best-effort:
//! a failure is logged and reported in the cycle result, it never stops syncing.

use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::core::merger::LiveState;
use crate::core::model::{Device, DeviceId, Position};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("cache error: {0}")]
    Cache(String),
}

/// Durable store for devices and positions, upserting to tolerate re-delivery.
pub trait TelemetrySink: Send + Sync {
    /// Upserts by device id. Returns the number of rows written.
    fn upsert_devices<'a>(&'a self, devices: &'a [Device]) -> BoxFuture<'a, Result<usize, SinkError>>;

    /// Upserts by (device id, timestamp). Returns the number of rows written.
    fn upsert_positions<'a>(&'a self, positions: &'a [Position]) -> BoxFuture<'a, Result<usize, SinkError>>;
}

/// Last-good-snapshot storage used for the degraded-mode fallback.
pub trait SnapshotCache: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Option<LiveState>, SinkError>>;

    fn store<'a>(&'a self, state: &'a LiveState) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// In-process sink. Useful for tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemorySink {
    devices: Mutex<HashMap<DeviceId, Device>>,
    positions: Mutex<BTreeMap<(DeviceId, i64), Position>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> Vec<Device> {
        let guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<Device> = guard.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every stored position, ordered by device then time.
    pub fn positions(&self) -> Vec<Position> {
        let guard = self.positions.lock().unwrap_or_else(|p| p.into_inner());
        guard.values().cloned().collect()
    }
}

impl TelemetrySink for MemorySink {
    fn upsert_devices<'a>(&'a self, devices: &'a [Device]) -> BoxFuture<'a, Result<usize, SinkError>> {
        async move {
            let mut guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            for d in devices {
                guard.insert(d.id.clone(), d.clone());
            }
            Ok(devices.len())
        }
        .boxed()
    }

    fn upsert_positions<'a>(&'a self, positions: &'a [Position]) -> BoxFuture<'a, Result<usize, SinkError>> {
        async move {
            let mut guard = self.positions.lock().unwrap_or_else(|p| p.into_inner());
            for p in positions {
                guard.insert((p.device_id.clone(), p.updated_at.timestamp_millis()), p.clone());
            }
            Ok(positions.len())
        }
        .boxed()
    }
}

/// Snapshot cache backed by one JSON file, replaced atomically on store.
#[derive(Debug, Clone)]
pub struct FileSnapshotCache {
    path: PathBuf,
}

impl FileSnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SnapshotCache for FileSnapshotCache {
    fn load(&self) -> BoxFuture<'_, Result<Option<LiveState>, SinkError>> {
        async move {
            let raw = match tokio::fs::read(&self.path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(self.io_err(e)),
            };
            let state = serde_json::from_slice(&raw)?;
            Ok(Some(state))
        }
        .boxed()
    }

    fn store<'a>(&'a self, state: &'a LiveState) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let body = serde_json::to_vec(state)?;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
            }
            let tmp = self.path.with_extension("tmp");
            tokio::fs::write(&tmp, body).await.map_err(|e| self.io_err(e))?;
            tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn position(id: &str, secs: i64) -> Position {
        Position {
            device_id: id.into(),
            latitude: 1.0,
            longitude: 2.0,
            speed: 0.0,
            heading: 0.0,
            moving: false,
            ignition: None,
            updated_at: Utc.timestamp_opt(secs, 0).unwrap(),
            fuel: None,
            temperature: None,
            voltage: None,
            alarm: None,
        }
    }

    #[tokio::test]
    async fn memory_sink_upserts_on_device_and_timestamp() {
        let sink = MemorySink::new();
        sink.upsert_positions(&[position("a", 100), position("a", 200)]).await.unwrap();
        // Re-delivery of the same fix does not duplicate it.
        sink.upsert_positions(&[position("a", 200)]).await.unwrap();
        assert_eq!(sink.positions().len(), 2);
    }

    #[tokio::test]
    async fn file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSnapshotCache::new(dir.path().join("cache").join("snapshot.json"));
        assert!(cache.load().await.unwrap().is_none());

        let mut state = LiveState::default();
        state.positions.insert("a".into(), position("a", 100));
        state.sequence = 4;
        cache.store(&state).await.unwrap();

        let loaded = cache.load().await.unwrap().expect("snapshot");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        tokio::fs::write(&path, b"{ nope").await.unwrap();
        let cache = FileSnapshotCache::new(path);
        assert!(matches!(cache.load().await, Err(SinkError::Serialization(_))));
    }
}
