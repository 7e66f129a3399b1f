//! # Redis Snapshot Cache
//!
//! Keeps the last good `LiveState` as one JSON value under a single key, through
//! a multiplexed `ConnectionManager` that reconnects on its own.

use futures_util::future::{BoxFuture, FutureExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::sink::{SinkError, SnapshotCache};
use crate::core::merger::LiveState;

/// Key used when none is given.
pub const DEFAULT_SNAPSHOT_KEY: &str = "fleetsync:snapshot";

pub struct RedisSnapshotCache {
    manager: ConnectionManager,
    key: String,
}

impl RedisSnapshotCache {
    /// Connects to `url` (e.g. "redis://127.0.0.1/").
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::open(url).map_err(|e| SinkError::Cache(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| SinkError::Cache(e.to_string()))?;
        Ok(Self {
            manager,
            key: key.into(),
        })
    }
}

impl SnapshotCache for RedisSnapshotCache {
    fn load(&self) -> BoxFuture<'_, Result<Option<LiveState>, SinkError>> {
        async move {
            let mut conn = self.manager.clone();
            let raw: Option<String> = conn.get(&self.key).await.map_err(|e| SinkError::Cache(e.to_string()))?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn store<'a>(&'a self, state: &'a LiveState) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let body = serde_json::to_string(state)?;
            let mut conn = self.manager.clone();
            let _: () = conn
                .set(&self.key, body)
                .await
                .map_err(|e| SinkError::Cache(e.to_string()))?;
            Ok(())
        }
        .boxed()
    }
}
