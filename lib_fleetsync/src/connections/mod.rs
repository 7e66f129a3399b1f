//! # Connections Module
//!
//! Seams to the engine's external persistence collaborators and their concrete
//! adapters. The database and cache adapters are behind the `connections`
//! feature so the engine itself builds without a database driver.

/// `TelemetrySink` / `SnapshotCache` seams, the error type and the in-process adapters.
pub mod sink;

/// PostgreSQL durable sink.
#[cfg(feature = "connections")]
pub mod db_postgres;

/// Redis snapshot cache.
#[cfg(feature = "connections")]
pub mod cache_redis;

pub use sink::{FileSnapshotCache, MemorySink, SinkError, SnapshotCache, TelemetrySink};
