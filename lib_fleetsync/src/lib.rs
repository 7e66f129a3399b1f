//! # lib_fleetsync
//!
//! Adaptive synchronization engine for third-party vehicle tracking providers
//! that only offer a coarse polling API behind aggressive rate limits.
//!
//! The crate is split the same way the rest of the workspace is organised:
//! configuration, logging, HTTP retrieval, the provider client, the sync core
//! and the external connections (durable sink and snapshot cache).

#![forbid(unsafe_code)]

/// Engine tuning and credential stores.
pub mod configs;
/// Tracing subscriber and rolling log file setup.
pub mod loggers;
/// Generic JSON-over-HTTP client.
pub mod retrieve;
/// Provider wire models and the `TrackingProvider` seam.
pub mod provider;
/// The adaptive synchronization engine.
pub mod core;
/// Durable sink and snapshot cache seams with concrete adapters.
pub mod connections;

// Re-export everything a host application needs to wire an engine.
pub use configs::{ConfigError, CredentialStore, Credentials, SyncConfig};
pub use connections::{SinkError, SnapshotCache, TelemetrySink};
pub use core::{
    ActivityTier, CycleResult, Device, DeviceId, EngineHandle, EngineStatus, GateReason, Health,
    LiveState, Position, SyncEngine, SyncError,
};
pub use loggers::{init_logging, LogOptions};
pub use provider::{HttpProvider, TrackingProvider};
