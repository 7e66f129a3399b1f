//! # Core Sync Module
//!
//! The adaptive synchronization engine. It decides which vehicles to poll and
//! when, spends a fixed provider request budget on them, and turns whatever
//! comes back into one consistent live snapshot.
//!
//! ## Core Components:
//!
//! - **`gatekeeper`**: Sliding-window rate limiter in front of a three-state
//!   circuit breaker. Every provider call needs a permit from it.
//!
//! - **`cursor`**: The incremental-fetch watermark. Only ever moves forward,
//!   except on an operator reset.
//!
//! - **`classifier`** / **`scheduler`**: One shared activity classification and
//!   the per-device polling strategies built from it.
//!
//! - **`executor`**: Runs a cycle: roster, batches, merge, cursor commit.
//!
//! - **`merger`**: Builds immutable `LiveState` snapshots and fans them out.
//!
//! - **`emergency`**: Turns request metrics into a health level and latches
//!   emergency mode when the provider is unusable.
//!
//! - **`engine`**: The control loop and the handle hosts use to drive it.

/// Device and position records plus per-position validation.
pub mod model;
/// Error taxonomy shared by every component.
pub mod errors;
/// Rate limiting and circuit breaking for provider calls.
pub mod gatekeeper;
/// Incremental-fetch watermark.
pub mod cursor;
/// Activity tiers and their polling policy.
pub mod classifier;
/// Consumer attention and priority sync requests.
pub mod attention;
/// Per-device polling strategies.
pub mod scheduler;
/// Live snapshot construction and fan-out.
pub mod merger;
/// Health evaluation and emergency mode.
pub mod emergency;
/// One polling cycle.
pub mod executor;
/// Control loop and host-facing handle.
pub mod engine;

// --- Public API Re-exports ---
pub use attention::AttentionRegistry;
pub use classifier::{
    classify_activity, ActivityThresholds, ActivityTier, AttentionLevel, TierPolicy, TierSettings,
};
pub use cursor::SyncCursor;
pub use emergency::{EmergencyConfig, EmergencyManager, EmergencyStatus, Health};
pub use engine::{EngineHandle, EngineStatus, SyncEngine, SyncEngineBuilder};
pub use errors::{GateReason, SyncError};
pub use executor::{CoreSnapshot, CycleResult, SyncExecutor};
pub use gatekeeper::{
    CircuitState, Gatekeeper, GatekeeperConfig, Outcome, Permit, Rejection, RequestMetrics,
};
pub use merger::{merge, validate_positions, ActivityBuckets, LiveState, StateMerger};
pub use model::{Device, DeviceId, Position, SkippedPosition, ValidationError};
pub use scheduler::{DueDevice, PollingStrategy, Scheduler};
