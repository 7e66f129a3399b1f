//! # Tracking Provider
//!
//! Wire models of the provider's JSON protocol and the `TrackingProvider` seam
//! with its HTTP implementation.

/// Request/response payloads and tolerant deserializers.
pub mod model;

/// `TrackingProvider` trait and `HttpProvider`.
pub mod client;

pub use client::{HttpProvider, PositionPage, TrackingProvider};
