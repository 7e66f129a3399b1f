//! # Fleet Data Model
//!
//! Devices and positions as the engine sees them once they have been lifted out
//! of the provider's wire format. A `Position` is only ever stored after it has
//! passed `Position::validate`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable provider identifier of a tracked device.
pub type DeviceId = String;

/// A tracked vehicle as listed by the provider's monitor list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable identifier used as the key everywhere in the engine.
    pub id: DeviceId,
    /// Human readable name shown by the presentation layer.
    pub name: String,
    /// Provider device-type code.
    pub device_type: i64,
    /// Last time the provider saw any activity from the device.
    pub last_active: Option<DateTime<Utc>>,
    /// Whether the vehicle is currently assigned (rented, dispatched, ...).
    pub assigned: bool,
    /// Name of the provider group the device was listed under.
    pub group: Option<String>,
}

/// Latest known fix of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub device_id: DeviceId,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed in km/h.
    pub speed: f64,
    /// Heading in degrees, clockwise from north.
    pub heading: f64,
    pub moving: bool,
    /// Ignition (ACC) state when the device reports it.
    pub ignition: Option<bool>,
    pub updated_at: DateTime<Utc>,
    pub fuel: Option<f64>,
    pub temperature: Option<f64>,
    pub voltage: Option<f64>,
    /// Provider alarm code, if an alarm is raised.
    pub alarm: Option<i64>,
}

/// Reasons a single position is rejected before it reaches the live state.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum ValidationError {
    #[error("position has no coordinates")]
    MissingCoordinates,
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("position has no usable timestamp")]
    MissingTimestamp,
    #[error("timestamp {0} is too far in the future")]
    TimestampInFuture(DateTime<Utc>),
}

impl Position {
    /// Checks coordinates and timestamp.
    ///
    /// `max_future_skew` bounds how far ahead of `now` the provider clock may run
    /// before the fix is treated as garbage.
    pub fn validate(&self, now: DateTime<Utc>, max_future_skew: Duration) -> Result<(), ValidationError> {
        if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        if self.updated_at.timestamp_millis() <= 0 {
            return Err(ValidationError::MissingTimestamp);
        }
        if self.updated_at > now + max_future_skew {
            return Err(ValidationError::TimestampInFuture(self.updated_at));
        }
        Ok(())
    }

    /// True when the device reports motion or a running engine.
    pub fn is_in_motion(&self) -> bool {
        self.moving || self.ignition.unwrap_or(false)
    }
}

/// A position that was dropped during a cycle, kept for the cycle report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPosition {
    pub device_id: DeviceId,
    pub reason: ValidationError,
}
