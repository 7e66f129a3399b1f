//! # Provider Wire Model
//!
//! Strongly typed views of the tracking provider's `login`, `querymonitorlist`
//! and `lastposition` payloads.
//!
//! ## Key Features:
//! - **Tolerant field types**: device ids arrive as strings or numbers, flags as
//!   `0/1` or booleans, numbers sometimes as strings. Small `deserialize_with`
//!   helpers absorb the differences.
//! - **Field synonyms**: different provider versions name the same field
//!   differently (`records`/`positions`, `callat`/`lat`, `course`/`heading`).
//!   `#[serde(alias)]` maps them onto one field.
//! - **Millisecond timestamps**: converted into `chrono::DateTime<Utc>` on the way
//!   into the engine model.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::model::{Device, Position, ValidationError};

/// Request body of `login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub from: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub browser: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default, deserialize_with = "flex_i64")]
    pub status: i64,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Request body of `querymonitorlist`.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorListRequest<'a> {
    pub username: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorListResponse {
    #[serde(default, deserialize_with = "flex_i64")]
    pub status: i64,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub groups: Vec<WireGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireGroup {
    #[serde(default, deserialize_with = "flex_opt_string")]
    pub groupid: Option<String>,
    #[serde(default)]
    pub groupname: Option<String>,
    #[serde(default)]
    pub devices: Vec<WireDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDevice {
    #[serde(deserialize_with = "flex_string")]
    pub deviceid: String,
    #[serde(default)]
    pub devicename: Option<String>,
    #[serde(default, deserialize_with = "flex_opt_i64")]
    pub devicetype: Option<i64>,
    #[serde(default, deserialize_with = "flex_opt_i64")]
    pub lastactivetime: Option<i64>,
    #[serde(default, deserialize_with = "flex_opt_bool")]
    pub assigned: Option<bool>,
}

impl WireDevice {
    pub fn into_device(self, group: Option<&str>) -> Device {
        let name = self
            .devicename
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.deviceid.clone());
        Device {
            id: self.deviceid,
            name,
            device_type: self.devicetype.unwrap_or(0),
            last_active: self.lastactivetime.and_then(ms_to_utc),
            assigned: self.assigned.unwrap_or(false),
            group: group.map(str::to_string),
        }
    }
}

/// Request body of `lastposition`.
#[derive(Debug, Clone, Serialize)]
pub struct LastPositionRequest<'a> {
    pub deviceids: &'a [String],
    pub lastquerypositiontime: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastPositionResponse {
    #[serde(default, deserialize_with = "flex_i64")]
    pub status: i64,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default, alias = "positions")]
    pub records: Option<Vec<WirePosition>>,
    #[serde(default, deserialize_with = "flex_opt_i64")]
    pub lastquerypositiontime: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePosition {
    #[serde(deserialize_with = "flex_string")]
    pub deviceid: String,
    #[serde(default, alias = "lat", alias = "latitude", deserialize_with = "flex_opt_f64")]
    pub callat: Option<f64>,
    #[serde(
        default,
        alias = "lon",
        alias = "lng",
        alias = "longitude",
        deserialize_with = "flex_opt_f64"
    )]
    pub callon: Option<f64>,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub speed: Option<f64>,
    #[serde(default, alias = "heading", deserialize_with = "flex_opt_f64")]
    pub course: Option<f64>,
    #[serde(default, deserialize_with = "flex_opt_bool")]
    pub moving: Option<bool>,
    #[serde(default, alias = "acc", deserialize_with = "flex_opt_bool")]
    pub ignition: Option<bool>,
    #[serde(default, alias = "devicetime", deserialize_with = "flex_opt_i64")]
    pub updatetime: Option<i64>,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub fuel: Option<f64>,
    #[serde(default, alias = "temp", deserialize_with = "flex_opt_f64")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub voltage: Option<f64>,
    #[serde(default, deserialize_with = "flex_opt_i64")]
    pub alarm: Option<i64>,
}

impl WirePosition {
    /// Lifts a record into the engine model. Range checks happen later in
    /// `Position::validate`; this only rejects records missing required fields.
    pub fn into_position(self) -> Result<Position, (String, ValidationError)> {
        let (Some(latitude), Some(longitude)) = (self.callat, self.callon) else {
            return Err((self.deviceid, ValidationError::MissingCoordinates));
        };
        let Some(updated_at) = self.updatetime.and_then(ms_to_utc) else {
            return Err((self.deviceid, ValidationError::MissingTimestamp));
        };
        let speed = self.speed.unwrap_or(0.0);
        Ok(Position {
            device_id: self.deviceid,
            latitude,
            longitude,
            speed,
            heading: self.course.unwrap_or(0.0),
            moving: self.moving.unwrap_or(speed > 0.0),
            ignition: self.ignition,
            updated_at,
            fuel: self.fuel,
            temperature: self.temperature,
            voltage: self.voltage,
            alarm: self.alarm.filter(|code| *code != 0),
        })
    }
}

/// Epoch milliseconds to UTC. Zero and negative values mean "unknown".
pub fn ms_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flex {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Flex {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Flex::Bool(b) => Some(i64::from(*b)),
            Flex::Int(i) => Some(*i),
            Flex::Float(f) if f.is_finite() => Some(*f as i64),
            Flex::Float(_) => None,
            Flex::Str(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Flex::Bool(_) => None,
            Flex::Int(i) => Some(*i as f64),
            Flex::Float(f) => Some(*f),
            Flex::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Flex::Bool(b) => Some(*b),
            Flex::Int(i) => Some(*i != 0),
            Flex::Float(f) => Some(*f != 0.0),
            Flex::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            },
        }
    }

    fn into_string(self) -> String {
        match self {
            Flex::Bool(b) => b.to_string(),
            Flex::Int(i) => i.to_string(),
            Flex::Float(f) => f.to_string(),
            Flex::Str(s) => s,
        }
    }
}

fn flex_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Flex::deserialize(d)?.into_string())
}

fn flex_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Flex>::deserialize(d)?.map(Flex::into_string))
}

fn flex_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    flex_opt_i64(d)?.ok_or_else(|| serde::de::Error::custom("expected an integer"))
}

fn flex_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Flex>::deserialize(d)?.and_then(|f| f.as_i64()))
}

fn flex_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Flex>::deserialize(d)?.and_then(|f| f.as_f64()))
}

fn flex_opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<Flex>::deserialize(d)?.and_then(|f| f.as_bool()))
}
