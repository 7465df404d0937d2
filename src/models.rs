//! Data models for the telemetry bridge.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

// ---

/// Variable title mapped to `EventRecord::engine_speed`.
pub const ENGINE_SPEED: &str = "Engine Speed";
/// Variable title mapped to `EventRecord::fuel_level`.
pub const FUEL_LEVEL: &str = "Fuel Level";
/// Variable title mapped to `EventRecord::total_used_fuel`.
pub const TOTAL_USED_FUEL: &str = "Engine Total Fuel Used";
/// Variable title mapped to `EventRecord::fuel_rate`.
pub const FUEL_RATE: &str = "Engine Fuel Rate";

/// Event type reported while the truck drum is unloading.
pub const PUMPING_OUT_EVENT: i64 = 132;
/// Event type reported while the truck drum is loading.
pub const PUMPING_IN_EVENT: i64 = 133;

/// Upstream payload schema the deployment consumes.
///
/// Chosen once per deployment, never guessed per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVariant {
    /// GPS-module schema: header under `gpsTimeStampModule.header`.
    Legacy,
    /// CAN-bus schema: header directly on the event.
    Current,
}

impl FromStr for SchemaVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" | "a" => Ok(SchemaVariant::Legacy),
            "current" | "b" => Ok(SchemaVariant::Current),
            other => Err(format!("unknown schema variant `{other}`")),
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVariant::Legacy => f.write_str("legacy"),
            SchemaVariant::Current => f.write_str("current"),
        }
    }
}

/// Which sink strategy receives normalized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    Http,
    Db,
}

impl FromStr for SinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(SinkMode::Http),
            "db" | "postgres" => Ok(SinkMode::Db),
            other => Err(format!("unknown sink mode `{other}`")),
        }
    }
}

impl fmt::Display for SinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkMode::Http => f.write_str("http"),
            SinkMode::Db => f.write_str("db"),
        }
    }
}

/// Drum state derived from the event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpingState {
    PumpingOut,
    #[default]
    Idle,
    PumpingIn,
}

impl PumpingState {
    /// Any event type other than 132/133, including none, is idle.
    pub fn from_event_type(event_type: Option<i64>) -> Self {
        match event_type {
            Some(PUMPING_OUT_EVENT) => PumpingState::PumpingOut,
            Some(PUMPING_IN_EVENT) => PumpingState::PumpingIn,
            _ => PumpingState::Idle,
        }
    }

    pub fn code(self) -> i8 {
        match self {
            PumpingState::PumpingOut => -1,
            PumpingState::Idle => 0,
            PumpingState::PumpingIn => 1,
        }
    }
}

impl Serialize for PumpingState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.code())
    }
}

/// Canonical normalized telemetry event.
///
/// Serialized as the HTTP body, so the field names follow the ingestion
/// API's casing (`UnitId`, `Odometer`, camelCase elsewhere).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    // ---
    #[serde(rename = "UnitId")]
    pub unit_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub ground_speed: f64,
    pub utc_timestamp_seconds: i64,
    #[serde(rename = "Odometer")]
    pub odometer: f64,
    pub course: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<i64>,
    pub pumping_state: PumpingState,
    pub engine_speed: f64,
    pub fuel_level: f64,
    pub total_used_fuel: f64,
    pub fuel_rate: f64,
    pub raw_variables: String,
    pub client: String,
}

impl EventRecord {
    /// Event time as a UTC instant, if the epoch value is representable.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.utc_timestamp_seconds, 0)
    }
}
