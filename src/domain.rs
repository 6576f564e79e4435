//! ==============================================================================
//! domain.rs - sensor readings and detection verdicts
//! ==============================================================================
//!
//! purpose:
//!     the plain data types that flow through the pipeline. nothing in here
//!     knows about sqlite, mqtt or http.
//!
//! relationships:
//!     - written by: ingest.rs (SensorReading via store.rs)
//!     - produced by: detector.rs (DetectionVerdict, one per monitored sensor)
//!     - consumed by: dispatch.rs (report composition), api.rs (json output)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==============================================================================
// sensor catalogue
// ==============================================================================

/// the three physical sensors of the site
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorId {
    IndoorTemp,
    Humidity,
    ThermalFlow,
}

impl SensorId {
    pub const ALL: [SensorId; 3] = [SensorId::IndoorTemp, SensorId::Humidity, SensorId::ThermalFlow];

    /// stable key used in the database and in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::IndoorTemp => "indoor_temp",
            SensorId::Humidity => "humidity",
            SensorId::ThermalFlow => "thermal_flow",
        }
    }

    /// human readable name for reports
    pub fn label(&self) -> &'static str {
        match self {
            SensorId::IndoorTemp => "indoor temperature",
            SensorId::Humidity => "humidity",
            SensorId::ThermalFlow => "outdoor thermal flow",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorId::IndoorTemp => "°C",
            SensorId::Humidity => "%",
            SensorId::ThermalFlow => "°C",
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown sensor id '{0}'")]
pub struct UnknownSensor(pub String);

impl FromStr for SensorId {
    type Err = UnknownSensor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownSensor(s.to_string()))
    }
}

// ==============================================================================
// readings
// ==============================================================================

/// a single persisted sample. immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: SensorId,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(sensor_id: SensorId, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { sensor_id, value, timestamp }
    }
}

const MAX_LOOKBACK_MINUTES: u64 = 100 * 525_600;

/// inclusive time window for range queries and charts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// the window ending at `end` and reaching `minutes` back (capped at a century)
    pub fn last_minutes(end: DateTime<Utc>, minutes: u64) -> Self {
        let minutes = minutes.min(MAX_LOOKBACK_MINUTES) as i64;
        Self {
            from: end - chrono::Duration::minutes(minutes),
            to: end,
        }
    }
}

// ==============================================================================
// verdicts
// ==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
    None,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Increase => "increase",
            Direction::Decrease => "decrease",
            Direction::None => "none",
        })
    }
}

/// outcome class of one detector run.
///
/// `InsufficientData` is kept apart from `Calm` so that a sensor with no
/// history never reads as "all quiet".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    InsufficientData,
    Calm,
    Triggered,
}

/// transient result of one detection cycle for one sensor. never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionVerdict {
    pub sensor_id: SensorId,
    pub status: VerdictStatus,
    pub magnitude: Option<f64>,
    pub direction: Direction,
    pub current_value: Option<f64>,
    pub reference_value: Option<f64>,
}

impl DetectionVerdict {
    pub fn insufficient(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            status: VerdictStatus::InsufficientData,
            magnitude: None,
            direction: Direction::None,
            current_value: None,
            reference_value: None,
        }
    }

    pub fn triggered(&self) -> bool {
        self.status == VerdictStatus::Triggered
    }

    pub fn is_insufficient(&self) -> bool {
        self.status == VerdictStatus::InsufficientData
    }
}
