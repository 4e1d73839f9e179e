//! Per-device hourly telemetry records and the identifiers that group them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of hourly slots in one processed day.
pub const SLOTS_PER_DAY: usize = 24;
pub const SLOT_SECONDS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Intensity,
    Voltage,
}

impl Signal {
    pub const ALL: [Signal; 2] = [Signal::Intensity, Signal::Voltage];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intensity => "intensity",
            Self::Voltage => "voltage",
        }
    }

    /// UI callers encode the signal as `"0"` (current) or `"1"` (voltage).
    pub fn from_code(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(Self::Intensity),
            "1" => Some(Self::Voltage),
            other => match other.to_ascii_lowercase().as_str() {
                "intensity" | "current" => Some(Self::Intensity),
                "voltage" => Some(Self::Voltage),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid device id '{0}': expected box-inverter-string")]
pub struct DeviceIdError(pub String);

/// `box_id-inverter_id-string_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub box_id: String,
    pub inverter_id: String,
    pub string_id: String,
}

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        let mut parts = raw.trim().split('-');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(b), Some(i), Some(s), None) if !b.is_empty() && !i.is_empty() && !s.is_empty() => {
                Ok(Self {
                    box_id: b.to_string(),
                    inverter_id: i.to_string(),
                    string_id: s.to_string(),
                })
            }
            _ => Err(DeviceIdError(raw.to_string())),
        }
    }

    pub fn scope(&self) -> DeviceScope {
        DeviceScope {
            box_id: self.box_id.clone(),
            inverter_id: self.inverter_id.clone(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.box_id, self.inverter_id, self.string_id)
    }
}

/// One `(box_id, inverter_id)` sibling cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceScope {
    pub box_id: String,
    pub inverter_id: String,
}

impl DeviceScope {
    pub fn device_prefix(&self) -> String {
        format!("{}-{}-", self.box_id, self.inverter_id)
    }
}

/// Inclusive `[start, end]` range of unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl TimeRange {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ts && ts <= self.end_ts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: i64,
    pub device_id: String,
    pub string_id: String,
    pub inverter_id: String,
    pub box_id: String,
    pub intensity: Option<f64>,
    pub voltage: Option<f64>,
    pub fixed_intensity: Option<f64>,
    pub fixed_voltage: Option<f64>,
}

impl Reading {
    /// Builds a raw reading, deriving the hierarchy columns from `device_id`.
    pub fn raw(
        timestamp: i64,
        device_id: &DeviceId,
        intensity: Option<f64>,
        voltage: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            device_id: device_id.to_string(),
            string_id: device_id.string_id.clone(),
            inverter_id: device_id.inverter_id.clone(),
            box_id: device_id.box_id.clone(),
            intensity,
            voltage,
            fixed_intensity: None,
            fixed_voltage: None,
        }
    }

    pub fn value(&self, signal: Signal) -> Option<f64> {
        match signal {
            Signal::Intensity => self.intensity,
            Signal::Voltage => self.voltage,
        }
    }

    pub fn fixed(&self, signal: Signal) -> Option<f64> {
        match signal {
            Signal::Intensity => self.fixed_intensity,
            Signal::Voltage => self.fixed_voltage,
        }
    }

    pub fn set_fixed(&mut self, signal: Signal, value: Option<f64>) {
        match signal {
            Signal::Intensity => self.fixed_intensity = value,
            Signal::Voltage => self.fixed_voltage = value,
        }
    }

    pub fn scope(&self) -> DeviceScope {
        DeviceScope {
            box_id: self.box_id.clone(),
            inverter_id: self.inverter_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub day_marker: i64,
    pub device_id: String,
    pub error_count_intensity: u32,
    pub missing_count_intensity: u32,
    pub error_count_voltage: u32,
    pub missing_count_voltage: u32,
}

impl QualityRecord {
    pub fn error_count(&self, signal: Signal) -> u32 {
        match signal {
            Signal::Intensity => self.error_count_intensity,
            Signal::Voltage => self.error_count_voltage,
        }
    }

    pub fn missing_count(&self, signal: Signal) -> u32 {
        match signal {
            Signal::Intensity => self.missing_count_intensity,
            Signal::Voltage => self.missing_count_voltage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrradiancePoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Orders device ids by box, inverter, then string, comparing numerically when
/// both sides parse as integers ("9" before "10").
pub fn compare_device_ids(a: &str, b: &str) -> Ordering {
    let mut left = a.split('-');
    let mut right = b.split('-');
    loop {
        match (left.next(), right.next()) {
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn).then_with(|| l.cmp(r)),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

pub fn sort_device_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| compare_device_ids(a, b));
}
