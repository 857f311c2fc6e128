//! Core types for the battery energy tracker
//!
//! This module defines the data that flows through each tick: raw readings,
//! accumulated counter totals, charge-session state, charge-rate samples,
//! ledger entries and the published snapshot.

use crate::diagnostics::Diagnostics;
use crate::error::ReadingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Battery unit identifier, 1..=N for N configured batteries
pub type BatteryId = u8;

/// Conversion from raw counter units to kWh (1 unit is roughly 1 Wh)
pub const KWH_PER_COUNTER_UNIT: f64 = 0.001;

/// Cumulative counter reported by the battery management system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    Discharge,
    Charge,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Discharge => "discharge",
            CounterKind::Charge => "charge",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of raw signal read per battery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    DischargeCounter,
    ChargeCounter,
    Current,
    Voltage,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::DischargeCounter,
        SignalKind::ChargeCounter,
        SignalKind::Current,
        SignalKind::Voltage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::DischargeCounter => "discharge_counter",
            SignalKind::ChargeCounter => "charge_counter",
            SignalKind::Current => "current",
            SignalKind::Voltage => "voltage",
        }
    }

    /// Counter this signal feeds, if it is a counter signal
    pub fn counter_kind(&self) -> Option<CounterKind> {
        match self {
            SignalKind::DischargeCounter => Some(CounterKind::Discharge),
            SignalKind::ChargeCounter => Some(CounterKind::Charge),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single raw sample as reported by a sensor source
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(f64),
    Unavailable,
    Unknown,
    Invalid(String),
}

impl Reading {
    /// Parse a raw state string.
    ///
    /// `"unavailable"`, `"unknown"` and empty strings are availability markers;
    /// anything else that is not a finite number is `Invalid`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "" | "unavailable" => Reading::Unavailable,
            "unknown" => Reading::Unknown,
            other => match other.parse::<f64>() {
                Ok(v) if v.is_finite() => Reading::Value(v),
                _ => Reading::Invalid(other.to_string()),
            },
        }
    }

    /// Interpret a JSON value (number, string or null) as a reading
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Reading::Unavailable,
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) if v.is_finite() => Reading::Value(v),
                _ => Reading::Invalid(n.to_string()),
            },
            serde_json::Value::String(s) => Reading::parse(s),
            other => Reading::Invalid(other.to_string()),
        }
    }

    /// Numeric value, or why there is none
    pub fn value(&self) -> Result<f64, ReadingError> {
        match self {
            Reading::Value(v) => Ok(*v),
            Reading::Unavailable | Reading::Unknown => Err(ReadingError::SourceUnavailable),
            Reading::Invalid(raw) => Err(ReadingError::InvalidReading(raw.clone())),
        }
    }

    /// False only for the explicit unavailable marker
    pub fn is_available(&self) -> bool {
        !matches!(self, Reading::Unavailable)
    }

    /// Raw text for diagnostics
    pub fn raw_text(&self) -> String {
        match self {
            Reading::Value(v) => v.to_string(),
            Reading::Unavailable => "unavailable".to_string(),
            Reading::Unknown => "unknown".to_string(),
            Reading::Invalid(raw) => raw.clone(),
        }
    }
}

/// Accumulated totals in raw counter units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyTotals {
    pub total_discharge_counter: f64,
    pub total_charge_counter: f64,
    pub energy_since_last_charge_counter: f64,
}

impl EnergyTotals {
    pub fn total_discharge_kwh(&self) -> f64 {
        self.total_discharge_counter * KWH_PER_COUNTER_UNIT
    }

    pub fn total_charge_kwh(&self) -> f64 {
        self.total_charge_counter * KWH_PER_COUNTER_UNIT
    }

    pub fn energy_since_last_charge_kwh(&self) -> f64 {
        self.energy_since_last_charge_counter * KWH_PER_COUNTER_UNIT
    }
}

/// Charging flag plus session timing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargeSession {
    pub is_charging: bool,
    pub charge_start_time: Option<DateTime<Utc>>,
    pub last_charge_completed: Option<DateTime<Utc>>,
    /// Duration of the last completed session (hours)
    pub last_charge_duration_hours: Option<f64>,
}

/// Total instantaneous charge power at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub rate_w: f64,
    pub timestamp: DateTime<Utc>,
    pub active_unit_count: usize,
}

/// Reference point for the counter-derived charge rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCheckpoint {
    pub timestamp: DateTime<Utc>,
    pub total_charge_counter: f64,
}

/// Per-battery energy balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stored energy (kWh); absent until first charge/discharge or initialization
    pub stored_energy_kwh: Option<f64>,
    /// Usable capacity (kWh), always positive
    pub capacity_kwh: f64,
}

impl LedgerEntry {
    pub fn percent(&self) -> f64 {
        match self.stored_energy_kwh {
            Some(stored) if self.capacity_kwh > 0.0 => stored / self.capacity_kwh * 100.0,
            _ => 0.0,
        }
    }
}

/// Aggregate over every ledger entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub total_stored_kwh: f64,
    pub total_capacity_kwh: f64,
    pub total_percent: f64,
}

/// Charge power contributed by one battery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPower {
    pub current_a: f64,
    pub voltage_v: f64,
    pub power_w: f64,
}

/// Breakdown of the last charge-rate estimate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargeRateDiagnostics {
    pub instantaneous_total_w: f64,
    pub weighted_average_w: f64,
    pub counter_based_w: Option<f64>,
    pub blended_rate_w: f64,
    pub active_unit_count: usize,
    pub unit_power: BTreeMap<BatteryId, UnitPower>,
}

/// Producer metadata stamped on every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// Per-battery view in the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub stored_energy_kwh: Option<f64>,
    pub capacity_kwh: f64,
    pub percent: f64,
}

/// Read-only result of one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub producer: Producer,
    pub computed_at: DateTime<Utc>,
    pub total_discharge_counter: f64,
    pub total_charge_counter: f64,
    pub total_discharge_kwh: f64,
    pub total_charge_kwh: f64,
    pub energy_since_last_charge_counter: f64,
    pub energy_since_last_charge_kwh: f64,
    pub is_charging: bool,
    pub charge_start_time: Option<DateTime<Utc>>,
    pub last_charge_completed: Option<DateTime<Utc>>,
    pub last_charge_duration_hours: Option<f64>,
    pub estimated_charge_time_hours: f64,
    pub total_charge_rate_w: f64,
    pub charge_rate: Option<ChargeRateDiagnostics>,
    pub batteries: BTreeMap<BatteryId, BatterySnapshot>,
    pub total_stored_energy_kwh: f64,
    pub total_capacity_kwh: f64,
    pub total_stored_energy_percent: f64,
    pub retry_count: u32,
    pub diagnostics: Diagnostics,
}
