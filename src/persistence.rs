//! Persisted tracker state
//!
//! Totals and ledger survive restarts. Raw previous counter values, rate
//! samples and the rate checkpoint do not; the first tick after a restore
//! re-baselines every counter.

use crate::error::TrackerError;
use crate::types::{BatteryId, LedgerEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedTotals {
    pub total_discharge_counter: f64,
    pub total_charge_counter: f64,
    pub energy_since_last_charge_counter: f64,
    pub last_charge_completed: Option<DateTime<Utc>>,
    pub last_charge_duration_hours: Option<f64>,
    pub batteries: BTreeMap<BatteryId, LedgerEntry>,
}

impl PersistedTotals {
    pub fn to_json(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        let state: Self = serde_json::from_str(json)?;
        for (name, value) in [
            ("total_discharge_counter", state.total_discharge_counter),
            ("total_charge_counter", state.total_charge_counter),
            (
                "energy_since_last_charge_counter",
                state.energy_since_last_charge_counter,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TrackerError::Validation(format!(
                    "persisted {name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(state)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, TrackerError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), TrackerError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
