//! Tracker configuration
//!
//! Loaded from JSON; every field has a default so a partial file (or `{}`)
//! is a valid configuration.

use crate::error::TrackerError;
use crate::ledger::{DEFAULT_CAPACITY_KWH, DEFAULT_FILL_FRACTION};
use crate::mapping::{EntityPatterns, ManualEntities};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Nominal charge rate used when no measured rate is available (W)
pub const DEFAULT_CHARGE_RATE_W: f64 = 1500.0;

pub const DEFAULT_BATTERY_COUNT: u8 = 4;
pub const MAX_BATTERY_COUNT: u8 = 16;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const MAX_STARTUP_DELAY_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Number of battery units, ids 1..=battery_count
    pub battery_count: u8,
    /// Nominal charge rate for time estimates (W)
    pub charge_rate_w: f64,
    pub tick_interval_secs: u64,
    /// Delay before re-running a tick while sources are unavailable
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    /// Wait before the first tick so sources can come up
    pub startup_delay_secs: u64,
    pub default_capacity_kwh: f64,
    /// Fraction of capacity assigned by initialize_all
    pub initial_fill_fraction: f64,
    pub entity_patterns: EntityPatterns,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_entities: Option<ManualEntities>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            battery_count: DEFAULT_BATTERY_COUNT,
            charge_rate_w: DEFAULT_CHARGE_RATE_W,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            startup_delay_secs: 0,
            default_capacity_kwh: DEFAULT_CAPACITY_KWH,
            initial_fill_fraction: DEFAULT_FILL_FRACTION,
            entity_patterns: EntityPatterns::default(),
            manual_entities: None,
        }
    }
}

impl TrackerConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, TrackerError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json_pretty(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.battery_count == 0 || self.battery_count > MAX_BATTERY_COUNT {
            return Err(TrackerError::Config(format!(
                "battery_count must be within 1..={MAX_BATTERY_COUNT}, got {}",
                self.battery_count
            )));
        }
        if !(100.0..=10_000.0).contains(&self.charge_rate_w) {
            return Err(TrackerError::Config(format!(
                "charge_rate_w must be within 100..=10000, got {}",
                self.charge_rate_w
            )));
        }
        if self.tick_interval_secs == 0 {
            return Err(TrackerError::Config(
                "tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.startup_delay_secs > MAX_STARTUP_DELAY_SECS {
            return Err(TrackerError::Config(format!(
                "startup_delay_secs must be at most {MAX_STARTUP_DELAY_SECS}, got {}",
                self.startup_delay_secs
            )));
        }
        if !self.default_capacity_kwh.is_finite() || self.default_capacity_kwh <= 0.0 {
            return Err(TrackerError::Config(format!(
                "default_capacity_kwh must be positive, got {}",
                self.default_capacity_kwh
            )));
        }
        if !(0.0..=1.0).contains(&self.initial_fill_fraction) {
            return Err(TrackerError::Config(format!(
                "initial_fill_fraction must be within 0..=1, got {}",
                self.initial_fill_fraction
            )));
        }
        self.entity_patterns.validate()?;
        Ok(())
    }
}
