//! Entity mapping and sensor sources
//!
//! The tracker reads raw signals through two seams: an [`EntityMapper`] that
//! decides which source handle carries each (battery, signal) pair, and a
//! [`SensorSource`] that returns the current reading for a handle. Neither
//! performs registry discovery; hosts plug in their own implementations.

use crate::error::TrackerError;
use crate::types::{BatteryId, Reading, SignalKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Opaque identifier of a raw signal source
pub type SourceHandle = String;

/// Placeholder replaced with the battery number in naming templates
pub const BATTERY_PLACEHOLDER: &str = "{}";

/// Signals whose absence is reported as a missing entity
pub const REQUIRED_SIGNALS: [SignalKind; 3] = [
    SignalKind::DischargeCounter,
    SignalKind::ChargeCounter,
    SignalKind::Current,
];

/// Reads raw signal values
pub trait SensorSource {
    /// Current reading for a handle; unknown handles read as unavailable
    fn read(&self, handle: &str) -> Reading;

    fn is_available(&self, handle: &str) -> bool {
        self.read(handle).is_available()
    }
}

/// Produces the (battery, signal) to handle mapping
pub trait EntityMapper {
    fn map(&self, battery_count: u8) -> EntityMapping;
}

/// Resolved mapping from (battery, signal) to source handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityMapping {
    entries: BTreeMap<BatteryId, BTreeMap<SignalKind, SourceHandle>>,
}

impl EntityMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, battery: BatteryId, signal: SignalKind, handle: impl Into<String>) {
        self.entries
            .entry(battery)
            .or_default()
            .insert(signal, handle.into());
    }

    pub fn get(&self, battery: BatteryId, signal: SignalKind) -> Option<&str> {
        self.entries
            .get(&battery)
            .and_then(|signals| signals.get(&signal))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    /// Number of mapped handles
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Every mapped (battery, signal, handle) in battery then signal order
    pub fn iter(&self) -> impl Iterator<Item = (BatteryId, SignalKind, &str)> + '_ {
        self.entries.iter().flat_map(|(battery, signals)| {
            signals
                .iter()
                .map(move |(signal, handle)| (*battery, *signal, handle.as_str()))
        })
    }

    /// Handles of one signal kind across batteries
    pub fn signal(&self, signal: SignalKind) -> impl Iterator<Item = (BatteryId, &str)> + '_ {
        self.iter()
            .filter(move |(_, kind, _)| *kind == signal)
            .map(|(battery, _, handle)| (battery, handle))
    }

    /// Required signals that have no handle for batteries 1..=battery_count
    pub fn missing(&self, battery_count: u8) -> Vec<(BatteryId, SignalKind)> {
        (1..=battery_count)
            .flat_map(|battery| REQUIRED_SIGNALS.iter().map(move |signal| (battery, *signal)))
            .filter(|(battery, signal)| self.get(*battery, *signal).is_none())
            .collect()
    }
}

/// A fixed mapping can serve as its own mapper
impl EntityMapper for EntityMapping {
    fn map(&self, _battery_count: u8) -> EntityMapping {
        self.clone()
    }
}

/// Naming templates per signal; `{}` is replaced with the battery number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPatterns {
    pub discharge_counter: String,
    pub charge_counter: String,
    pub current: String,
    pub voltage: String,
}

impl Default for EntityPatterns {
    fn default() -> Self {
        // The BMS integration exposes the charge counter under the shorter name
        Self {
            discharge_counter: "sensor.pylontech_battery_{}_total_discharge_2".to_string(),
            charge_counter: "sensor.pylontech_battery_{}_total_discharge".to_string(),
            current: "sensor.pylontech_battery_{}_current".to_string(),
            voltage: "sensor.pylontech_battery_{}_pack_voltage".to_string(),
        }
    }
}

impl EntityPatterns {
    pub fn pattern(&self, signal: SignalKind) -> &str {
        match signal {
            SignalKind::DischargeCounter => &self.discharge_counter,
            SignalKind::ChargeCounter => &self.charge_counter,
            SignalKind::Current => &self.current,
            SignalKind::Voltage => &self.voltage,
        }
    }

    pub fn handle_for(&self, battery: BatteryId, signal: SignalKind) -> SourceHandle {
        self.pattern(signal)
            .replace(BATTERY_PLACEHOLDER, &battery.to_string())
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        for signal in SignalKind::ALL {
            if !self.pattern(signal).contains(BATTERY_PLACEHOLDER) {
                return Err(TrackerError::Config(format!(
                    "entity pattern for {signal} must contain {BATTERY_PLACEHOLDER}"
                )));
            }
        }
        Ok(())
    }
}

/// Explicit handles per signal, listed in battery order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualEntities {
    pub discharge_counter: Vec<SourceHandle>,
    pub charge_counter: Vec<SourceHandle>,
    pub current: Vec<SourceHandle>,
    pub voltage: Vec<SourceHandle>,
}

impl ManualEntities {
    pub fn entities(&self, signal: SignalKind) -> &[SourceHandle] {
        match signal {
            SignalKind::DischargeCounter => &self.discharge_counter,
            SignalKind::ChargeCounter => &self.charge_counter,
            SignalKind::Current => &self.current,
            SignalKind::Voltage => &self.voltage,
        }
    }
}

/// Mapper driven by manual lists and naming templates.
///
/// A non-empty manual list wins for its signal; batteries beyond the end of
/// the list stay unmapped. Signals without a manual list use the template.
#[derive(Debug, Clone, Default)]
pub struct PatternMapper {
    patterns: EntityPatterns,
    manual: Option<ManualEntities>,
}

impl PatternMapper {
    pub fn new(patterns: EntityPatterns, manual: Option<ManualEntities>) -> Self {
        Self { patterns, manual }
    }

    pub fn from_config(config: &crate::config::TrackerConfig) -> Self {
        Self::new(config.entity_patterns.clone(), config.manual_entities.clone())
    }
}

impl EntityMapper for PatternMapper {
    fn map(&self, battery_count: u8) -> EntityMapping {
        let mut mapping = EntityMapping::new();
        for signal in SignalKind::ALL {
            let manual = self
                .manual
                .as_ref()
                .map(|m| m.entities(signal))
                .filter(|list| !list.is_empty());

            for battery in 1..=battery_count {
                let handle = match manual {
                    Some(list) => list.get(usize::from(battery) - 1).cloned(),
                    None => Some(self.patterns.handle_for(battery, signal)),
                };
                if let Some(handle) = handle {
                    mapping.insert(battery, signal, handle);
                }
            }
        }
        tracing::debug!(handles = mapping.len(), battery_count, "built entity mapping");
        mapping
    }
}

/// In-memory source, updated by the caller between ticks
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    readings: HashMap<SourceHandle, Reading>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, handle: impl Into<String>, reading: Reading) {
        self.readings.insert(handle.into(), reading);
    }

    /// Set from a raw state string
    pub fn set_raw(&mut self, handle: impl Into<String>, raw: &str) {
        self.set(handle, Reading::parse(raw));
    }

    /// Apply a JSON object of handle to number/string/null
    pub fn update_from_json(&mut self, readings: &serde_json::Map<String, serde_json::Value>) {
        for (handle, value) in readings {
            self.set(handle.clone(), Reading::from_json(value));
        }
    }

    pub fn remove(&mut self, handle: &str) {
        self.readings.remove(handle);
    }
}

impl SensorSource for StaticSource {
    fn read(&self, handle: &str) -> Reading {
        self.readings
            .get(handle)
            .cloned()
            .unwrap_or(Reading::Unavailable)
    }
}
