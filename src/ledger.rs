//! Per-battery energy ledger
//!
//! Keeps a capacity-bounded stored-energy balance for every battery. Counter
//! deltas move the balance during ticks; administrative calls set it directly.
//! Every stored value stays within `[0, capacity]`.

use crate::counter::DeltaEvent;
use crate::error::TrackerError;
use crate::types::{BatteryId, CounterKind, LedgerEntry, LedgerTotals, KWH_PER_COUNTER_UNIT};
use std::collections::BTreeMap;

/// Default usable capacity of one battery (kWh)
pub const DEFAULT_CAPACITY_KWH: f64 = 5.12;

/// Default fill fraction used by [`EnergyLedger::initialize_all`]
pub const DEFAULT_FILL_FRACTION: f64 = 0.5;

/// Capacity-clamped energy balance for a fixed set of batteries
#[derive(Debug, Clone)]
pub struct EnergyLedger {
    battery_count: u8,
    default_capacity_kwh: f64,
    entries: BTreeMap<BatteryId, LedgerEntry>,
    totals: LedgerTotals,
}

impl EnergyLedger {
    pub fn new(battery_count: u8) -> Self {
        Self::with_default_capacity(battery_count, DEFAULT_CAPACITY_KWH)
    }

    pub fn with_default_capacity(battery_count: u8, default_capacity_kwh: f64) -> Self {
        Self {
            battery_count,
            default_capacity_kwh,
            entries: BTreeMap::new(),
            totals: LedgerTotals::default(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<BatteryId, LedgerEntry> {
        &self.entries
    }

    pub fn entry(&self, battery: BatteryId) -> Option<&LedgerEntry> {
        self.entries.get(&battery)
    }

    /// Totals as of the last aggregation
    pub fn totals(&self) -> LedgerTotals {
        self.totals
    }

    /// Replace all entries, clamping each into range. Entries for batteries
    /// outside the configured bank are dropped.
    pub fn restore(&mut self, entries: BTreeMap<BatteryId, LedgerEntry>) {
        let bank = 1..=self.battery_count;
        self.entries = entries
            .into_iter()
            .filter(|(battery, entry)| bank.contains(battery) && entry.capacity_kwh > 0.0)
            .map(|(battery, mut entry)| {
                entry.stored_energy_kwh = entry
                    .stored_energy_kwh
                    .map(|stored| stored.clamp(0.0, entry.capacity_kwh));
                (battery, entry)
            })
            .collect();
        self.aggregate();
    }

    /// Apply a counter delta to a battery's balance
    pub fn apply(&mut self, event: &DeltaEvent) {
        let energy_kwh = event.delta * KWH_PER_COUNTER_UNIT;
        let default_capacity = self.default_capacity_kwh;
        let entry = self.entries.entry(event.battery).or_insert_with(|| LedgerEntry {
            stored_energy_kwh: None,
            capacity_kwh: default_capacity,
        });
        let stored = entry.stored_energy_kwh.unwrap_or(0.0);

        let updated = match event.kind {
            CounterKind::Discharge => (stored - energy_kwh).max(0.0),
            CounterKind::Charge => (stored + energy_kwh).min(entry.capacity_kwh),
        };
        entry.stored_energy_kwh = Some(updated);

        tracing::debug!(
            battery = event.battery,
            kind = %event.kind,
            energy_kwh,
            stored_kwh = updated,
            "ledger updated"
        );
    }

    /// Recompute total stored energy, total capacity and fill percentage
    pub fn aggregate(&mut self) -> LedgerTotals {
        let total_stored_kwh: f64 = self
            .entries
            .values()
            .filter_map(|entry| entry.stored_energy_kwh)
            .sum();
        let total_capacity_kwh: f64 = self.entries.values().map(|entry| entry.capacity_kwh).sum();
        let total_percent = if total_capacity_kwh > 0.0 {
            total_stored_kwh / total_capacity_kwh * 100.0
        } else {
            0.0
        };

        self.totals = LedgerTotals {
            total_stored_kwh,
            total_capacity_kwh,
            total_percent,
        };

        tracing::debug!(
            total_stored_kwh,
            total_percent,
            "ledger aggregated"
        );
        self.totals
    }

    /// Set a battery's stored energy, optionally updating its capacity first.
    ///
    /// The energy is clamped to the resulting capacity.
    pub fn set_stored_energy(
        &mut self,
        battery: BatteryId,
        energy_kwh: f64,
        capacity_kwh: Option<f64>,
    ) -> Result<LedgerTotals, TrackerError> {
        self.check_battery(battery)?;
        if !energy_kwh.is_finite() || energy_kwh < 0.0 {
            return Err(TrackerError::Validation(format!(
                "energy value cannot be negative: {energy_kwh}"
            )));
        }
        if let Some(capacity) = capacity_kwh {
            check_capacity(capacity)?;
        }

        let entry = self.entry_or_default(battery);
        if let Some(capacity) = capacity_kwh {
            entry.capacity_kwh = capacity;
        }
        let stored = energy_kwh.min(entry.capacity_kwh);
        entry.stored_energy_kwh = Some(stored);

        tracing::info!(
            battery,
            stored_kwh = stored,
            capacity_kwh = entry.capacity_kwh,
            "set battery stored energy"
        );
        Ok(self.aggregate())
    }

    /// Fill one battery, or every configured battery, to capacity
    pub fn set_to_full(&mut self, battery: Option<BatteryId>) -> Result<LedgerTotals, TrackerError> {
        let batteries: Vec<BatteryId> = match battery {
            Some(battery) => {
                self.check_battery(battery)?;
                vec![battery]
            }
            None => (1..=self.battery_count).collect(),
        };

        for battery in batteries {
            let entry = self.entry_or_default(battery);
            entry.stored_energy_kwh = Some(entry.capacity_kwh);
            tracing::info!(battery, capacity_kwh = entry.capacity_kwh, "set battery to full");
        }
        Ok(self.aggregate())
    }

    /// Change a battery's capacity, re-clamping its stored energy
    pub fn set_capacity(
        &mut self,
        battery: BatteryId,
        capacity_kwh: f64,
    ) -> Result<LedgerTotals, TrackerError> {
        self.check_battery(battery)?;
        check_capacity(capacity_kwh)?;

        let entry = self.entry_or_default(battery);
        entry.capacity_kwh = capacity_kwh;
        entry.stored_energy_kwh = entry.stored_energy_kwh.map(|stored| stored.min(capacity_kwh));

        tracing::info!(battery, capacity_kwh, "set battery capacity");
        Ok(self.aggregate())
    }

    /// Give every configured battery a capacity and a starting balance.
    ///
    /// Batteries that already have a value keep it.
    pub fn initialize_all(&mut self, fill_fraction: f64) -> Result<LedgerTotals, TrackerError> {
        if !(0.0..=1.0).contains(&fill_fraction) {
            return Err(TrackerError::Validation(format!(
                "fill fraction must be within 0..=1: {fill_fraction}"
            )));
        }

        for battery in 1..=self.battery_count {
            let entry = self.entry_or_default(battery);
            if entry.stored_energy_kwh.is_none() {
                entry.stored_energy_kwh = Some(entry.capacity_kwh * fill_fraction);
            }
        }

        tracing::info!(batteries = self.battery_count, "initialized battery ledger");
        Ok(self.aggregate())
    }

    fn entry_or_default(&mut self, battery: BatteryId) -> &mut LedgerEntry {
        let default_capacity = self.default_capacity_kwh;
        self.entries.entry(battery).or_insert_with(|| LedgerEntry {
            stored_energy_kwh: None,
            capacity_kwh: default_capacity,
        })
    }

    fn check_battery(&self, battery: BatteryId) -> Result<(), TrackerError> {
        if battery == 0 || battery > self.battery_count {
            tracing::error!(battery, "invalid battery number");
            return Err(TrackerError::UnknownBattery(battery));
        }
        Ok(())
    }
}

fn check_capacity(capacity_kwh: f64) -> Result<(), TrackerError> {
    if !capacity_kwh.is_finite() || capacity_kwh <= 0.0 {
        return Err(TrackerError::Validation(format!(
            "capacity value must be positive: {capacity_kwh}"
        )));
    }
    Ok(())
}
