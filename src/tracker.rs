//! Update orchestration
//!
//! [`BatteryTracker`] owns every piece of tracker state and runs the stages in
//! a fixed order once per tick:
//!
//! 1. Ensure an entity mapping exists
//! 2. Read all mapped sources and track availability retries
//! 3. CounterDeltaProcessor - counter deltas, fed into the ledger
//! 4. ChargingStateMachine - charging flag and session timing
//! 5. ChargeRateEstimator - blended rate, only while charging
//! 6. EnergyLedger - aggregation
//! 7. Snapshot assembly
//!
//! Administrative operations mutate the same state between ticks.

use crate::charge_rate::ChargeRateEstimator;
use crate::charge_state::{ChargingStateMachine, Transition};
use crate::commands::Command;
use crate::config::TrackerConfig;
use crate::counter::CounterDeltaProcessor;
use crate::diagnostics::Diagnostics;
use crate::error::TrackerError;
use crate::ledger::EnergyLedger;
use crate::mapping::{EntityMapper, EntityMapping, SensorSource};
use crate::persistence::PersistedTotals;
use crate::types::{
    BatteryId, BatterySnapshot, ChargeSession, EnergyTotals, Producer, Reading, SignalKind,
    Snapshot,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Real-world derating applied to the ideal charge time
pub const CHARGE_TIME_DERATING: f64 = 1.2;

/// Measured rates at or below this fall back to the nominal rate (W)
pub const MIN_MEASURED_RATE_W: f64 = 100.0;

/// Hours needed to put back the energy used since the last charge.
///
/// Uses the measured rate while charging if it is meaningful, otherwise the
/// nominal rate.
pub fn estimated_charge_time_hours(
    energy_since_last_charge_kwh: f64,
    is_charging: bool,
    measured_rate_w: f64,
    nominal_rate_w: f64,
) -> f64 {
    if energy_since_last_charge_kwh <= 0.0 {
        return 0.0;
    }
    let effective_rate_w = if is_charging && measured_rate_w > MIN_MEASURED_RATE_W {
        measured_rate_w
    } else {
        nominal_rate_w
    };
    if effective_rate_w <= 0.0 {
        return 0.0;
    }
    energy_since_last_charge_kwh * 1000.0 / effective_rate_w * CHARGE_TIME_DERATING
}

/// Result of one tick
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub snapshot: Snapshot,
    /// Some sources were unavailable and a retry tick should be scheduled
    pub retry_requested: bool,
}

/// Single owner of all tracker state
#[derive(Debug, Clone)]
pub struct BatteryTracker {
    config: TrackerConfig,
    producer: Producer,
    mapping: EntityMapping,
    counters: CounterDeltaProcessor,
    totals: EnergyTotals,
    charging: ChargingStateMachine,
    rate: ChargeRateEstimator,
    ledger: EnergyLedger,
    retry_count: u32,
    /// A manual charge state was set; the next tick keeps it instead of
    /// evaluating currents
    manual_charge_hold: bool,
}

/// What the availability check decided for this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Available,
    RetryScheduled,
    Exhausted,
}

impl BatteryTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let ledger =
            EnergyLedger::with_default_capacity(config.battery_count, config.default_capacity_kwh);
        Self {
            producer: Producer {
                name: crate::PRODUCER_NAME.to_string(),
                version: crate::TRACKER_VERSION.to_string(),
                instance_id: Uuid::new_v4().to_string(),
            },
            config,
            mapping: EntityMapping::new(),
            counters: CounterDeltaProcessor::new(),
            totals: EnergyTotals::default(),
            charging: ChargingStateMachine::new(),
            rate: ChargeRateEstimator::new(),
            ledger,
            retry_count: 0,
            manual_charge_hold: false,
        }
    }

    /// Validate the configuration, then build a tracker
    pub fn with_config(config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    pub fn totals(&self) -> EnergyTotals {
        self.totals
    }

    pub fn session(&self) -> &ChargeSession {
        self.charging.session()
    }

    pub fn ledger(&self) -> &EnergyLedger {
        &self.ledger
    }

    pub fn estimator(&self) -> &ChargeRateEstimator {
        &self.rate
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Run one full update cycle
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        source: &dyn SensorSource,
        mapper: &dyn EntityMapper,
    ) -> TickOutcome {
        let battery_count = self.config.battery_count;
        let mut diagnostics = Diagnostics::new();

        // Stage 1: mapping, re-requested only while nothing has been found
        if self.mapping.is_empty() {
            self.mapping = mapper.map(battery_count);
            if self.mapping.is_empty() {
                tracing::warn!(battery_count, "no battery entities detected");
            } else {
                tracing::info!(handles = self.mapping.len(), "battery entities mapped");
            }
        }
        diagnostics.record_missing(&self.mapping.missing(battery_count));

        // Stage 2: read every source once and track availability
        let mut readings: BTreeMap<(BatteryId, SignalKind), Reading> = BTreeMap::new();
        for (battery, signal, handle) in self.mapping.iter() {
            let reading = source.read(handle);
            diagnostics.record_signal(battery, signal, handle, &reading);
            readings.insert((battery, signal), reading);
        }
        let availability =
            self.track_availability(self.mapping.is_empty() || diagnostics.has_unavailable());
        let retry_requested = availability == Availability::RetryScheduled;
        diagnostics.retry_count = self.retry_count;
        diagnostics.persistent_unavailability = availability == Availability::Exhausted;

        // Stage 3: counters feed totals and ledger
        for ((battery, signal), reading) in &readings {
            let Some(kind) = signal.counter_kind() else {
                continue;
            };
            let previous = self.counters.previous(*battery, kind);
            if let Ok(outcome) = self
                .counters
                .process(*battery, kind, reading, &mut self.totals)
            {
                diagnostics.record_counter(*battery, kind, previous, reading, &outcome);
                if let Some(event) = outcome.event() {
                    self.ledger.apply(&event);
                }
            }
        }

        // Stage 4: charging state, skipped once right after a manual override
        if std::mem::take(&mut self.manual_charge_hold) {
            tracing::debug!(
                is_charging = self.charging.is_charging(),
                "keeping manual charge state for this tick"
            );
        } else {
            let currents = readings
                .iter()
                .filter(|((_, signal), _)| *signal == SignalKind::Current)
                .map(|((battery, _), reading)| (*battery, reading));
            self.charging.evaluate(currents, now, &mut self.totals);
        }

        // Stage 5: charge rate while charging
        if self.charging.is_charging() {
            let units: Vec<(BatteryId, &Reading, &Reading)> = (1..=battery_count)
                .filter_map(|battery| {
                    let current = readings.get(&(battery, SignalKind::Current))?;
                    let voltage = readings.get(&(battery, SignalKind::Voltage))?;
                    Some((battery, current, voltage))
                })
                .collect();
            self.rate
                .update(units, self.totals.total_charge_counter, true, now);
        }

        // Stage 6: ledger aggregation
        self.ledger.aggregate();

        tracing::debug!(
            total_discharge = self.totals.total_discharge_counter,
            total_charge = self.totals.total_charge_counter,
            energy_since_last_charge = self.totals.energy_since_last_charge_counter,
            is_charging = self.charging.is_charging(),
            "tick complete"
        );

        TickOutcome {
            snapshot: self.snapshot(now, diagnostics),
            retry_requested,
        }
    }

    /// Update the retry counter
    fn track_availability(&mut self, any_unavailable: bool) -> Availability {
        if !any_unavailable {
            if self.retry_count > 0 {
                tracing::info!(retries = self.retry_count, "all battery sources available");
            }
            self.retry_count = 0;
            return Availability::Available;
        }

        if self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            tracing::warn!(
                attempt = self.retry_count,
                max_retries = self.config.max_retries,
                delay_secs = self.config.retry_delay_secs,
                "some battery sources unavailable, scheduling retry"
            );
            Availability::RetryScheduled
        } else {
            tracing::error!(
                max_retries = self.config.max_retries,
                "battery sources still unavailable after maximum retries"
            );
            Availability::Exhausted
        }
    }

    /// Assemble a snapshot from the current state
    pub fn snapshot(&self, now: DateTime<Utc>, diagnostics: Diagnostics) -> Snapshot {
        let session = self.charging.session();
        let ledger_totals = self.ledger.totals();
        let total_charge_rate_w = self.rate.total_charge_rate_w();

        let batteries = self
            .ledger
            .entries()
            .iter()
            .map(|(battery, entry)| {
                (
                    *battery,
                    BatterySnapshot {
                        stored_energy_kwh: entry.stored_energy_kwh,
                        capacity_kwh: entry.capacity_kwh,
                        percent: entry.percent(),
                    },
                )
            })
            .collect();

        Snapshot {
            producer: self.producer.clone(),
            computed_at: now,
            total_discharge_counter: self.totals.total_discharge_counter,
            total_charge_counter: self.totals.total_charge_counter,
            total_discharge_kwh: self.totals.total_discharge_kwh(),
            total_charge_kwh: self.totals.total_charge_kwh(),
            energy_since_last_charge_counter: self.totals.energy_since_last_charge_counter,
            energy_since_last_charge_kwh: self.totals.energy_since_last_charge_kwh(),
            is_charging: session.is_charging,
            charge_start_time: session.charge_start_time,
            last_charge_completed: session.last_charge_completed,
            last_charge_duration_hours: session.last_charge_duration_hours,
            estimated_charge_time_hours: estimated_charge_time_hours(
                self.totals.energy_since_last_charge_kwh(),
                session.is_charging,
                total_charge_rate_w,
                self.config.charge_rate_w,
            ),
            total_charge_rate_w,
            charge_rate: self.rate.last_diagnostics().cloned(),
            batteries,
            total_stored_energy_kwh: ledger_totals.total_stored_kwh,
            total_capacity_kwh: ledger_totals.total_capacity_kwh,
            total_stored_energy_percent: ledger_totals.total_percent,
            retry_count: self.retry_count,
            diagnostics,
        }
    }

    pub fn reset_counters(&mut self) {
        tracing::info!("resetting all energy counters");
        self.totals = EnergyTotals::default();
    }

    pub fn reset_energy_since_charge(&mut self) {
        tracing::info!("resetting energy since last charge counter");
        self.totals.energy_since_last_charge_counter = 0.0;
    }

    /// Force the charging state. The next tick keeps it; the one after
    /// evaluates currents again.
    pub fn set_charge_state(&mut self, is_charging: bool, now: DateTime<Utc>) -> Option<Transition> {
        self.manual_charge_hold = true;
        self.charging.set_manual(is_charging, now, &mut self.totals)
    }

    /// Add signed deltas to the running totals, clamping at zero
    pub fn adjust_counters(
        &mut self,
        discharge_delta: Option<f64>,
        charge_delta: Option<f64>,
    ) -> Result<(), TrackerError> {
        for delta in [discharge_delta, charge_delta].into_iter().flatten() {
            if !delta.is_finite() {
                return Err(TrackerError::Validation(format!(
                    "counter adjustment must be finite: {delta}"
                )));
            }
        }

        if let Some(delta) = discharge_delta {
            self.totals.total_discharge_counter =
                (self.totals.total_discharge_counter + delta).max(0.0);
            tracing::info!(
                total = self.totals.total_discharge_counter,
                kwh = self.totals.total_discharge_kwh(),
                "adjusted total discharge counter"
            );
        }
        if let Some(delta) = charge_delta {
            self.totals.total_charge_counter = (self.totals.total_charge_counter + delta).max(0.0);
            tracing::info!(
                total = self.totals.total_charge_counter,
                kwh = self.totals.total_charge_kwh(),
                "adjusted total charge counter"
            );
        }
        Ok(())
    }

    pub fn set_stored_energy(
        &mut self,
        battery: BatteryId,
        energy_kwh: f64,
        capacity_kwh: Option<f64>,
    ) -> Result<(), TrackerError> {
        self.ledger
            .set_stored_energy(battery, energy_kwh, capacity_kwh)
            .map(|_| ())
    }

    pub fn set_to_full(&mut self, battery: Option<BatteryId>) -> Result<(), TrackerError> {
        self.ledger.set_to_full(battery).map(|_| ())
    }

    pub fn set_capacity(&mut self, battery: BatteryId, capacity_kwh: f64) -> Result<(), TrackerError> {
        self.ledger.set_capacity(battery, capacity_kwh).map(|_| ())
    }

    pub fn initialize_all(&mut self) -> Result<(), TrackerError> {
        self.ledger
            .initialize_all(self.config.initial_fill_fraction)
            .map(|_| ())
    }

    /// Dispatch an administrative command
    pub fn execute(&mut self, command: Command, now: DateTime<Utc>) -> Result<(), TrackerError> {
        tracing::debug!(command = command.name(), "executing command");
        match command {
            Command::ResetCounters => self.reset_counters(),
            Command::ResetEnergySinceCharge => self.reset_energy_since_charge(),
            Command::SetChargeState { is_charging } => {
                self.set_charge_state(is_charging, now);
            }
            Command::AdjustCounters {
                discharge_delta,
                charge_delta,
            } => self.adjust_counters(discharge_delta, charge_delta)?,
            Command::SetStoredEnergy {
                battery,
                energy_kwh,
                capacity_kwh,
            } => self.set_stored_energy(battery, energy_kwh, capacity_kwh)?,
            Command::SetToFull { battery } => self.set_to_full(battery)?,
            Command::SetCapacity {
                battery,
                capacity_kwh,
            } => self.set_capacity(battery, capacity_kwh)?,
            Command::InitializeAll => self.initialize_all()?,
        }
        Ok(())
    }

    /// State worth keeping across restarts
    pub fn persisted(&self) -> PersistedTotals {
        let session = self.charging.session();
        PersistedTotals {
            total_discharge_counter: self.totals.total_discharge_counter,
            total_charge_counter: self.totals.total_charge_counter,
            energy_since_last_charge_counter: self.totals.energy_since_last_charge_counter,
            last_charge_completed: session.last_charge_completed,
            last_charge_duration_hours: session.last_charge_duration_hours,
            batteries: self.ledger.entries().clone(),
        }
    }

    /// Restore persisted totals; the charging flag starts cleared
    pub fn restore(&mut self, state: PersistedTotals) {
        self.totals = EnergyTotals {
            total_discharge_counter: state.total_discharge_counter,
            total_charge_counter: state.total_charge_counter,
            energy_since_last_charge_counter: state.energy_since_last_charge_counter,
        };
        self.charging = ChargingStateMachine::from_session(ChargeSession {
            is_charging: false,
            charge_start_time: None,
            last_charge_completed: state.last_charge_completed,
            last_charge_duration_hours: state.last_charge_duration_hours,
        });
        self.manual_charge_hold = false;
        self.ledger.restore(state.batteries);
        tracing::info!(
            total_discharge = self.totals.total_discharge_counter,
            total_charge = self.totals.total_charge_counter,
            batteries = self.ledger.entries().len(),
            "restored persisted totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{PatternMapper, StaticSource};
    use crate::types::LedgerEntry;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn handle(battery: BatteryId, signal: SignalKind) -> String {
        format!("b{battery}_{signal}")
    }

    fn mapping(battery_count: u8) -> EntityMapping {
        let mut mapping = EntityMapping::new();
        for battery in 1..=battery_count {
            for signal in SignalKind::ALL {
                mapping.insert(battery, signal, handle(battery, signal));
            }
        }
        mapping
    }

    fn tracker(battery_count: u8) -> BatteryTracker {
        BatteryTracker::new(TrackerConfig {
            battery_count,
            ..TrackerConfig::default()
        })
    }

    struct Frame {
        discharge: f64,
        charge: f64,
        current: f64,
        voltage: f64,
    }

    fn frame(discharge: f64, charge: f64, current: f64) -> Frame {
        Frame {
            discharge,
            charge,
            current,
            voltage: 50.0,
        }
    }

    fn set_battery(source: &mut StaticSource, battery: BatteryId, f: &Frame) {
        source.set(handle(battery, SignalKind::DischargeCounter), Reading::Value(f.discharge));
        source.set(handle(battery, SignalKind::ChargeCounter), Reading::Value(f.charge));
        source.set(handle(battery, SignalKind::Current), Reading::Value(f.current));
        source.set(handle(battery, SignalKind::Voltage), Reading::Value(f.voltage));
    }

    #[test]
    fn test_estimated_charge_time() {
        // 3 kWh at nominal 1500 W: 2 h * 1.2
        assert!((estimated_charge_time_hours(3.0, false, 0.0, 1500.0) - 2.4).abs() < 1e-9);
        // Measured rate used only while charging and above the floor
        assert!((estimated_charge_time_hours(3.0, true, 3000.0, 1500.0) - 1.2).abs() < 1e-9);
        assert!((estimated_charge_time_hours(3.0, true, 80.0, 1500.0) - 2.4).abs() < 1e-9);
        assert!((estimated_charge_time_hours(3.0, false, 3000.0, 1500.0) - 2.4).abs() < 1e-9);
        assert_eq!(estimated_charge_time_hours(0.0, true, 3000.0, 1500.0), 0.0);
    }

    #[test]
    fn test_discharge_then_charge_flow() {
        let mut tracker = tracker(1);
        let mapper = mapping(1);
        let mut source = StaticSource::new();
        tracker.initialize_all().unwrap();

        set_battery(&mut source, 1, &frame(1000.0, 500.0, 0.0));
        let first = tracker.tick(at(0), &source, &mapper);
        assert_eq!(first.snapshot.total_discharge_counter, 0.0);
        assert!(!first.retry_requested);

        set_battery(&mut source, 1, &frame(1400.0, 500.0, -8.0));
        let second = tracker.tick(at(1), &source, &mapper).snapshot;
        assert_eq!(second.total_discharge_counter, 400.0);
        assert!((second.energy_since_last_charge_kwh - 0.4).abs() < 1e-9);
        assert!((second.total_stored_energy_kwh - (2.56 - 0.4)).abs() < 1e-9);
        // 0.4 kWh at nominal 1500 W, derated
        assert!((second.estimated_charge_time_hours - 0.4 * 1000.0 / 1500.0 * 1.2).abs() < 1e-9);

        set_battery(&mut source, 1, &frame(1400.0, 700.0, 20.0));
        let third = tracker.tick(at(2), &source, &mapper).snapshot;
        assert!(third.is_charging);
        assert_eq!(third.charge_start_time, Some(at(2)));
        assert_eq!(third.total_charge_counter, 200.0);
        assert!((third.total_charge_rate_w - 1000.0).abs() < 1e-9);
        let rate = third.charge_rate.unwrap();
        assert_eq!(rate.active_unit_count, 1);
        assert_eq!(rate.counter_based_w, None);
    }

    #[test]
    fn test_rollover_through_tick() {
        let mut tracker = tracker(1);
        let mapper = mapping(1);
        let mut source = StaticSource::new();

        set_battery(&mut source, 1, &frame(65200.0, 0.0, 0.0));
        tracker.tick(at(0), &source, &mapper);
        set_battery(&mut source, 1, &frame(500.0, 0.0, 0.0));
        let snapshot = tracker.tick(at(1), &source, &mapper).snapshot;

        assert!((snapshot.total_discharge_counter - 835.0).abs() < 1e-9);
        let activity = snapshot
            .diagnostics
            .counter_activity
            .iter()
            .find(|a| a.kind == crate::types::CounterKind::Discharge)
            .unwrap();
        assert!(activity.rollover);
        assert_eq!(activity.previous, Some(65200.0));
    }

    #[test]
    fn test_unavailable_sources_request_retries_until_exhausted() {
        let mut tracker = BatteryTracker::new(TrackerConfig {
            battery_count: 1,
            max_retries: 2,
            ..TrackerConfig::default()
        });
        let mapper = mapping(1);
        let mut source = StaticSource::new();
        set_battery(&mut source, 1, &frame(10.0, 10.0, 0.0));
        source.remove(&handle(1, SignalKind::Voltage));

        let first = tracker.tick(at(0), &source, &mapper);
        assert!(first.retry_requested);
        assert_eq!(first.snapshot.retry_count, 1);
        // Available signals are still processed
        assert_eq!(tracker.counters.previous(1, crate::types::CounterKind::Charge), Some(10.0));

        assert!(!first.snapshot.diagnostics.persistent_unavailability);

        // Reaching the limit still schedules the last retry
        let last_retry = tracker.tick(at(1), &source, &mapper);
        assert!(last_retry.retry_requested);
        assert_eq!(last_retry.snapshot.retry_count, 2);
        assert!(!last_retry.snapshot.diagnostics.persistent_unavailability);

        let exhausted = tracker.tick(at(2), &source, &mapper);
        assert!(!exhausted.retry_requested);
        assert_eq!(exhausted.snapshot.retry_count, 2);
        assert!(exhausted.snapshot.diagnostics.persistent_unavailability);

        set_battery(&mut source, 1, &frame(10.0, 10.0, 0.0));
        let recovered = tracker.tick(at(3), &source, &mapper);
        assert_eq!(recovered.snapshot.retry_count, 0);
        assert!(!recovered.snapshot.diagnostics.persistent_unavailability);
    }

    #[test]
    fn test_empty_mapping_rerequested() {
        let mut tracker = tracker(1);
        let source = StaticSource::new();

        let outcome = tracker.tick(at(0), &source, &EntityMapping::new());
        assert!(outcome.retry_requested);
        assert_eq!(outcome.snapshot.diagnostics.missing_entities.len(), 3);

        tracker.tick(at(1), &source, &PatternMapper::default());
        assert_eq!(tracker.mapping().len(), 4);
    }

    #[test]
    fn test_abnormal_values_reported() {
        let mut tracker = tracker(1);
        let mapper = mapping(1);
        let mut source = StaticSource::new();
        set_battery(&mut source, 1, &frame(-5.0, 10.0, 250.0));
        source.set_raw(handle(1, SignalKind::Voltage), "garbage");

        let diagnostics = tracker.tick(at(0), &source, &mapper).snapshot.diagnostics;
        assert_eq!(diagnostics.abnormal_values.len(), 3);
    }

    #[test]
    fn test_admin_validation_leaves_state() {
        let mut tracker = tracker(2);
        tracker.initialize_all().unwrap();
        let before = tracker.ledger().entries().clone();

        let result = tracker.execute(
            Command::SetStoredEnergy {
                battery: 1,
                energy_kwh: -1.0,
                capacity_kwh: None,
            },
            at(0),
        );
        assert!(result.unwrap_err().is_validation());
        let result = tracker.execute(
            Command::SetCapacity {
                battery: 9,
                capacity_kwh: 4.0,
            },
            at(0),
        );
        assert!(matches!(result, Err(TrackerError::UnknownBattery(9))));
        assert_eq!(tracker.ledger().entries(), &before);
    }

    #[test]
    fn test_adjust_and_reset_counters() {
        let mut tracker = tracker(1);
        tracker
            .execute(
                Command::AdjustCounters {
                    discharge_delta: Some(500.0),
                    charge_delta: Some(-20.0),
                },
                at(0),
            )
            .unwrap();
        assert_eq!(tracker.totals().total_discharge_counter, 500.0);
        assert_eq!(tracker.totals().total_charge_counter, 0.0);
        assert_eq!(tracker.totals().energy_since_last_charge_counter, 0.0);

        tracker.execute(Command::ResetCounters, at(1)).unwrap();
        assert_eq!(tracker.totals(), EnergyTotals::default());

        let result = tracker.adjust_counters(Some(f64::NAN), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_manual_charge_state_through_execute() {
        let mut tracker = tracker(1);
        tracker
            .execute(Command::SetChargeState { is_charging: true }, at(0))
            .unwrap();
        assert!(tracker.session().is_charging);
        tracker
            .execute(Command::SetChargeState { is_charging: false }, at(30))
            .unwrap();
        assert_eq!(tracker.session().last_charge_duration_hours, Some(0.5));
    }

    #[test]
    fn test_manual_charge_state_survives_next_tick() {
        let mut tracker = tracker(1);
        let mapper = mapping(1);
        let mut source = StaticSource::new();
        set_battery(&mut source, 1, &frame(10.0, 10.0, 0.0));
        tracker.tick(at(0), &source, &mapper);

        tracker.set_charge_state(true, at(1));
        let held = tracker.tick(at(1), &source, &mapper).snapshot;
        assert!(held.is_charging);
        assert_eq!(held.charge_start_time, Some(at(1)));
        assert_eq!(held.last_charge_completed, None);

        // The following tick goes back to the measured current
        let evaluated = tracker.tick(at(2), &source, &mapper).snapshot;
        assert!(!evaluated.is_charging);
        assert_eq!(evaluated.last_charge_completed, Some(at(2)));
    }

    #[test]
    fn test_persist_and_restore() {
        let mut tracker = tracker(2);
        tracker.adjust_counters(Some(1200.0), Some(800.0)).unwrap();
        tracker.set_stored_energy(2, 3.0, Some(6.0)).unwrap();
        tracker.set_charge_state(true, at(0));
        tracker.set_charge_state(false, at(60));

        let state = tracker.persisted();
        let json = state.to_json().unwrap();

        let mut restored = BatteryTracker::new(tracker.config().clone());
        restored.restore(PersistedTotals::from_json(&json).unwrap());

        assert_eq!(restored.totals(), tracker.totals());
        assert_eq!(restored.session().last_charge_completed, Some(at(60)));
        assert!(!restored.session().is_charging);
        assert_eq!(
            restored.ledger().entry(2),
            Some(&LedgerEntry {
                stored_energy_kwh: Some(3.0),
                capacity_kwh: 6.0
            })
        );
        assert!((restored.ledger().totals().total_stored_kwh - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_producer_metadata() {
        let tracker = tracker(1);
        let snapshot = tracker.snapshot(at(0), Diagnostics::new());
        assert_eq!(snapshot.producer.name, crate::PRODUCER_NAME);
        assert_eq!(snapshot.producer.version, crate::TRACKER_VERSION);
        assert!(Uuid::parse_str(&snapshot.producer.instance_id).is_ok());
    }
}
