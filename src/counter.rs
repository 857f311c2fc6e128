//! Counter delta processing
//!
//! Turns raw 16-bit BMS counter samples into rollover-compensated, monotone
//! deltas. Positive deltas are added to the running totals and returned as a
//! [`DeltaEvent`] for the energy ledger to consume.

use crate::error::ReadingError;
use crate::types::{BatteryId, CounterKind, EnergyTotals, Reading};
use std::collections::HashMap;

/// Maximum raw value of a 16-bit counter
pub const MAX_COUNTER_VALUE: f64 = 65535.0;

/// A previous value above this is close enough to wrap
pub const ROLLOVER_HIGH_THRESHOLD: f64 = 65000.0;

/// A current value below this after a high previous value means the counter wrapped
pub const ROLLOVER_LOW_BOUND: f64 = 1000.0;

/// Positive counter movement to be applied to the ledger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaEvent {
    pub battery: BatteryId,
    pub kind: CounterKind,
    pub delta: f64,
}

/// What a numeric sample did to the counter state
#[derive(Debug, Clone, PartialEq)]
pub enum CounterOutcome {
    /// First sample for this battery/kind; stored as baseline only
    Baseline,
    /// Regular increase
    Delta(DeltaEvent),
    /// Wraparound detected and compensated
    Rollover(DeltaEvent),
    /// Negative delta that is not a rollover; ignored
    Anomaly { delta: f64 },
    /// No movement
    Unchanged,
}

impl CounterOutcome {
    /// Delta to forward to the ledger, if any
    pub fn event(&self) -> Option<DeltaEvent> {
        match self {
            CounterOutcome::Delta(event) | CounterOutcome::Rollover(event) => Some(*event),
            _ => None,
        }
    }
}

/// Compute the raw delta between two counter samples, compensating wraparound.
///
/// Returns the delta and whether it was a rollover.
pub fn compute_delta(previous: f64, current: f64) -> (f64, bool) {
    if previous > ROLLOVER_HIGH_THRESHOLD && current < ROLLOVER_LOW_BOUND {
        ((MAX_COUNTER_VALUE - previous) + current, true)
    } else {
        (current - previous, false)
    }
}

/// Tracks the last raw value per battery and counter kind
#[derive(Debug, Clone, Default)]
pub struct CounterDeltaProcessor {
    previous: HashMap<(BatteryId, CounterKind), f64>,
}

impl CounterDeltaProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded raw value, if any
    pub fn previous(&self, battery: BatteryId, kind: CounterKind) -> Option<f64> {
        self.previous.get(&(battery, kind)).copied()
    }

    /// Process one raw sample.
    ///
    /// Unavailable or non-numeric samples leave every piece of state untouched.
    /// Any numeric sample, anomalies included, becomes the new previous value.
    pub fn process(
        &mut self,
        battery: BatteryId,
        kind: CounterKind,
        reading: &Reading,
        totals: &mut EnergyTotals,
    ) -> Result<CounterOutcome, ReadingError> {
        let current = match reading.value() {
            Ok(value) => value,
            Err(ReadingError::SourceUnavailable) => {
                tracing::debug!(battery, kind = %kind, "counter source not available");
                return Err(ReadingError::SourceUnavailable);
            }
            Err(err) => {
                tracing::error!(battery, kind = %kind, error = %err, "failed to process counter");
                return Err(err);
            }
        };

        let Some(previous) = self.previous.insert((battery, kind), current) else {
            tracing::debug!(battery, kind = %kind, value = current, "first counter sample");
            return Ok(CounterOutcome::Baseline);
        };

        let (delta, rollover) = compute_delta(previous, current);
        if rollover {
            tracing::info!(
                battery,
                kind = %kind,
                previous,
                current,
                delta,
                "detected counter rollover"
            );
        }

        if delta > 0.0 {
            match kind {
                CounterKind::Discharge => {
                    totals.total_discharge_counter += delta;
                    totals.energy_since_last_charge_counter += delta;
                }
                CounterKind::Charge => {
                    totals.total_charge_counter += delta;
                }
            }
            tracing::debug!(battery, kind = %kind, delta, "counter advanced");

            let event = DeltaEvent {
                battery,
                kind,
                delta,
            };
            Ok(if rollover {
                CounterOutcome::Rollover(event)
            } else {
                CounterOutcome::Delta(event)
            })
        } else if delta < 0.0 {
            tracing::warn!(
                battery,
                kind = %kind,
                delta,
                "negative counter delta ignored; counter reset or read error"
            );
            Ok(CounterOutcome::Anomaly { delta })
        } else {
            Ok(CounterOutcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(
        processor: &mut CounterDeltaProcessor,
        totals: &mut EnergyTotals,
        kind: CounterKind,
        values: &[f64],
    ) -> Vec<CounterOutcome> {
        values
            .iter()
            .map(|v| processor.process(1, kind, &Reading::Value(*v), totals).unwrap())
            .collect()
    }

    #[test]
    fn test_first_sample_is_baseline() {
        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();

        let outcome = processor
            .process(1, CounterKind::Charge, &Reading::Value(1200.0), &mut totals)
            .unwrap();

        assert_eq!(outcome, CounterOutcome::Baseline);
        assert_eq!(totals, EnergyTotals::default());
        assert_eq!(processor.previous(1, CounterKind::Charge), Some(1200.0));
    }

    #[test]
    fn test_rollover_delta() {
        let (delta, rollover) = compute_delta(65200.0, 500.0);
        assert!(rollover);
        assert!((delta - 835.0).abs() < 1e-9);

        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();
        let outcomes = feed(&mut processor, &mut totals, CounterKind::Discharge, &[65200.0, 500.0]);

        assert!(matches!(outcomes[1], CounterOutcome::Rollover(_)));
        assert!((totals.total_discharge_counter - 835.0).abs() < 1e-9);
        assert!((totals.energy_since_last_charge_counter - 835.0).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_total_ignores_negative_deltas() {
        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();
        let outcomes = feed(
            &mut processor,
            &mut totals,
            CounterKind::Charge,
            &[100.0, 150.0, 140.0, 160.0, 160.0, 200.0],
        );

        // +50, anomaly (-10), +20, 0, +40
        assert!((totals.total_charge_counter - 110.0).abs() < 1e-9);
        assert_eq!(outcomes[2], CounterOutcome::Anomaly { delta: -10.0 });
        assert_eq!(outcomes[4], CounterOutcome::Unchanged);
        assert_eq!(totals.energy_since_last_charge_counter, 0.0);
    }

    #[test]
    fn test_anomaly_advances_previous_value() {
        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();
        feed(&mut processor, &mut totals, CounterKind::Charge, &[5000.0, 10.0]);

        assert_eq!(processor.previous(1, CounterKind::Charge), Some(10.0));

        // The next sample measures from the advanced value, not from 5000
        let outcome = processor
            .process(1, CounterKind::Charge, &Reading::Value(30.0), &mut totals)
            .unwrap();
        assert_eq!(outcome.event().map(|e| e.delta), Some(20.0));
    }

    #[test]
    fn test_unavailable_and_invalid_leave_state_untouched() {
        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();
        feed(&mut processor, &mut totals, CounterKind::Discharge, &[100.0]);

        let unavailable =
            processor.process(1, CounterKind::Discharge, &Reading::Unavailable, &mut totals);
        assert_eq!(unavailable, Err(ReadingError::SourceUnavailable));

        let invalid = processor.process(
            1,
            CounterKind::Discharge,
            &Reading::Invalid("n/a".into()),
            &mut totals,
        );
        assert!(matches!(invalid, Err(ReadingError::InvalidReading(_))));

        assert_eq!(processor.previous(1, CounterKind::Discharge), Some(100.0));
        assert_eq!(totals, EnergyTotals::default());
    }

    #[test]
    fn test_kinds_and_batteries_tracked_independently() {
        let mut processor = CounterDeltaProcessor::new();
        let mut totals = EnergyTotals::default();

        for (battery, kind, value) in [
            (1, CounterKind::Charge, 10.0),
            (2, CounterKind::Charge, 500.0),
            (1, CounterKind::Discharge, 300.0),
            (1, CounterKind::Charge, 15.0),
            (2, CounterKind::Charge, 520.0),
        ] {
            processor
                .process(battery, kind, &Reading::Value(value), &mut totals)
                .unwrap();
        }

        assert!((totals.total_charge_counter - 25.0).abs() < 1e-9);
        assert_eq!(totals.total_discharge_counter, 0.0);
    }

    #[test]
    fn test_high_previous_without_low_current_is_anomaly() {
        let (delta, rollover) = compute_delta(65100.0, 2000.0);
        assert!(!rollover);
        assert!(delta < 0.0);
    }
}
