//! Charge-rate estimation
//!
//! Blends three signals into one charge-rate estimate while charging:
//! - instantaneous power (current x voltage) summed across batteries
//! - a time-weighted average of those totals over a trailing window
//! - a rate derived from charge-counter movement between checkpoints

use crate::error::ReadingError;
use crate::types::{
    BatteryId, ChargeRateDiagnostics, RateCheckpoint, RateSample, Reading, UnitPower,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};

/// Trailing window for instantaneous samples (minutes)
pub const RATE_WINDOW_MINUTES: i64 = 10;

/// Minimum checkpoint age before a counter-based rate is produced (seconds)
pub const MIN_CHECKPOINT_AGE_SECS: f64 = 120.0;

/// Checkpoint age after which it is discarded as stale (seconds)
pub const MAX_CHECKPOINT_AGE_SECS: f64 = 1800.0;

/// Counter movement required before the checkpoint is advanced
pub const CHECKPOINT_NOISE_FLOOR: f64 = 10.0;

/// Weight of the counter-based rate in the blend
pub const COUNTER_BLEND_WEIGHT: f64 = 0.7;

/// Energy per counter unit (Wh)
pub const WH_PER_COUNTER_UNIT: f64 = 1.0;

/// Instantaneous charging power across batteries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstantaneousPower {
    pub total_w: f64,
    pub active_unit_count: usize,
    pub units: BTreeMap<BatteryId, UnitPower>,
}

/// Sum current x voltage over every battery with a positive current.
///
/// Batteries missing either reading are skipped.
pub fn instantaneous_power<'a, I>(units: I) -> InstantaneousPower
where
    I: IntoIterator<Item = (BatteryId, &'a Reading, &'a Reading)>,
{
    let mut power = InstantaneousPower::default();

    for (battery, current, voltage) in units {
        if !current.is_available() || !voltage.is_available() {
            continue;
        }
        let (current_a, voltage_v) = match (current.value(), voltage.value()) {
            (Ok(c), Ok(v)) => (c, v),
            (Err(err), _) | (_, Err(err)) => {
                if matches!(err, ReadingError::InvalidReading(_)) {
                    tracing::error!(battery, error = %err, "failed to calculate charge rate");
                }
                continue;
            }
        };

        if current_a > 0.0 {
            let power_w = current_a * voltage_v;
            tracing::debug!(battery, power_w, current_a, voltage_v, "battery charging power");
            power.total_w += power_w;
            power.active_unit_count += 1;
            power.units.insert(
                battery,
                UnitPower {
                    current_a,
                    voltage_v,
                    power_w,
                },
            );
        }
    }

    power
}

/// Time-weighted mean of the sample rates.
///
/// Each consecutive pair contributes its mean rate weighted by the seconds
/// between them.
pub fn weighted_average<'a, I>(samples: I) -> f64
where
    I: IntoIterator<Item = &'a RateSample>,
{
    let mut iter = samples.into_iter();
    let Some(first) = iter.next() else {
        return 0.0;
    };

    let mut previous = first;
    let mut weighted_sum = 0.0;
    let mut total_secs = 0.0;

    for sample in iter {
        let secs = (sample.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
        weighted_sum += (previous.rate_w + sample.rate_w) / 2.0 * secs;
        total_secs += secs;
        previous = sample;
    }

    if total_secs > 0.0 {
        weighted_sum / total_secs
    } else {
        previous.rate_w
    }
}

/// Blend the counter-based rate with the weighted average
pub fn blend(counter_based_w: Option<f64>, weighted_average_w: f64) -> f64 {
    match counter_based_w {
        Some(counter) if counter > 0.0 => {
            counter * COUNTER_BLEND_WEIGHT + weighted_average_w * (1.0 - COUNTER_BLEND_WEIGHT)
        }
        _ => weighted_average_w,
    }
}

/// Rolling state behind the blended charge-rate estimate
#[derive(Debug, Clone, Default)]
pub struct ChargeRateEstimator {
    samples: VecDeque<RateSample>,
    checkpoint: Option<RateCheckpoint>,
    total_charge_rate_w: f64,
    last: Option<ChargeRateDiagnostics>,
}

impl ChargeRateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last blended rate (W)
    pub fn total_charge_rate_w(&self) -> f64 {
        self.total_charge_rate_w
    }

    /// Breakdown of the last estimate
    pub fn last_diagnostics(&self) -> Option<&ChargeRateDiagnostics> {
        self.last.as_ref()
    }

    pub fn samples(&self) -> &VecDeque<RateSample> {
        &self.samples
    }

    pub fn checkpoint(&self) -> Option<&RateCheckpoint> {
        self.checkpoint.as_ref()
    }

    /// Run one estimate for the current tick
    pub fn update<'a, I>(
        &mut self,
        units: I,
        total_charge_counter: f64,
        is_charging: bool,
        now: DateTime<Utc>,
    ) -> ChargeRateDiagnostics
    where
        I: IntoIterator<Item = (BatteryId, &'a Reading, &'a Reading)>,
    {
        let power = instantaneous_power(units);

        self.push_sample(RateSample {
            rate_w: power.total_w,
            timestamp: now,
            active_unit_count: power.active_unit_count,
        });

        let weighted_average_w = weighted_average(&self.samples);
        let counter_based_w = self.counter_based_rate(total_charge_counter, is_charging, now);
        let blended_rate_w = blend(counter_based_w, weighted_average_w);

        match counter_based_w {
            Some(counter) if counter > 0.0 => tracing::debug!(
                blended_rate_w,
                counter_w = counter,
                weighted_average_w,
                "blended charge rate"
            ),
            _ => tracing::debug!(blended_rate_w, "using instantaneous charge rate"),
        }

        let diagnostics = ChargeRateDiagnostics {
            instantaneous_total_w: power.total_w,
            weighted_average_w,
            counter_based_w,
            blended_rate_w,
            active_unit_count: power.active_unit_count,
            unit_power: power.units,
        };

        self.total_charge_rate_w = blended_rate_w;
        self.last = Some(diagnostics.clone());
        diagnostics
    }

    /// Append a sample and drop everything older than the window
    pub fn push_sample(&mut self, sample: RateSample) {
        let cutoff = sample.timestamp - Duration::minutes(RATE_WINDOW_MINUTES);
        self.samples.push_back(sample);
        self.samples.retain(|s| s.timestamp >= cutoff);
    }

    /// Rate implied by charge-counter movement since the checkpoint.
    ///
    /// Too-young checkpoints produce nothing and are kept; stale ones produce
    /// nothing and are discarded.
    pub fn counter_based_rate(
        &mut self,
        total_charge_counter: f64,
        is_charging: bool,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let Some((checkpoint_at, checkpoint_counter)) = self
            .checkpoint
            .as_ref()
            .map(|c| (c.timestamp, c.total_charge_counter))
        else {
            self.checkpoint = Some(RateCheckpoint {
                timestamp: now,
                total_charge_counter,
            });
            return None;
        };

        if !is_charging {
            return None;
        }

        let elapsed_secs = (now - checkpoint_at).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs < MIN_CHECKPOINT_AGE_SECS || elapsed_secs > MAX_CHECKPOINT_AGE_SECS {
            if elapsed_secs > MAX_CHECKPOINT_AGE_SECS {
                tracing::debug!(elapsed_secs, "discarding stale rate checkpoint");
                self.checkpoint = None;
            }
            return None;
        }

        let counter_delta = total_charge_counter - checkpoint_counter;
        if counter_delta <= 0.0 {
            return None;
        }

        let energy_wh = counter_delta * WH_PER_COUNTER_UNIT;
        let rate_w = energy_wh * 3600.0 / elapsed_secs;

        tracing::debug!(
            rate_w,
            counter_delta,
            elapsed_secs,
            energy_wh,
            "counter-based charge rate"
        );

        if counter_delta > CHECKPOINT_NOISE_FLOOR {
            self.checkpoint = Some(RateCheckpoint {
                timestamp: now,
                total_charge_counter,
            });
        }

        Some(rate_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn sample(rate_w: f64, secs: i64, active_unit_count: usize) -> RateSample {
        RateSample {
            rate_w,
            timestamp: t(secs),
            active_unit_count,
        }
    }

    #[test]
    fn test_blend_favors_counter_rate() {
        assert!((blend(Some(1000.0), 400.0) - 820.0).abs() < 1e-9);
        assert_eq!(blend(None, 400.0), 400.0);
        assert_eq!(blend(Some(0.0), 400.0), 400.0);
    }

    #[test]
    fn test_weighted_average_edge_cases() {
        assert_eq!(weighted_average(std::iter::empty()), 0.0);
        assert_eq!(weighted_average(&[sample(750.0, 0, 1)]), 750.0);
        assert_eq!(
            weighted_average(&[sample(100.0, 0, 1), sample(300.0, 0, 1)]),
            300.0
        );
    }

    #[test]
    fn test_weighted_average_uses_interval_lengths() {
        // (100+300)/2 over 60s, (300+300)/2 over 180s
        let samples = [sample(100.0, 0, 1), sample(300.0, 60, 1), sample(300.0, 240, 1)];
        let expected = (200.0 * 60.0 + 300.0 * 180.0) / 240.0;
        assert!((weighted_average(&samples) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_window_excludes_old_samples() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.push_sample(sample(5000.0, 0, 4));
        estimator.push_sample(sample(1000.0, 11 * 60, 1));
        estimator.push_sample(sample(1000.0, 12 * 60, 1));

        assert_eq!(estimator.samples().len(), 2);
        assert!(estimator.samples().iter().all(|s| s.active_unit_count == 1));
        assert!((weighted_average(estimator.samples()) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_keeps_sample_exactly_at_cutoff() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.push_sample(sample(500.0, 0, 1));
        estimator.push_sample(sample(500.0, 10 * 60, 1));
        assert_eq!(estimator.samples().len(), 2);
    }

    #[test]
    fn test_instantaneous_power_skips_unusable_units() {
        let readings = [
            (1, Reading::Value(10.0), Reading::Value(52.0)),
            (2, Reading::Value(-4.0), Reading::Value(51.0)),
            (3, Reading::Unavailable, Reading::Value(50.0)),
            (4, Reading::Value(5.0), Reading::Invalid("bad".into())),
            (5, Reading::Value(2.0), Reading::Value(50.0)),
        ];

        let power = instantaneous_power(readings.iter().map(|(b, c, v)| (*b, c, v)));

        assert_eq!(power.active_unit_count, 2);
        assert!((power.total_w - 620.0).abs() < 1e-9);
        assert_eq!(power.units.keys().copied().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn test_first_counter_check_creates_checkpoint() {
        let mut estimator = ChargeRateEstimator::new();
        assert_eq!(estimator.counter_based_rate(100.0, true, t(0)), None);
        assert_eq!(
            estimator.checkpoint(),
            Some(&RateCheckpoint {
                timestamp: t(0),
                total_charge_counter: 100.0
            })
        );
    }

    #[test]
    fn test_counter_rate_within_window() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.counter_based_rate(100.0, true, t(0));

        // 50 Wh over 180 s = 1000 W
        let rate = estimator.counter_based_rate(150.0, true, t(180)).unwrap();
        assert!((rate - 1000.0).abs() < 1e-9);
        assert_eq!(estimator.checkpoint().unwrap().timestamp, t(180));
    }

    #[test]
    fn test_too_young_checkpoint_is_kept() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.counter_based_rate(100.0, true, t(0));

        assert_eq!(estimator.counter_based_rate(200.0, true, t(60)), None);
        assert_eq!(estimator.checkpoint().unwrap().timestamp, t(0));
    }

    #[test]
    fn test_stale_checkpoint_is_discarded_then_recreated() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.counter_based_rate(100.0, true, t(0));

        assert_eq!(estimator.counter_based_rate(900.0, true, t(1801)), None);
        assert!(estimator.checkpoint().is_none());

        assert_eq!(estimator.counter_based_rate(900.0, true, t(1861)), None);
        assert_eq!(estimator.checkpoint().unwrap().timestamp, t(1861));
    }

    #[test]
    fn test_small_counter_movement_keeps_checkpoint() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.counter_based_rate(100.0, true, t(0));

        let rate = estimator.counter_based_rate(105.0, true, t(300)).unwrap();
        assert!((rate - 60.0).abs() < 1e-9);
        assert_eq!(estimator.checkpoint().unwrap().timestamp, t(0));
    }

    #[test]
    fn test_no_counter_rate_without_increase_or_charging() {
        let mut estimator = ChargeRateEstimator::new();
        estimator.counter_based_rate(100.0, true, t(0));
        assert_eq!(estimator.counter_based_rate(100.0, true, t(300)), None);
        assert_eq!(estimator.counter_based_rate(500.0, false, t(300)), None);
    }

    #[test]
    fn test_update_records_diagnostics() {
        let mut estimator = ChargeRateEstimator::new();
        let current = Reading::Value(10.0);
        let voltage = Reading::Value(50.0);

        let first = estimator.update([(1, &current, &voltage)], 0.0, true, t(0));
        assert_eq!(first.counter_based_w, None);
        assert!((first.blended_rate_w - 500.0).abs() < 1e-9);

        // 30 Wh in 180 s = 600 W counter rate, weighted average 500 W
        let second = estimator.update([(1, &current, &voltage)], 30.0, true, t(180));
        assert!((second.counter_based_w.unwrap() - 600.0).abs() < 1e-9);
        assert!((second.blended_rate_w - (0.7 * 600.0 + 0.3 * 500.0)).abs() < 1e-9);
        assert_eq!(estimator.total_charge_rate_w(), second.blended_rate_w);
        assert_eq!(estimator.last_diagnostics(), Some(&second));
    }
}
