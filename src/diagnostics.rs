//! Per-tick diagnostics
//!
//! Collected while the tracker runs a tick and published with the snapshot:
//! source availability, abnormal values, missing entities and counter movement.

use crate::counter::CounterOutcome;
use crate::types::{BatteryId, CounterKind, Reading, SignalKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current magnitude above which a reading is implausible (A)
pub const MAX_PLAUSIBLE_CURRENT_A: f64 = 100.0;

/// Availability of one mapped source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalStatus {
    pub handle: String,
    pub available: bool,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEntity {
    pub battery: BatteryId,
    pub signal: SignalKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbnormalKind {
    NegativeCounter,
    ImplausibleCurrent,
    NonNumeric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbnormalValue {
    pub battery: BatteryId,
    pub signal: SignalKind,
    pub kind: AbnormalKind,
    pub raw: String,
}

/// Counter movement observed during one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterActivity {
    pub battery: BatteryId,
    pub kind: CounterKind,
    /// Recorded value before this tick
    pub previous: Option<f64>,
    pub current: Option<f64>,
    /// Applied delta; zero for baselines, anomalies and unchanged counters
    pub delta: f64,
    pub rollover: bool,
}

/// Negative, non-rollover delta that was ignored
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterAnomaly {
    pub battery: BatteryId,
    pub kind: CounterKind,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub signals: BTreeMap<BatteryId, BTreeMap<SignalKind, SignalStatus>>,
    pub missing_entities: Vec<MissingEntity>,
    pub unavailable_sources: Vec<String>,
    pub abnormal_values: Vec<AbnormalValue>,
    pub counter_activity: Vec<CounterActivity>,
    pub counter_anomalies: Vec<CounterAnomaly>,
    pub retry_count: u32,
    pub persistent_unavailability: bool,
}

/// Classify a reading as abnormal for its signal, if it is.
///
/// Any available state without a number, "unknown" included, is non-numeric.
pub fn check_abnormal(signal: SignalKind, reading: &Reading) -> Option<AbnormalKind> {
    match reading {
        Reading::Invalid(_) | Reading::Unknown => Some(AbnormalKind::NonNumeric),
        Reading::Value(v) if signal.counter_kind().is_some() && *v < 0.0 => {
            Some(AbnormalKind::NegativeCounter)
        }
        Reading::Value(v) if signal == SignalKind::Current && v.abs() > MAX_PLAUSIBLE_CURRENT_A => {
            Some(AbnormalKind::ImplausibleCurrent)
        }
        _ => None,
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a source read, flagging unavailable and abnormal values
    pub fn record_signal(
        &mut self,
        battery: BatteryId,
        signal: SignalKind,
        handle: &str,
        reading: &Reading,
    ) {
        let available = reading.is_available();
        if !available {
            self.unavailable_sources.push(handle.to_string());
        }

        if let Some(kind) = check_abnormal(signal, reading) {
            tracing::warn!(
                battery,
                signal = %signal,
                raw = %reading.raw_text(),
                ?kind,
                "abnormal sensor value"
            );
            self.abnormal_values.push(AbnormalValue {
                battery,
                signal,
                kind,
                raw: reading.raw_text(),
            });
        }

        self.signals.entry(battery).or_default().insert(
            signal,
            SignalStatus {
                handle: handle.to_string(),
                available,
                raw: reading.raw_text(),
            },
        );
    }

    pub fn record_missing(&mut self, missing: &[(BatteryId, SignalKind)]) {
        for (battery, signal) in missing {
            tracing::warn!(battery, signal = %signal, "no source mapped for battery signal");
            self.missing_entities.push(MissingEntity {
                battery: *battery,
                signal: *signal,
            });
        }
    }

    /// Record the effect of processing one counter sample
    pub fn record_counter(
        &mut self,
        battery: BatteryId,
        kind: CounterKind,
        previous: Option<f64>,
        reading: &Reading,
        outcome: &CounterOutcome,
    ) {
        let (delta, rollover) = match outcome {
            CounterOutcome::Delta(event) => (event.delta, false),
            CounterOutcome::Rollover(event) => (event.delta, true),
            CounterOutcome::Anomaly { delta } => {
                self.counter_anomalies.push(CounterAnomaly {
                    battery,
                    kind,
                    delta: *delta,
                });
                (0.0, false)
            }
            CounterOutcome::Baseline | CounterOutcome::Unchanged => (0.0, false),
        };

        self.counter_activity.push(CounterActivity {
            battery,
            kind,
            previous,
            current: reading.value().ok(),
            delta,
            rollover,
        });
    }

    pub fn has_unavailable(&self) -> bool {
        !self.unavailable_sources.is_empty()
    }
}
