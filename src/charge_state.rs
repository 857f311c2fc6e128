//! Charging state machine
//!
//! Derives a binary charging flag from per-battery current readings and
//! records session timing on every transition.

use crate::types::{BatteryId, ChargeSession, EnergyTotals, Reading};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Current above which a battery counts as charging (A)
pub const CHARGING_CURRENT_THRESHOLD_A: f64 = 0.5;

/// A new charge starting later than this after the previous one ended begins a new cycle
pub const NEW_CYCLE_GAP_HOURS: i64 = 1;

/// A state change produced by one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    Started {
        at: DateTime<Utc>,
        cycle_reset: bool,
    },
    Stopped {
        at: DateTime<Utc>,
        duration_hours: Option<f64>,
    },
}

/// True if any reading is a numeric current above the threshold
pub fn any_charging<'a, I>(readings: I) -> bool
where
    I: IntoIterator<Item = (BatteryId, &'a Reading)>,
{
    readings.into_iter().any(|(battery, reading)| match reading {
        Reading::Value(current) if *current > CHARGING_CURRENT_THRESHOLD_A => {
            tracing::debug!(battery, current, "battery is charging");
            true
        }
        Reading::Invalid(raw) => {
            tracing::error!(battery, raw = %raw, "failed to process current reading");
            false
        }
        _ => false,
    })
}

/// NOT_CHARGING / CHARGING with session bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ChargingStateMachine {
    session: ChargeSession,
}

impl ChargingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_session(session: ChargeSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &ChargeSession {
        &self.session
    }

    pub fn is_charging(&self) -> bool {
        self.session.is_charging
    }

    /// Evaluate current readings for every battery
    pub fn evaluate<'a, I>(
        &mut self,
        readings: I,
        now: DateTime<Utc>,
        totals: &mut EnergyTotals,
    ) -> Option<Transition>
    where
        I: IntoIterator<Item = (BatteryId, &'a Reading)>,
    {
        let is_now_charging = any_charging(readings);
        self.transition(is_now_charging, now, totals)
    }

    /// Force the charging flag, bypassing current evaluation
    pub fn set_manual(
        &mut self,
        is_charging: bool,
        now: DateTime<Utc>,
        totals: &mut EnergyTotals,
    ) -> Option<Transition> {
        tracing::info!(is_charging, "manually setting charge state");
        self.transition(is_charging, now, totals)
    }

    fn transition(
        &mut self,
        is_now_charging: bool,
        now: DateTime<Utc>,
        totals: &mut EnergyTotals,
    ) -> Option<Transition> {
        match (self.session.is_charging, is_now_charging) {
            (false, true) => {
                self.session.is_charging = true;
                self.session.charge_start_time = Some(now);

                // A short pause continues the interrupted charge; a longer one starts a new cycle
                let cycle_reset = self
                    .session
                    .last_charge_completed
                    .is_some_and(|done| now - done > Duration::hours(NEW_CYCLE_GAP_HOURS));
                if cycle_reset {
                    tracing::info!("resetting energy since last charge");
                    totals.energy_since_last_charge_counter = 0.0;
                }

                tracing::info!(at = %now, "charging started");
                Some(Transition::Started {
                    at: now,
                    cycle_reset,
                })
            }
            (true, false) => {
                self.session.is_charging = false;
                self.session.last_charge_completed = Some(now);

                let duration_hours = self
                    .session
                    .charge_start_time
                    .take()
                    .map(|start| (now - start).num_milliseconds() as f64 / 3_600_000.0);
                if duration_hours.is_some() {
                    self.session.last_charge_duration_hours = duration_hours;
                }

                tracing::info!(at = %now, ?duration_hours, "charging completed");
                Some(Transition::Stopped {
                    at: now,
                    duration_hours,
                })
            }
            _ => None,
        }
    }
}
