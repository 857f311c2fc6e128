//! Administrative commands
//!
//! Every operation an operator can trigger outside the tick loop, as a
//! serializable value. Commands are dispatched by
//! [`BatteryTracker::execute`](crate::tracker::BatteryTracker::execute).

use crate::types::BatteryId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Zero every accumulated counter
    ResetCounters,
    ResetEnergySinceCharge,
    /// Force the charging flag
    SetChargeState { is_charging: bool },
    /// Add signed deltas to the totals (raw counter units)
    AdjustCounters {
        #[serde(default)]
        discharge_delta: Option<f64>,
        #[serde(default)]
        charge_delta: Option<f64>,
    },
    SetStoredEnergy {
        battery: BatteryId,
        energy_kwh: f64,
        #[serde(default)]
        capacity_kwh: Option<f64>,
    },
    /// Fill one battery, or all when `battery` is absent
    SetToFull {
        #[serde(default)]
        battery: Option<BatteryId>,
    },
    SetCapacity {
        battery: BatteryId,
        capacity_kwh: f64,
    },
    InitializeAll,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ResetCounters => "reset_counters",
            Command::ResetEnergySinceCharge => "reset_energy_since_charge",
            Command::SetChargeState { .. } => "set_charge_state",
            Command::AdjustCounters { .. } => "adjust_counters",
            Command::SetStoredEnergy { .. } => "set_stored_energy",
            Command::SetToFull { .. } => "set_to_full",
            Command::SetCapacity { .. } => "set_capacity",
            Command::InitializeAll => "initialize_all",
        }
    }
}
