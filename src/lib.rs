//! Battery Energy Tracker - energy accounting for multi-unit battery banks
//!
//! Turns periodic raw BMS readings (16-bit charge/discharge counters, pack
//! current and voltage) into monotone energy totals, a charging state with
//! session timing, a blended charge-rate estimate and a capacity-clamped
//! per-battery energy ledger.
//!
//! Each tick runs a fixed sequence: counter deltas → ledger → charging state
//! → charge rate → ledger aggregation → snapshot.
//!
//! ## Modules
//!
//! - **Tracker**: [`BatteryTracker`] owns all state and runs ticks synchronously
//! - **Service**: [`TrackerService`] wraps a tracker in a single tokio actor

pub mod charge_rate;
pub mod charge_state;
pub mod commands;
pub mod config;
pub mod counter;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod persistence;
pub mod service;
pub mod tracker;
pub mod types;

pub use commands::Command;
pub use config::TrackerConfig;
pub use error::{ReadingError, TrackerError};
pub use mapping::{EntityMapper, EntityMapping, PatternMapper, SensorSource, StaticSource};
pub use persistence::PersistedTotals;
pub use service::{TrackerHandle, TrackerService};
pub use tracker::{BatteryTracker, TickOutcome};
pub use types::{Reading, Snapshot};

/// Tracker version embedded in every snapshot
pub const TRACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for snapshots
pub const PRODUCER_NAME: &str = "battery-energy-tracker";
