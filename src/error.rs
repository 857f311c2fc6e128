//! Error types for the battery energy tracker

use thiserror::Error;

/// Errors surfaced by tracker operations and configuration loading
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown battery id: {0}")]
    UnknownBattery(u8),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracker service has stopped")]
    ServiceStopped,
}

impl TrackerError {
    /// True for errors caused by out-of-range administrative input
    pub fn is_validation(&self) -> bool {
        matches!(self, TrackerError::Validation(_) | TrackerError::UnknownBattery(_))
    }
}

/// Why a single reading could not be used this tick.
///
/// Never fatal: the caller skips the signal and keeps its prior state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadingError {
    #[error("source unavailable")]
    SourceUnavailable,

    #[error("invalid reading: {0}")]
    InvalidReading(String),
}
