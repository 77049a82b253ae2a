//! Error types for heater control operations.

use pd_core::{ChannelId, CoreError};
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for heater control operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Result type for device adapter calls.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur in heater control operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// Invalid argument provided to a control function.
    #[error("Invalid argument: {what}")]
    InvalidArg { what: String },

    /// Board configuration rejected at construction time.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device read/write failure.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Operation not allowed in the current controller state.
    #[error("Controller state error: {what}")]
    StateError { what: String },

    /// An estimate was requested before any sample was ingested.
    #[error("Estimate unavailable: {what}")]
    Unavailable { what: String },
}

impl From<CoreError> for ControlError {
    fn from(err: CoreError) -> Self {
        ControlError::InvalidArg {
            what: err.to_string(),
        }
    }
}

/// Errors reported by a [`HeaterDevice`](crate::device::HeaterDevice).
///
/// Everything except [`DeviceError::InvalidDuty`] is transient: the control
/// loop logs it, keeps running and counts it toward escalation. An invalid
/// duty is a caller error and never counts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("{op} timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device I/O failure: {what}")]
    Io { what: String },

    #[error("No reading for sensor channel {channel}")]
    MissingChannel { channel: ChannelId },

    #[error("Sensor channel {channel} reported non-finite value {value}")]
    BadReading { channel: ChannelId, value: f64 },

    #[error("Duty cycle {duty} for channel {channel} is outside [0, 1]")]
    InvalidDuty { channel: ChannelId, duty: f64 },
}

impl DeviceError {
    pub fn io(what: impl Into<String>) -> Self {
        Self::Io { what: what.into() }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidDuty { .. })
    }
}
