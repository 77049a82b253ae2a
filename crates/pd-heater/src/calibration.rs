//! Sensor-to-drop calibration.
//!
//! The temperature sensors sit away from the liquid drop, so the drop is
//! cooler than what the sensor reports. Public values (targets, the drop
//! temperature estimate) are drop-referenced; the PID loops work in
//! sensor-referenced units.

use pd_core::{CoreError, CoreResult, ensure_finite};
use serde::{Deserialize, Serialize};

/// Conversion between drop-referenced and sensor-referenced temperatures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DropCalibration {
    /// Constant offset: `sensor = drop + k_drop_c`.
    Offset {
        /// Degrees C the sensor reads above the drop.
        k_drop_c: f64,
    },

    /// Loss proportional to the rise above ambient:
    /// `drop = sensor - k_drop * (sensor - ambient_c)`.
    AmbientRatio {
        /// Fraction of the rise above ambient lost between sensor and drop.
        k_drop: f64,
        /// Ambient temperature the loss is measured against.
        ambient_c: f64,
    },
}

impl DropCalibration {
    pub fn offset(k_drop_c: f64) -> Self {
        Self::Offset { k_drop_c }
    }

    pub fn ambient_ratio(k_drop: f64, ambient_c: f64) -> Self {
        Self::AmbientRatio { k_drop, ambient_c }
    }

    pub fn validate(&self) -> CoreResult<()> {
        match *self {
            Self::Offset { k_drop_c } => {
                ensure_finite(k_drop_c, "k_drop_c")?;
                if k_drop_c <= 0.0 {
                    return Err(CoreError::InvalidArg {
                        what: "k_drop_c must be positive",
                    });
                }
            }
            Self::AmbientRatio { k_drop, ambient_c } => {
                ensure_finite(k_drop, "k_drop")?;
                ensure_finite(ambient_c, "ambient_c")?;
                if k_drop <= 0.0 || k_drop >= 1.0 {
                    return Err(CoreError::InvalidArg {
                        what: "k_drop ratio must be in (0, 1)",
                    });
                }
            }
        }
        Ok(())
    }

    /// Sensor reading that corresponds to the given drop temperature.
    pub fn to_sensor(&self, drop_c: f64) -> f64 {
        match *self {
            Self::Offset { k_drop_c } => drop_c + k_drop_c,
            Self::AmbientRatio { k_drop, ambient_c } => {
                (drop_c - k_drop * ambient_c) / (1.0 - k_drop)
            }
        }
    }

    /// Drop temperature implied by the given sensor reading.
    pub fn to_drop(&self, sensor_c: f64) -> f64 {
        match *self {
            Self::Offset { k_drop_c } => sensor_c - k_drop_c,
            Self::AmbientRatio { k_drop, ambient_c } => sensor_c - k_drop * (sensor_c - ambient_c),
        }
    }
}
