//! Per-zone PID loop.
//!
//! A [`ZoneController`] owns one heater zone's feedback state. Targets are
//! given in drop-referenced units and shifted through the zone's
//! [`DropCalibration`] into the sensor-referenced setpoint the loop tracks.
//!
//! The controller includes:
//! - Conditional integration (no accumulation in the saturated direction)
//! - Integral clamping in output units
//! - Optional feed-forward on the setpoint rise above ambient
//! - Derivative hold when `dt` is too small to differentiate

use pd_core::ensure_finite;
use serde::{Deserialize, Serialize};

use crate::calibration::DropCalibration;
use crate::config::{ControlConfig, ZoneConfig};
use crate::error::{ControlError, ControlResult};

/// Steps shorter than this skip the integral and derivative updates.
pub const MIN_DT: f64 = 1e-9;

/// Parallel-form PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain (duty per degree C).
    pub kp: f64,
    /// Integral gain (duty per degree C second).
    pub ki: f64,
    /// Derivative gain (duty second per degree C).
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    /// Convert from the standard form `Kp * (e + 1/Ti * int(e) + Td * de/dt)`.
    pub fn from_time_constants(kp: f64, ti: f64, td: f64) -> ControlResult<Self> {
        if ti <= 0.0 {
            return Err(ControlError::InvalidArg {
                what: "ti must be positive".to_string(),
            });
        }
        if td < 0.0 {
            return Err(ControlError::InvalidArg {
                what: "td must be non-negative".to_string(),
            });
        }
        Ok(Self {
            kp,
            ki: kp / ti,
            kd: kp * td,
        })
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.kp.is_finite() && self.ki.is_finite() && self.kd.is_finite()) {
            return Err("gains must be finite");
        }
        if self.kp < 0.0 || self.ki < 0.0 || self.kd < 0.0 {
            return Err("gains must be non-negative");
        }
        if self.kp == 0.0 && self.ki == 0.0 && self.kd == 0.0 {
            return Err("at least one gain must be non-zero");
        }
        Ok(())
    }
}

/// Mutable loop state for one zone.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ZoneLoopState {
    /// Drop-referenced target.
    pub target_c: Option<f64>,
    /// Sensor-referenced setpoint derived from the target.
    pub setpoint_c: Option<f64>,
    /// Integral accumulator (degree C seconds).
    pub integral: f64,
    /// Error from the previous step, `None` right after a reset.
    pub prev_error: Option<f64>,
    /// Last derivative estimate, held across zero-length steps.
    pub derivative: f64,
    /// Last computed duty cycle.
    pub duty: f64,
}

/// PID loop for one heater zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneController {
    gains: PidGains,
    calibration: DropCalibration,
    min_duty: f64,
    max_duty: f64,
    integral_limit: f64,
    feed_forward_gain: f64,
    ambient_c: f64,
    retarget_deadband_c: Option<f64>,
    state: ZoneLoopState,
}

impl ZoneController {
    /// Create a zone controller.
    ///
    /// # Arguments
    ///
    /// * `gains` - PID gains
    /// * `calibration` - Sensor-to-drop conversion for this zone
    /// * `min_duty` - Minimum output, in [0, 1]
    /// * `max_duty` - Maximum output, in [0, 1]
    pub fn new(
        gains: PidGains,
        calibration: DropCalibration,
        min_duty: f64,
        max_duty: f64,
    ) -> ControlResult<Self> {
        gains
            .validate()
            .map_err(|what| ControlError::InvalidArg {
                what: what.to_string(),
            })?;
        calibration.validate()?;
        if !(0.0..=1.0).contains(&min_duty) || !(0.0..=1.0).contains(&max_duty) {
            return Err(ControlError::InvalidArg {
                what: "duty limits must be within [0, 1]".to_string(),
            });
        }
        if min_duty >= max_duty {
            return Err(ControlError::InvalidArg {
                what: "min_duty must be less than max_duty".to_string(),
            });
        }
        Ok(Self {
            gains,
            calibration,
            min_duty,
            max_duty,
            integral_limit: max_duty - min_duty,
            feed_forward_gain: 0.0,
            ambient_c: 0.0,
            retarget_deadband_c: None,
            state: ZoneLoopState {
                duty: min_duty,
                ..ZoneLoopState::default()
            },
        })
    }

    /// Build a controller from validated board configuration.
    pub fn from_config(zone: &ZoneConfig, control: &ControlConfig) -> ControlResult<Self> {
        let mut controller = Self::new(zone.gains, zone.calibration, zone.min_duty, zone.max_duty)?
            .with_feed_forward(zone.feed_forward_gain, control.ambient_c);
        if let Some(limit) = zone.integral_limit {
            controller = controller.with_integral_limit(limit);
        }
        if let Some(deadband) = control.retarget_deadband_c {
            controller = controller.with_retarget_deadband(deadband);
        }
        Ok(controller)
    }

    /// Limit the integral contribution `ki * integral` to `±limit` (output units).
    pub fn with_integral_limit(mut self, limit: f64) -> Self {
        self.integral_limit = limit.abs();
        self
    }

    /// Add `gain * (setpoint - ambient_c)` to the output.
    pub fn with_feed_forward(mut self, gain: f64, ambient_c: f64) -> Self {
        self.feed_forward_gain = gain;
        self.ambient_c = ambient_c;
        self
    }

    /// Clear the integral when the target moves by more than `deadband_c`.
    pub fn with_retarget_deadband(mut self, deadband_c: f64) -> Self {
        self.retarget_deadband_c = Some(deadband_c.abs());
        self
    }

    /// Set the drop-referenced target.
    pub fn set_target(&mut self, target_c: f64) -> ControlResult<()> {
        ensure_finite(target_c, "target temperature")?;
        if let (Some(prev), Some(deadband)) = (self.state.target_c, self.retarget_deadband_c) {
            if (target_c - prev).abs() > deadband {
                self.reset();
            }
        }
        self.state.target_c = Some(target_c);
        self.state.setpoint_c = Some(self.calibration.to_sensor(target_c));
        Ok(())
    }

    /// Clear the integral and derivative history.
    pub fn reset(&mut self) {
        self.state.integral = 0.0;
        self.state.prev_error = None;
        self.state.derivative = 0.0;
    }

    /// Advance the loop with a filtered sensor-referenced reading.
    ///
    /// Returns the duty cycle to command, always within the zone's limits.
    /// Without a target the zone idles at `min_duty`.
    pub fn step(&mut self, sensor_c: f64, dt: f64) -> f64 {
        let Some(setpoint) = self.state.setpoint_c else {
            self.state.duty = self.min_duty;
            return self.min_duty;
        };

        let error = setpoint - sensor_c;
        let advancing = dt.is_finite() && dt >= MIN_DT;

        if advancing {
            self.state.derivative = match self.state.prev_error {
                Some(prev) => (error - prev) / dt,
                None => 0.0,
            };
        }

        let ff_term = self.feed_forward_gain * (setpoint - self.ambient_c);
        let p_term = self.gains.kp * error;
        let i_term = self.gains.ki * self.state.integral;
        let d_term = self.gains.kd * self.state.derivative;

        let output_raw = ff_term + p_term + i_term + d_term;
        let duty = output_raw.clamp(self.min_duty, self.max_duty);

        // Anti-windup: do not integrate further into a limit we are already on
        if advancing && self.gains.ki > 0.0 {
            let pinned_high = duty >= self.max_duty && error > 0.0;
            let pinned_low = duty <= self.min_duty && error < 0.0;
            if !(pinned_high || pinned_low) {
                let bound = self.integral_limit / self.gains.ki;
                self.state.integral = (self.state.integral + error * dt).clamp(-bound, bound);
            }
        }
        if advancing {
            self.state.prev_error = Some(error);
        }

        self.state.duty = duty;
        duty
    }

    pub fn target(&self) -> Option<f64> {
        self.state.target_c
    }

    pub fn setpoint(&self) -> Option<f64> {
        self.state.setpoint_c
    }

    pub fn duty(&self) -> f64 {
        self.state.duty
    }

    pub fn integral(&self) -> f64 {
        self.state.integral
    }

    /// Integral contribution to the output.
    pub fn integral_out(&self) -> f64 {
        self.gains.ki * self.state.integral
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn calibration(&self) -> DropCalibration {
        self.calibration
    }

    pub fn duty_limits(&self) -> (f64, f64) {
        (self.min_duty, self.max_duty)
    }

    pub fn state(&self) -> &ZoneLoopState {
        &self.state
    }
}
