//! Board configuration: zone-to-channel mapping, gains and calibration.
//!
//! Board-specific constants live in a [`BoardConfig`] so the generic control
//! code never carries magic numbers. [`BoardConfig::v4`] describes the rev4
//! electrode board; other boards can be loaded from YAML.

use std::collections::HashSet;
use std::path::Path;

use pd_core::{ChannelId, CoreError, ZoneId};
use serde::{Deserialize, Serialize};

use crate::calibration::DropCalibration;
use crate::pid::PidGains;

/// Configuration of one heater/sensor pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Index into the board's temperature list.
    pub sensor_channel: ChannelId,
    /// PWM output driving the heater.
    pub actuator_channel: ChannelId,
    pub gains: PidGains,
    pub calibration: DropCalibration,
    #[serde(default)]
    pub min_duty: f64,
    #[serde(default = "default_max_duty")]
    pub max_duty: f64,
    /// Duty per degree C of sensor setpoint above ambient.
    #[serde(default)]
    pub feed_forward_gain: f64,
    /// Bound on the integral contribution, in duty units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integral_limit: Option<f64>,
}

fn default_max_duty() -> f64 {
    1.0
}

/// Longest accepted control tick period (seconds).
pub const MAX_TICK_PERIOD_S: f64 = 3600.0;
/// Longest accepted sensor filter time constant (seconds).
pub const MAX_FILTER_TIME_CONSTANT_S: f64 = 86_400.0;

/// Loop timing and supervision settings shared by all zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Background tick period (seconds).
    pub tick_period_s: f64,
    /// Sensor low-pass time constant (seconds). Zero disables filtering.
    pub filter_time_constant_s: f64,
    /// Upper bound on a single device call (milliseconds).
    pub io_timeout_ms: u64,
    /// Consecutive failed ticks before the loop stops itself. `None` never
    /// stops; a hung device then keeps the loop ticking against timeouts, with
    /// at most one read outstanding at the device.
    pub max_consecutive_failures: Option<u32>,
    /// Target change (degrees C) that clears the integral state.
    pub retarget_deadband_c: Option<f64>,
    /// Lowest accepted drop-referenced target.
    pub min_target_c: f64,
    /// Highest accepted drop-referenced target.
    pub max_target_c: f64,
    /// Ambient temperature used by feed-forward.
    pub ambient_c: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_period_s: 0.5,
            filter_time_constant_s: 5.0,
            io_timeout_ms: 1000,
            max_consecutive_failures: Some(10),
            retarget_deadband_c: Some(10.0),
            min_target_c: 0.0,
            max_target_c: 100.0,
            ambient_c: 20.0,
        }
    }
}

/// Complete heater description for one electrode board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    #[serde(default)]
    pub control: ControlConfig,
    pub zones: Vec<ZoneConfig>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Board has no heater zones")]
    NoZones,

    #[error("Duplicate {kind} channel {channel}")]
    DuplicateChannel {
        kind: &'static str,
        channel: ChannelId,
    },

    #[error("Invalid value: {field} = {value} ({reason})")]
    InvalidValue {
        field: String,
        value: f64,
        reason: &'static str,
    },

    #[error("Invalid {zone}: {source}")]
    InvalidZone { zone: ZoneId, source: CoreError },
}

#[derive(thiserror::Error, Debug)]
pub enum BoardFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid board configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// v4 board: drop loses this fraction of its rise above ambient.
pub const V4_K_DROP: f64 = 0.10;
/// v4 board: ambient reference used by calibration and feed-forward.
pub const V4_AMBIENT_C: f64 = 20.0;
/// v4 board: drop estimate filter rate (1/s).
pub const V4_ALPHA_DROP: f64 = 0.18;
/// v4 board: per-channel gains, steady-state duty per degree C rise.
pub const V4_CHANNEL_GAINS: [f64; 4] = [0.007, 0.003, 0.003, 0.007];
/// v4 board: per-channel duty ceilings.
pub const V4_MAX_DUTY: [f64; 4] = [0.98, 0.5, 0.5, 0.98];
const V4_KP: f64 = 18.0;
const V4_TI_S: f64 = 6.0;
const V4_TD_S: f64 = 0.8;
const V4_INTEGRAL_LIMIT: f64 = 50.0;

impl BoardConfig {
    /// Rev4 electrode board with 6um mylar dielectric.
    ///
    /// Four heaters, sensor channel `i` paired with PWM channel `i`.
    pub fn v4() -> Self {
        Self::v4_scaled(1.0)
    }

    /// Rev4 board with every zone's output ceiling scaled by `output_scale`.
    pub fn v4_scaled(output_scale: f64) -> Self {
        let zones = V4_CHANNEL_GAINS
            .iter()
            .zip(V4_MAX_DUTY)
            .enumerate()
            .map(|(i, (&g, max_duty))| {
                let kp = V4_KP * g;
                ZoneConfig {
                    sensor_channel: ChannelId::new(i as u16),
                    actuator_channel: ChannelId::new(i as u16),
                    gains: PidGains {
                        kp,
                        ki: kp / V4_TI_S,
                        kd: kp * V4_TD_S,
                    },
                    calibration: DropCalibration::ambient_ratio(V4_K_DROP, V4_AMBIENT_C),
                    min_duty: 0.0,
                    max_duty: (max_duty * output_scale).clamp(0.0, 1.0),
                    feed_forward_gain: g,
                    integral_limit: Some(V4_INTEGRAL_LIMIT * g),
                }
            })
            .collect();

        Self {
            name: "v4".to_string(),
            control: ControlConfig {
                tick_period_s: 0.5,
                filter_time_constant_s: 1.0 / V4_ALPHA_DROP,
                ambient_c: V4_AMBIENT_C,
                ..ControlConfig::default()
            },
            zones,
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control.validate()?;

        if self.zones.is_empty() {
            return Err(ConfigError::NoZones);
        }

        let mut sensors = HashSet::new();
        let mut actuators = HashSet::new();
        for (index, zone) in self.zones.iter().enumerate() {
            zone.validate(ZoneId::from_index(index))?;
            if !sensors.insert(zone.sensor_channel) {
                return Err(ConfigError::DuplicateChannel {
                    kind: "sensor",
                    channel: zone.sensor_channel,
                });
            }
            if !actuators.insert(zone.actuator_channel) {
                return Err(ConfigError::DuplicateChannel {
                    kind: "actuator",
                    channel: zone.actuator_channel,
                });
            }
        }
        Ok(())
    }

    pub fn load_yaml(path: &Path) -> Result<Self, BoardFileError> {
        let content = std::fs::read_to_string(path)?;
        let board = Self::from_yaml_str(&content)?;
        Ok(board)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, BoardFileError> {
        let board: BoardConfig = serde_yaml::from_str(content)?;
        board.validate()?;
        Ok(board)
    }

    pub fn save_yaml(&self, path: &Path) -> Result<(), BoardFileError> {
        let content = self.to_yaml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String, BoardFileError> {
        self.validate()?;
        Ok(serde_yaml::to_string(self)?)
    }
}

impl ZoneConfig {
    /// Zone with an additive sensor offset and full duty range.
    pub fn new(
        sensor_channel: ChannelId,
        actuator_channel: ChannelId,
        gains: PidGains,
        k_drop_c: f64,
    ) -> Self {
        Self {
            sensor_channel,
            actuator_channel,
            gains,
            calibration: DropCalibration::offset(k_drop_c),
            min_duty: 0.0,
            max_duty: 1.0,
            feed_forward_gain: 0.0,
            integral_limit: None,
        }
    }

    fn validate(&self, zone: ZoneId) -> Result<(), ConfigError> {
        let invalid = |what: &'static str| ConfigError::InvalidZone {
            zone,
            source: CoreError::InvalidArg { what },
        };

        self.gains.validate().map_err(invalid)?;
        self.calibration
            .validate()
            .map_err(|source| ConfigError::InvalidZone { zone, source })?;
        if !(0.0..=1.0).contains(&self.min_duty) || !(0.0..=1.0).contains(&self.max_duty) {
            return Err(invalid("duty limits must be within [0, 1]"));
        }
        if self.min_duty >= self.max_duty {
            return Err(invalid("min_duty must be less than max_duty"));
        }
        if !self.feed_forward_gain.is_finite() || self.feed_forward_gain < 0.0 {
            return Err(invalid("feed_forward_gain must be finite and non-negative"));
        }
        if let Some(limit) = self.integral_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(invalid("integral_limit must be positive"));
            }
        }
        Ok(())
    }
}

impl ControlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        fn check(field: &str, value: f64, ok: bool, reason: &'static str) -> Result<(), ConfigError> {
            if value.is_finite() && ok {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value,
                    reason,
                })
            }
        }

        check(
            "tick_period_s",
            self.tick_period_s,
            self.tick_period_s > 0.0 && self.tick_period_s <= MAX_TICK_PERIOD_S,
            "must be positive and at most one hour",
        )?;
        check(
            "filter_time_constant_s",
            self.filter_time_constant_s,
            (0.0..=MAX_FILTER_TIME_CONSTANT_S).contains(&self.filter_time_constant_s),
            "must be non-negative and at most one day",
        )?;
        check(
            "io_timeout_ms",
            self.io_timeout_ms as f64,
            self.io_timeout_ms > 0,
            "must be positive",
        )?;
        if let Some(limit) = self.max_consecutive_failures {
            check(
                "max_consecutive_failures",
                limit as f64,
                limit > 0,
                "must be positive",
            )?;
        }
        if let Some(deadband) = self.retarget_deadband_c {
            check(
                "retarget_deadband_c",
                deadband,
                deadband >= 0.0,
                "must be non-negative",
            )?;
        }
        check("min_target_c", self.min_target_c, true, "must be finite")?;
        check(
            "max_target_c",
            self.max_target_c,
            self.max_target_c > self.min_target_c,
            "must exceed min_target_c",
        )?;
        check("ambient_c", self.ambient_c, true, "must be finite")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_zone_board() -> BoardConfig {
        let gains = PidGains::new(1.0, 0.1, 0.0);
        BoardConfig {
            name: "bench".to_string(),
            control: ControlConfig::default(),
            zones: vec![
                ZoneConfig::new(ChannelId::new(0), ChannelId::new(0), gains, 5.0),
                ZoneConfig::new(ChannelId::new(1), ChannelId::new(1), gains, 5.0),
            ],
        }
    }

    #[test]
    fn v4_board_is_valid() {
        let board = BoardConfig::v4();
        board.validate().unwrap();
        assert_eq!(board.zone_count(), 4);
        assert!((board.zones[0].gains.kp - 0.126).abs() < 1e-12);
        assert!((board.zones[1].gains.ki - 0.009).abs() < 1e-12);
        assert_eq!(board.zones[1].max_duty, 0.5);
        assert_eq!(board.zones[3].integral_limit, Some(50.0 * 0.007));
        assert!((board.control.filter_time_constant_s - 1.0 / 0.18).abs() < 1e-12);
    }

    #[test]
    fn v4_output_scale_caps_duty() {
        let board = BoardConfig::v4_scaled(0.5);
        assert_eq!(board.zones[0].max_duty, 0.49);
        assert_eq!(board.zones[1].max_duty, 0.25);
    }

    #[test]
    fn duplicate_sensor_channel_rejected() {
        let mut board = two_zone_board();
        board.zones[1].sensor_channel = ChannelId::new(0);
        assert_eq!(
            board.validate(),
            Err(ConfigError::DuplicateChannel {
                kind: "sensor",
                channel: ChannelId::new(0),
            })
        );
    }

    #[test]
    fn duplicate_actuator_channel_rejected() {
        let mut board = two_zone_board();
        board.zones[0].actuator_channel = ChannelId::new(1);
        assert!(matches!(
            board.validate(),
            Err(ConfigError::DuplicateChannel {
                kind: "actuator",
                ..
            })
        ));
    }

    #[test]
    fn empty_board_rejected() {
        let mut board = two_zone_board();
        board.zones.clear();
        assert_eq!(board.validate(), Err(ConfigError::NoZones));
    }

    #[test]
    fn bad_zone_values_rejected() {
        let mut board = two_zone_board();
        board.zones[1].calibration = DropCalibration::offset(-2.0);
        assert!(matches!(
            board.validate(),
            Err(ConfigError::InvalidZone { zone, .. }) if zone == ZoneId::from_index(1)
        ));

        let mut board = two_zone_board();
        board.zones[0].gains = PidGains::new(f64::NAN, 0.0, 0.0);
        assert!(board.validate().is_err());

        let mut board = two_zone_board();
        board.zones[0].max_duty = 1.2;
        assert!(board.validate().is_err());

        let mut board = two_zone_board();
        board.zones[0].integral_limit = Some(0.0);
        assert!(board.validate().is_err());
    }

    #[test]
    fn bad_control_values_rejected() {
        let mut board = two_zone_board();
        board.control.tick_period_s = 0.0;
        assert!(matches!(
            board.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "tick_period_s"
        ));

        let mut board = two_zone_board();
        board.control.max_target_c = board.control.min_target_c;
        assert!(board.validate().is_err());

        let mut board = two_zone_board();
        board.control.max_consecutive_failures = Some(0);
        assert!(board.validate().is_err());
    }

    #[test]
    fn oversized_timing_values_rejected() {
        let mut board = two_zone_board();
        board.control.tick_period_s = 1e20;
        assert!(matches!(
            board.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "tick_period_s"
        ));

        let mut board = two_zone_board();
        board.control.tick_period_s = MAX_TICK_PERIOD_S;
        board.control.filter_time_constant_s = MAX_FILTER_TIME_CONSTANT_S;
        assert!(board.validate().is_ok());

        board.control.filter_time_constant_s = 1e20;
        assert!(matches!(
            board.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "filter_time_constant_s"
        ));
    }

    #[test]
    fn yaml_fills_defaults() {
        let yaml = r#"
name: minimal
zones:
  - sensor_channel: 2
    actuator_channel: 5
    gains: { kp: 0.5, ki: 0.05, kd: 0.0 }
    calibration: { type: offset, k_drop_c: 3.0 }
"#;
        let board = BoardConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(board.control, ControlConfig::default());
        let zone = &board.zones[0];
        assert_eq!(zone.sensor_channel, ChannelId::new(2));
        assert_eq!(zone.actuator_channel, ChannelId::new(5));
        assert_eq!(zone.max_duty, 1.0);
        assert_eq!(zone.calibration, DropCalibration::offset(3.0));
    }

    #[test]
    fn yaml_validation_applies_on_load() {
        let yaml = r#"
name: broken
zones:
  - sensor_channel: 0
    actuator_channel: 0
    gains: { kp: 0.5, ki: 0.05, kd: 0.0 }
    calibration: { type: offset, k_drop_c: 0.0 }
"#;
        assert!(matches!(
            BoardConfig::from_yaml_str(yaml),
            Err(BoardFileError::Invalid(_))
        ));
    }
}
