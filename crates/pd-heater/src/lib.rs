//! Closed-loop heater control for PurpleDrop electrode boards.
//!
//! An electrode board carries several heater zones, each a temperature sensor
//! paired with a PWM heater output. This crate keeps the liquid drop on the
//! board at a requested temperature by running one PID loop per zone against a
//! low-pass filtered, drop-referenced temperature estimate.
//!
//! # Architecture
//!
//! - [`device::HeaterDevice`] is the seam to the hardware: batch temperature
//!   reads plus per-channel duty writes. [`device::TimedDevice`] bounds every
//!   call with a timeout.
//! - [`fusion::SensorFusion`] filters raw readings and maps them to the drop
//!   through a per-zone [`calibration::DropCalibration`].
//! - [`pid::ZoneController`] turns a filtered estimate into a duty cycle.
//! - [`control::TemperatureControl`] ties these together and owns the
//!   background tick thread.
//! - [`config::BoardConfig`] holds all board-specific constants.
//! - [`sim::SimulatedBoard`] is an in-process thermal plant for tests and
//!   offline runs.
//!
//! # Temperatures
//!
//! Targets and reported temperatures are drop-referenced unless a name says
//! otherwise. Zone setpoints and estimates are sensor-referenced.

pub mod calibration;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod fusion;
pub mod pid;
pub mod sampled;
pub mod sim;

pub use calibration::DropCalibration;
pub use config::{BoardConfig, BoardFileError, ConfigError, ControlConfig, ZoneConfig};
pub use control::{ControlSnapshot, TemperatureControl, TickReport, ZoneSnapshot};
pub use device::{HeaterDevice, Readings, TimedDevice};
pub use error::{ControlError, ControlResult, DeviceError, DeviceResult};
pub use fusion::SensorFusion;
pub use pid::{MIN_DT, PidGains, ZoneController, ZoneLoopState};
pub use sampled::{TickClock, TickConfig};
pub use sim::{SimulatedBoard, ThermalModel};
