//! Simulated heater board.
//!
//! Each channel is a lumped thermal mass heated by its PWM output and losing
//! heat to ambient:
//!
//! ```text
//! dT/dt = (ambient - T) / tau + heat_rate * duty
//! ```
//!
//! Sensor channel `i` and PWM channel `i` belong to the same heater. The
//! plant advances by a fixed simulated step on every temperature read, so a
//! controller ticking against it sees simulated time move one step per tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use pd_core::{ChannelId, ensure_fraction};
use serde::{Deserialize, Serialize};

use crate::device::{HeaterDevice, Readings};
use crate::error::{ControlError, ControlResult, DeviceError, DeviceResult};

/// First-order thermal model of one heater channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThermalModel {
    /// Ambient temperature (degrees C).
    pub ambient_c: f64,
    /// Cooling time constant (seconds), must be positive.
    pub tau_s: f64,
    /// Heating rate at full duty (degrees C per second), must be positive.
    pub heat_rate_c_per_s: f64,
}

impl ThermalModel {
    /// Create a new thermal model.
    ///
    /// # Errors
    ///
    /// Returns error if `tau_s` or `heat_rate_c_per_s` are not positive.
    pub fn new(ambient_c: f64, tau_s: f64, heat_rate_c_per_s: f64) -> ControlResult<Self> {
        if tau_s <= 0.0 {
            return Err(ControlError::InvalidArg {
                what: "tau_s must be positive".to_string(),
            });
        }
        if heat_rate_c_per_s <= 0.0 {
            return Err(ControlError::InvalidArg {
                what: "heat_rate_c_per_s must be positive".to_string(),
            });
        }
        Ok(Self {
            ambient_c,
            tau_s,
            heat_rate_c_per_s,
        })
    }

    /// Temperature derivative at `temp_c` under `duty`.
    pub fn dtdt(&self, temp_c: f64, duty: f64) -> f64 {
        (self.ambient_c - temp_c) / self.tau_s + self.heat_rate_c_per_s * duty
    }

    /// Advance by `dt` with explicit Euler integration.
    pub fn step(&self, temp_c: f64, duty: f64, dt: f64) -> f64 {
        temp_c + self.dtdt(temp_c, duty) * dt
    }

    /// Temperature the channel settles at under constant `duty`.
    pub fn steady_state(&self, duty: f64) -> f64 {
        self.ambient_c + self.heat_rate_c_per_s * self.tau_s * duty
    }
}

#[derive(Debug)]
struct SimChannel {
    temperature_c: f64,
    duty: f64,
}

#[derive(Debug)]
struct SimState {
    model: ThermalModel,
    step_s: f64,
    channels: Vec<SimChannel>,
    writes: Vec<(ChannelId, f64)>,
    reads: u64,
    read_delay: Duration,
    failing_reads: u32,
}

/// In-process stand-in for a heater board.
///
/// Clones share the same simulated hardware, so a test can hand one clone to
/// the controller and inspect the board through another.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    /// `channels` heaters starting at ambient, advancing `step_s` per read.
    pub fn new(model: ThermalModel, channels: usize, step_s: f64) -> Self {
        let channels = (0..channels)
            .map(|_| SimChannel {
                temperature_c: model.ambient_c,
                duty: 0.0,
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(SimState {
                model,
                step_s,
                channels,
                writes: Vec::new(),
                reads: 0,
                read_delay: Duration::ZERO,
                failing_reads: 0,
            })),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn temperature(&self, channel: ChannelId) -> Option<f64> {
        self.lock()
            .channels
            .get(channel.index())
            .map(|c| c.temperature_c)
    }

    pub fn set_temperature(&self, channel: ChannelId, temperature_c: f64) {
        if let Some(c) = self.lock().channels.get_mut(channel.index()) {
            c.temperature_c = temperature_c;
        }
    }

    /// Duty currently applied to a heater.
    pub fn duty(&self, channel: ChannelId) -> Option<f64> {
        self.lock().channels.get(channel.index()).map(|c| c.duty)
    }

    /// Every accepted duty write, in order.
    pub fn writes(&self) -> Vec<(ChannelId, f64)> {
        self.lock().writes.clone()
    }

    /// Last duty written to `channel`, if it was ever written.
    pub fn last_write(&self, channel: ChannelId) -> Option<f64> {
        self.lock()
            .writes
            .iter()
            .rev()
            .find(|(ch, _)| *ch == channel)
            .map(|&(_, duty)| duty)
    }

    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    /// Make every subsequent read block for `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    /// Fail the next `count` reads with a transient I/O error.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HeaterDevice for SimulatedBoard {
    fn read_temperatures(&mut self) -> DeviceResult<Readings> {
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        state.reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(DeviceError::io("simulated sensor bus error"));
        }

        let SimState {
            model,
            step_s,
            channels,
            ..
        } = &mut *state;
        for channel in channels.iter_mut() {
            channel.temperature_c = model.step(channel.temperature_c, channel.duty, *step_s);
        }
        Ok(channels
            .iter()
            .enumerate()
            .map(|(i, c)| (ChannelId::new(i as u16), c.temperature_c))
            .collect())
    }

    fn set_duty_cycle(&mut self, channel: ChannelId, duty: f64) -> DeviceResult<()> {
        ensure_fraction(duty, "duty cycle").map_err(|_| DeviceError::InvalidDuty { channel, duty })?;
        let mut state = self.lock();
        let Some(c) = state.channels.get_mut(channel.index()) else {
            return Err(DeviceError::io(format!("no PWM channel {channel}")));
        };
        c.duty = duty;
        state.writes.push((channel, duty));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ThermalModel {
        ThermalModel::new(20.0, 200.0, 0.5).unwrap()
    }

    #[test]
    fn heats_toward_steady_state() {
        let m = model();
        let mut temp = 20.0;
        for _ in 0..5000 {
            temp = m.step(temp, 0.45, 1.0);
        }
        assert!((temp - m.steady_state(0.45)).abs() < 1e-6);
        assert!((m.steady_state(0.45) - 65.0).abs() < 1e-12);
    }

    #[test]
    fn board_advances_on_read() {
        let mut board = SimulatedBoard::new(model(), 2, 1.0);
        board.set_duty_cycle(ChannelId::new(1), 1.0).unwrap();
        let readings = board.read_temperatures().unwrap();
        assert_eq!(readings[&ChannelId::new(0)], 20.0);
        assert!((readings[&ChannelId::new(1)] - 20.5).abs() < 1e-12);
        assert_eq!(board.reads(), 1);
    }

    #[test]
    fn rejects_bad_duty_and_channel() {
        let mut board = SimulatedBoard::new(model(), 1, 1.0);
        assert!(matches!(
            board.set_duty_cycle(ChannelId::new(0), 1.5),
            Err(DeviceError::InvalidDuty { .. })
        ));
        assert!(board.set_duty_cycle(ChannelId::new(4), 0.5).is_err());
        assert!(board.writes().is_empty());
    }

    #[test]
    fn injected_failures_are_transient() {
        let mut board = SimulatedBoard::new(model(), 1, 1.0);
        board.fail_next_reads(1);
        let err = board.read_temperatures().unwrap_err();
        assert!(err.is_transient());
        assert!(board.read_temperatures().is_ok());
    }

    #[test]
    fn clones_share_hardware() {
        let board = SimulatedBoard::new(model(), 1, 1.0);
        let mut handle = board.clone();
        handle.set_duty_cycle(ChannelId::new(0), 0.3).unwrap();
        assert_eq!(board.last_write(ChannelId::new(0)), Some(0.3));
        assert_eq!(board.duty(ChannelId::new(0)), Some(0.3));
    }

    #[test]
    fn invalid_parameters() {
        assert!(ThermalModel::new(20.0, 0.0, 1.0).is_err());
        assert!(ThermalModel::new(20.0, 10.0, -1.0).is_err());
    }
}
