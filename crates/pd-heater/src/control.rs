//! Closed-loop temperature control for all heater zones of a board.
//!
//! [`TemperatureControl`] owns one [`ZoneController`] per zone and a shared
//! [`SensorFusion`]. Each tick reads every sensor as one batch, filters the
//! readings, steps every zone with the same `dt` and writes the resulting
//! duty cycles.
//!
//! The loop can be driven manually with [`TemperatureControl::step`] or by a
//! background thread started with [`TemperatureControl::start`]. While the
//! loop runs it is the only writer of the zone actuator channels; callers must
//! not drive those PWM outputs themselves.
//!
//! Public temperatures are drop-referenced. Sensor-referenced values only
//! appear in [`ZoneSnapshot`] and [`TemperatureControl::zone_estimate`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pd_core::{ChannelId, ZoneId, ensure_in_range};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{BoardConfig, ControlConfig};
use crate::device::{HeaterDevice, TimedDevice};
use crate::error::{ControlError, ControlResult, DeviceError};
use crate::fusion::SensorFusion;
use crate::pid::ZoneController;
use crate::sampled::{TickClock, TickConfig};

/// Outcome of one control tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Interval used for filtering and PID updates.
    pub dt: f64,
    /// Duty applied per zone; `None` where the previous command was kept.
    pub duties: Vec<Option<f64>>,
    /// First device failure seen during the tick.
    pub failure: Option<DeviceError>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }
}

/// Read-only view of one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone: ZoneId,
    pub sensor_channel: ChannelId,
    pub actuator_channel: ChannelId,
    /// Last raw sensor reading.
    pub raw_c: Option<f64>,
    /// Filtered sensor-referenced estimate.
    pub estimate_c: Option<f64>,
    /// Filtered estimate converted to drop-referenced units.
    pub drop_estimate_c: Option<f64>,
    /// Sensor-referenced setpoint.
    pub setpoint_c: Option<f64>,
    /// Last duty confirmed by the device.
    pub commanded_duty: f64,
    pub integral_out: f64,
}

/// Read-only view of the whole controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlSnapshot {
    pub running: bool,
    /// Drop-referenced target.
    pub target_c: Option<f64>,
    /// Drop-referenced estimate, `None` until every zone has a sample.
    pub drop_temperature_c: Option<f64>,
    pub ticks: u64,
    pub zones: Vec<ZoneSnapshot>,
}

struct ZoneBinding {
    sensor: ChannelId,
    actuator: ChannelId,
}

struct LoopState {
    zones: Vec<ZoneController>,
    fusion: SensorFusion,
    commanded: Vec<f64>,
    consecutive_failures: u32,
    fault: Option<ControlError>,
    ticks: u64,
}

struct Shared {
    device: TimedDevice,
    bindings: Vec<ZoneBinding>,
    control: ControlConfig,
    state: Mutex<LoopState>,
}

#[derive(Default)]
struct CancelToken {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`; returns `true` once cancelled.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct TickTask {
    cancel: Arc<CancelToken>,
    handle: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Running(TickTask),
}

/// Multi-zone heater controller bound to one board.
pub struct TemperatureControl {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl TemperatureControl {
    /// Bind a controller to `device` using the given board layout.
    ///
    /// The configuration is validated first; nothing is spawned for an invalid
    /// board.
    pub fn new<D: HeaterDevice + 'static>(device: D, board: BoardConfig) -> ControlResult<Self> {
        board.validate()?;

        let zones = board
            .zones
            .iter()
            .map(|zone| ZoneController::from_config(zone, &board.control))
            .collect::<ControlResult<Vec<_>>>()?;
        let fusion = SensorFusion::new(
            board.control.filter_time_constant_s,
            board.zones.iter().map(|zone| zone.calibration),
        )?;
        let bindings = board
            .zones
            .iter()
            .map(|zone| ZoneBinding {
                sensor: zone.sensor_channel,
                actuator: zone.actuator_channel,
            })
            .collect();

        let device = TimedDevice::spawn(
            device,
            Duration::from_millis(board.control.io_timeout_ms),
        )?;

        info!(board = %board.name, zones = board.zones.len(), "temperature control ready");

        let commanded = vec![0.0; board.zones.len()];
        Ok(Self {
            shared: Arc::new(Shared {
                device,
                bindings,
                control: board.control,
                state: Mutex::new(LoopState {
                    zones,
                    fusion,
                    commanded,
                    consecutive_failures: 0,
                    fault: None,
                    ticks: 0,
                }),
            }),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        })
    }

    /// Controller for the rev4 electrode board.
    pub fn v4<D: HeaterDevice + 'static>(device: D) -> ControlResult<Self> {
        Self::new(device, BoardConfig::v4())
    }

    pub fn zone_count(&self) -> usize {
        self.shared.bindings.len()
    }

    pub fn control_config(&self) -> &ControlConfig {
        &self.shared.control
    }

    /// Set the drop-referenced target for every zone.
    ///
    /// Allowed while running or stopped. Rejected targets leave the previous
    /// target in place.
    pub fn set_target(&self, target_c: f64) -> ControlResult<()> {
        let control = &self.shared.control;
        ensure_in_range(
            target_c,
            control.min_target_c,
            control.max_target_c,
            "target temperature",
        )
        .map_err(|err| ControlError::StateError {
            what: err.to_string(),
        })?;

        let mut state = self.shared.lock_state();
        for zone in &mut state.zones {
            zone.set_target(target_c)?;
        }
        info!(target_c, "temperature target set");
        Ok(())
    }

    /// Drop-referenced target, if one has been set.
    pub fn target(&self) -> Option<f64> {
        self.shared
            .lock_state()
            .zones
            .first()
            .and_then(ZoneController::target)
    }

    /// Estimated drop temperature across all zones.
    pub fn drop_temperature(&self) -> ControlResult<f64> {
        self.shared.lock_state().fusion.aggregate()
    }

    /// Filtered sensor-referenced estimate for one zone.
    pub fn zone_estimate(&self, zone: ZoneId) -> ControlResult<f64> {
        self.shared.lock_state().fusion.estimate(zone)
    }

    /// Integral contribution per zone, in duty units.
    pub fn integrals(&self) -> Vec<f64> {
        self.shared
            .lock_state()
            .zones
            .iter()
            .map(ZoneController::integral_out)
            .collect()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let running = self.is_running();
        let state = self.shared.lock_state();
        let zones = self
            .shared
            .bindings
            .iter()
            .zip(&state.zones)
            .enumerate()
            .map(|(index, (binding, controller))| {
                let zone = ZoneId::from_index(index);
                ZoneSnapshot {
                    zone,
                    sensor_channel: binding.sensor,
                    actuator_channel: binding.actuator,
                    raw_c: state.fusion.raw(zone),
                    estimate_c: state.fusion.estimate(zone).ok(),
                    drop_estimate_c: state.fusion.drop_estimate(zone).ok(),
                    setpoint_c: controller.setpoint(),
                    commanded_duty: state.commanded[index],
                    integral_out: controller.integral_out(),
                }
            })
            .collect();

        ControlSnapshot {
            running,
            target_c: state.zones.first().and_then(ZoneController::target),
            drop_temperature_c: state.fusion.aggregate().ok(),
            ticks: state.ticks,
            zones,
        }
    }

    /// Whether a background tick thread is currently active.
    pub fn is_running(&self) -> bool {
        match &*self.lock_lifecycle() {
            Lifecycle::Stopped => false,
            Lifecycle::Running(task) => !task.handle.is_finished(),
        }
    }

    /// Fault that made the loop stop itself, if any.
    pub fn last_fault(&self) -> Option<ControlError> {
        self.shared.lock_state().fault.clone()
    }

    /// Run exactly one tick on the calling thread.
    ///
    /// `dt` must be finite and non-negative; anything else is rejected before
    /// the device or any loop state is touched.
    pub fn step(&self, dt: f64) -> ControlResult<TickReport> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ControlError::InvalidArg {
                what: format!("tick interval must be finite and non-negative, got {dt}"),
            });
        }
        let lifecycle = self.lock_lifecycle();
        if let Lifecycle::Running(task) = &*lifecycle {
            if !task.handle.is_finished() {
                return Err(ControlError::StateError {
                    what: "step() called while the background loop is running".to_string(),
                });
            }
        }
        self.shared.tick(dt)
    }

    /// Start the background control loop.
    pub fn start(&self) -> ControlResult<()> {
        let mut lifecycle = self.lock_lifecycle();

        if let Lifecycle::Running(task) = &*lifecycle {
            if !task.handle.is_finished() {
                return Err(ControlError::StateError {
                    what: "start() called while the control loop is already running".to_string(),
                });
            }
        }
        // A loop that stopped itself after a fault still needs joining.
        if let Lifecycle::Running(task) = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            if task.handle.join().is_err() {
                warn!("previous control loop thread had panicked");
            }
        }

        {
            let mut state = self.shared.lock_state();
            for zone in &mut state.zones {
                zone.reset();
            }
            state.consecutive_failures = 0;
            state.fault = None;
        }

        let cancel = Arc::new(CancelToken::default());
        let handle = thread::Builder::new()
            .name("pd-heater-tick".to_string())
            .spawn({
                let shared = Arc::clone(&self.shared);
                let cancel = Arc::clone(&cancel);
                move || run_loop(&shared, &cancel)
            })
            .map_err(|e| ControlError::StateError {
                what: format!("failed to spawn control loop thread: {e}"),
            })?;

        *lifecycle = Lifecycle::Running(TickTask { cancel, handle });
        info!(
            period_s = self.shared.control.tick_period_s,
            "temperature control started"
        );
        Ok(())
    }

    /// Stop the background loop and command zero duty on every heater.
    ///
    /// Waits for an in-flight tick to finish first. Calling `stop` while
    /// already stopped only re-issues the zero command. An error means at
    /// least one zero write was not confirmed by the device within the I/O
    /// timeout; the writes stay queued and the controller is stopped anyway.
    pub fn stop(&self) -> ControlResult<()> {
        let mut lifecycle = self.lock_lifecycle();
        if let Lifecycle::Running(task) = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            task.cancel.cancel();
            if task.handle.join().is_err() {
                warn!("control loop thread panicked");
            }
            info!("temperature control stopped");
        }
        self.shared.zero_all()?;
        Ok(())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TemperatureControl {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "could not confirm heaters off while dropping temperature control");
        }
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self, dt: f64) -> ControlResult<TickReport> {
        let zone_count = self.bindings.len();
        let readings = self.device.read_temperatures();

        let mut state = self.lock_state();
        state.ticks += 1;

        let readings = match readings {
            Ok(readings) => readings,
            Err(err) => {
                warn!(%err, "temperature read failed, holding previous duty cycles");
                state.record_outcome(Some(&err), self.control.max_consecutive_failures)?;
                return Ok(TickReport {
                    dt,
                    duties: vec![None; zone_count],
                    failure: Some(err),
                });
            }
        };

        let mut failures = TickFailures::default();
        let mut commands = Vec::with_capacity(zone_count);
        let LoopState { zones, fusion, .. } = &mut *state;
        for (index, (binding, controller)) in self.bindings.iter().zip(zones.iter_mut()).enumerate() {
            let zone = ZoneId::from_index(index);
            let Some(&raw) = readings.get(&binding.sensor) else {
                warn!(%zone, channel = %binding.sensor, "no reading for zone sensor");
                failures.note(DeviceError::MissingChannel {
                    channel: binding.sensor,
                });
                continue;
            };
            if !raw.is_finite() {
                warn!(%zone, channel = %binding.sensor, raw, "discarding non-finite sensor reading");
                failures.note(DeviceError::BadReading {
                    channel: binding.sensor,
                    value: raw,
                });
                continue;
            }
            let filtered = fusion.ingest(zone, raw, dt)?;
            let duty = controller.step(filtered, dt);
            commands.push((index, binding.actuator, duty));
        }
        drop(state);

        let writes: Vec<_> = commands
            .iter()
            .map(|&(_, channel, duty)| (channel, duty))
            .collect();
        let results = self.device.set_duty_cycles(&writes);

        let mut duties = vec![None; zone_count];
        let mut state = self.lock_state();
        for (&(index, channel, duty), result) in commands.iter().zip(results) {
            match result {
                Ok(()) => {
                    state.commanded[index] = duty;
                    duties[index] = Some(duty);
                }
                Err(err) if !err.is_transient() => {
                    error!(%channel, duty, %err, "device rejected duty command");
                    failures.note(err);
                }
                Err(err) => {
                    warn!(%channel, %err, "duty write failed, heater keeps previous command");
                    failures.note(err);
                }
            }
        }
        state.record_outcome(failures.transient.as_ref(), self.control.max_consecutive_failures)?;

        debug!(
            dt,
            drop_c = ?state.fusion.aggregate().ok(),
            ?duties,
            "control tick"
        );
        Ok(TickReport {
            dt,
            duties,
            failure: failures.first,
        })
    }

    /// Command 0.0 on every heater output.
    fn zero_all(&self) -> ControlResult<()> {
        let writes: Vec<_> = self
            .bindings
            .iter()
            .map(|binding| (binding.actuator, 0.0))
            .collect();
        let results = self.device.set_duty_cycles(&writes);

        let mut first_err = None;
        let mut state = self.lock_state();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => state.commanded[index] = 0.0,
                Err(err) => {
                    warn!(channel = %writes[index].0, %err, "zero duty command not confirmed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Device failures seen during one tick.
#[derive(Default)]
struct TickFailures {
    /// First failure of any kind, reported to the caller.
    first: Option<DeviceError>,
    /// First failure that counts toward escalation.
    transient: Option<DeviceError>,
}

impl TickFailures {
    fn note(&mut self, err: DeviceError) {
        if err.is_transient() && self.transient.is_none() {
            self.transient = Some(err.clone());
        }
        self.first.get_or_insert(err);
    }
}

impl LoopState {
    fn record_outcome(
        &mut self,
        failure: Option<&DeviceError>,
        limit: Option<u32>,
    ) -> ControlResult<()> {
        let Some(err) = failure else {
            self.consecutive_failures = 0;
            return Ok(());
        };
        self.consecutive_failures += 1;
        match limit {
            Some(limit) if self.consecutive_failures >= limit => {
                let fault = ControlError::Device(err.clone());
                self.fault = Some(fault.clone());
                Err(fault)
            }
            _ => Ok(()),
        }
    }
}

/// Zeroes the heaters when the tick thread exits, including by panic.
struct ZeroOnExit<'a>(&'a Shared);

impl Drop for ZeroOnExit<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.zero_all() {
            error!(%err, "failed to zero heaters on control loop exit");
        }
    }
}

fn run_loop(shared: &Shared, cancel: &CancelToken) {
    let _zero_on_exit = ZeroOnExit(shared);

    let period_s = shared.control.tick_period_s;
    let epoch = Instant::now();
    let mut clock = TickClock::new(TickConfig::new(period_s), 0.0);
    let mut last_tick: Option<Instant> = None;

    loop {
        let now_s = epoch.elapsed().as_secs_f64();
        if !clock.is_due(now_s) {
            let wait = Duration::from_secs_f64(clock.time_until_tick(now_s));
            if cancel.wait(wait) {
                break;
            }
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }

        let skipped = clock.advance(now_s);
        if skipped > 0 {
            debug!(skipped, "control tick overran, skipping missed ticks");
        }

        let now = Instant::now();
        let dt = last_tick.map_or(period_s, |prev| now.duration_since(prev).as_secs_f64());
        last_tick = Some(now);

        if let Err(err) = shared.tick(dt) {
            error!(%err, "control tick failed, stopping control loop");
            break;
        }
    }
    debug!("control loop exiting");
}
