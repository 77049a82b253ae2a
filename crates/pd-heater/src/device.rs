//! Device adapter seam.
//!
//! The controller only needs two capabilities from the board: a batch read of
//! all temperature sensors and a per-channel PWM duty write. [`TimedDevice`]
//! moves an adapter onto its own I/O thread so that every call is bounded by a
//! timeout, even when the adapter itself hangs.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use pd_core::ChannelId;
use tracing::{debug, warn};

use crate::error::{DeviceError, DeviceResult};

/// Raw sensor readings keyed by sensor channel, in degrees C.
pub type Readings = BTreeMap<ChannelId, f64>;

/// Capabilities the temperature controller consumes from a board.
///
/// Implementations should return within a bounded time and report
/// timeouts/disconnects as transient [`DeviceError`]s.
pub trait HeaterDevice: Send {
    /// Read every temperature sensor as one batch.
    fn read_temperatures(&mut self) -> DeviceResult<Readings>;

    /// Set the PWM duty cycle of one heater output, `duty` in [0, 1].
    fn set_duty_cycle(&mut self, channel: ChannelId, duty: f64) -> DeviceResult<()>;
}

impl<D: HeaterDevice + ?Sized> HeaterDevice for Box<D> {
    fn read_temperatures(&mut self) -> DeviceResult<Readings> {
        (**self).read_temperatures()
    }

    fn set_duty_cycle(&mut self, channel: ChannelId, duty: f64) -> DeviceResult<()> {
        (**self).set_duty_cycle(channel, duty)
    }
}

enum Request {
    Read {
        reply: Sender<DeviceResult<Readings>>,
    },
    Write {
        channel: ChannelId,
        duty: f64,
        reply: Sender<DeviceResult<()>>,
    },
}

/// A device adapter running on a dedicated I/O thread.
///
/// Requests are served in submission order. A caller waits at most the
/// configured timeout for its reply; a request that timed out stays queued and
/// is still executed once the adapter unblocks. At most one temperature read
/// is outstanding: while an earlier read has not completed, a new read waits
/// on that one instead of queueing another.
pub struct TimedDevice {
    requests: Sender<Request>,
    timeout: Duration,
    outstanding_read: Mutex<Option<Receiver<DeviceResult<Readings>>>>,
}

impl TimedDevice {
    pub fn spawn<D: HeaterDevice + 'static>(device: D, timeout: Duration) -> DeviceResult<Self> {
        let (requests, inbox) = mpsc::channel();
        thread::Builder::new()
            .name("pd-heater-io".to_string())
            .spawn(move || serve(device, inbox))
            .map_err(|e| DeviceError::io(format!("failed to spawn device thread: {e}")))?;
        Ok(Self {
            requests,
            timeout,
            outstanding_read: Mutex::new(None),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn read_temperatures(&self) -> DeviceResult<Readings> {
        let mut outstanding = self
            .outstanding_read
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + self.timeout;

        let pending = match outstanding.take() {
            Some(earlier) => match earlier.try_recv() {
                Err(TryRecvError::Empty) => earlier,
                // Completed after its caller gave up; the result is stale.
                Ok(_) | Err(TryRecvError::Disconnected) => self.submit_read()?,
            },
            None => self.submit_read()?,
        };

        let result = self.await_reply("read_temperatures", &pending, deadline);
        if matches!(result, Err(DeviceError::Timeout { .. })) {
            *outstanding = Some(pending);
        }
        result
    }

    fn submit_read(&self) -> DeviceResult<Receiver<DeviceResult<Readings>>> {
        let (reply, pending) = mpsc::channel();
        self.submit(Request::Read { reply })?;
        Ok(pending)
    }

    pub fn set_duty_cycle(&self, channel: ChannelId, duty: f64) -> DeviceResult<()> {
        self.set_duty_cycles(&[(channel, duty)])
            .pop()
            .unwrap_or(Err(DeviceError::Disconnected))
    }

    /// Submit several duty writes at once and wait for all of them under a
    /// single deadline. Results are returned in input order.
    pub fn set_duty_cycles(&self, commands: &[(ChannelId, f64)]) -> Vec<DeviceResult<()>> {
        let deadline = Instant::now() + self.timeout;
        let pending: Vec<_> = commands
            .iter()
            .map(|&(channel, duty)| {
                let (reply, pending) = mpsc::channel();
                self.submit(Request::Write {
                    channel,
                    duty,
                    reply,
                })
                .map(|()| pending)
            })
            .collect();

        pending
            .into_iter()
            .map(|submitted| {
                let pending = submitted?;
                self.await_reply("set_duty_cycle", &pending, deadline)
            })
            .collect()
    }

    fn submit(&self, request: Request) -> DeviceResult<()> {
        self.requests
            .send(request)
            .map_err(|_| DeviceError::Disconnected)
    }

    fn await_reply<T>(
        &self,
        op: &'static str,
        pending: &Receiver<DeviceResult<T>>,
        deadline: Instant,
    ) -> DeviceResult<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match pending.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout {
                op,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Disconnected),
        }
    }
}

fn serve<D: HeaterDevice>(mut device: D, inbox: Receiver<Request>) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Read { reply } => {
                let result = device.read_temperatures();
                if reply.send(result).is_err() {
                    warn!("temperature read completed after its caller gave up");
                }
            }
            Request::Write {
                channel,
                duty,
                reply,
            } => {
                let result = device.set_duty_cycle(channel, duty);
                if reply.send(result).is_err() {
                    debug!(%channel, duty, "duty write completed after its caller gave up");
                }
            }
        }
    }
    debug!("device thread exiting");
}
