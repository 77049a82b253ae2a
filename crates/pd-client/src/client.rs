//! Typed wrapper over the gateway RPC methods used by heater control.

use pd_core::{ChannelId, ensure_fraction};
use pd_heater::{DeviceError, DeviceResult, HeaterDevice, Readings};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::trace;

use crate::error::{RpcError, RpcResult};
use crate::rpc::RpcCaller;

/// Client for one PurpleDrop gateway.
///
/// Implements [`HeaterDevice`] so a [`pd_heater::TemperatureControl`] can
/// drive a real board. Temperature sensor `i` is the `i`-th entry of
/// `get_temperatures`; PWM channel `i` is passed to `set_pwm_duty_cycle`
/// unchanged.
#[derive(Debug)]
pub struct PdClient<C> {
    caller: C,
}

impl<C: RpcCaller> PdClient<C> {
    pub fn new(caller: C) -> Self {
        Self { caller }
    }

    pub fn caller(&self) -> &C {
        &self.caller
    }

    pub fn into_inner(self) -> C {
        self.caller
    }

    /// Most recent temperature of every sensor, in degrees C.
    ///
    /// The list length depends on the board and may be zero.
    pub fn temperatures(&mut self) -> RpcResult<Vec<f64>> {
        self.call_typed("get_temperatures", vec![])
    }

    /// Set the duty cycle of one PWM output, `duty` in [0, 1].
    pub fn set_pwm_duty_cycle(&mut self, channel: ChannelId, duty: f64) -> RpcResult<()> {
        ensure_fraction(duty, "duty cycle").map_err(|err| RpcError::InvalidArg {
            what: err.to_string(),
        })?;
        self.caller
            .call("set_pwm_duty_cycle", vec![json!(channel.get()), json!(duty)])?;
        Ok(())
    }

    /// Most recent capacitance of the active electrodes.
    pub fn active_capacitance(&mut self) -> RpcResult<f64> {
        self.call_typed("get_active_capacitance", vec![])
    }

    fn call_typed<T: DeserializeOwned>(&mut self, method: &str, params: Vec<Value>) -> RpcResult<T> {
        let result = self.caller.call(method, params)?;
        trace!(method, %result, "rpc result");
        serde_json::from_value(result).map_err(|source| RpcError::Decode {
            method: method.to_string(),
            source,
        })
    }
}

impl<C: RpcCaller + Send> HeaterDevice for PdClient<C> {
    fn read_temperatures(&mut self) -> DeviceResult<Readings> {
        let temperatures = self
            .temperatures()
            .map_err(|err| err.into_device_error("read_temperatures"))?;
        Ok(temperatures
            .into_iter()
            .enumerate()
            .map(|(index, temp)| (ChannelId::new(index as u16), temp))
            .collect())
    }

    fn set_duty_cycle(&mut self, channel: ChannelId, duty: f64) -> DeviceResult<()> {
        match self.set_pwm_duty_cycle(channel, duty) {
            Ok(()) => Ok(()),
            Err(RpcError::InvalidArg { .. }) => Err(DeviceError::InvalidDuty { channel, duty }),
            Err(err) => Err(err.into_device_error("set_duty_cycle")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned results and records every call.
    #[derive(Default)]
    struct Scripted {
        replies: VecDeque<RpcResult<Value>>,
        calls: Vec<(String, Vec<Value>)>,
    }

    impl Scripted {
        fn reply(mut self, result: RpcResult<Value>) -> Self {
            self.replies.push_back(result);
            self
        }
    }

    impl RpcCaller for Scripted {
        fn call(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
            self.calls.push((method.to_string(), params));
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(RpcError::transport("no scripted reply")))
        }
    }

    #[test]
    fn reads_temperature_list() {
        let mut client = PdClient::new(Scripted::default().reply(Ok(json!([21.0, 22.5, 23.0]))));
        assert_eq!(client.temperatures().unwrap(), vec![21.0, 22.5, 23.0]);
        assert_eq!(client.caller().calls[0].0, "get_temperatures");
    }

    #[test]
    fn readings_are_keyed_by_list_position() {
        let mut client = PdClient::new(Scripted::default().reply(Ok(json!([30.0, 31.0]))));
        let readings = client.read_temperatures().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[&ChannelId::new(1)], 31.0);
    }

    #[test]
    fn writes_duty_as_positional_params() {
        let mut client = PdClient::new(Scripted::default().reply(Ok(Value::Null)));
        client.set_duty_cycle(ChannelId::new(3), 0.75).unwrap();
        let (method, params) = &client.caller().calls[0];
        assert_eq!(method, "set_pwm_duty_cycle");
        assert_eq!(params, &vec![json!(3), json!(0.75)]);
    }

    #[test]
    fn out_of_range_duty_never_reaches_the_gateway() {
        let mut client = PdClient::new(Scripted::default());
        let err = client.set_duty_cycle(ChannelId::new(0), 1.2).unwrap_err();
        assert_eq!(
            err,
            DeviceError::InvalidDuty {
                channel: ChannelId::new(0),
                duty: 1.2
            }
        );
        assert!(client.caller().calls.is_empty());
    }

    #[test]
    fn bad_result_shape_is_a_decode_error() {
        let mut client = PdClient::new(Scripted::default().reply(Ok(json!({"raw": []}))));
        assert!(matches!(
            client.active_capacitance(),
            Err(RpcError::Decode { .. })
        ));
    }

    #[test]
    fn transport_failures_are_transient_device_errors() {
        let mut client = PdClient::new(Scripted::default().reply(Err(RpcError::Timeout {
            method: "get_temperatures".to_string(),
            timeout_ms: 100,
        })));
        let err = client.read_temperatures().unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { op: "read_temperatures", .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn active_capacitance() {
        let mut client = PdClient::new(Scripted::default().reply(Ok(json!(12.5))));
        assert_eq!(client.active_capacitance().unwrap(), 12.5);
    }
}
