//! Error types for the PurpleDrop gateway client.

use pd_heater::DeviceError;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The transport could not deliver the request or read the reply.
    #[error("Transport error: {what}")]
    Transport { what: String },

    /// The transport gave up waiting for a reply.
    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The gateway rejected the call.
    #[error("{method} failed with code {code}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },

    /// The result did not have the expected shape.
    #[error("Could not decode result of {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid argument: {what}")]
    InvalidArg { what: String },
}

impl RpcError {
    pub fn transport(what: impl Into<String>) -> Self {
        Self::Transport { what: what.into() }
    }

    /// Convert into the error type the heater controller understands.
    pub fn into_device_error(self, op: &'static str) -> DeviceError {
        match self {
            RpcError::Timeout { timeout_ms, .. } => DeviceError::Timeout { op, timeout_ms },
            other => DeviceError::io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_stay_timeouts() {
        let err = RpcError::Timeout {
            method: "get_temperatures".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.into_device_error("read_temperatures"),
            DeviceError::Timeout {
                op: "read_temperatures",
                timeout_ms: 250
            }
        );
    }

    #[test]
    fn other_failures_become_io() {
        let err = RpcError::Remote {
            method: "set_pwm_duty_cycle".to_string(),
            code: -32601,
            message: "Method not found".to_string(),
        };
        let device = err.into_device_error("set_duty_cycle");
        assert!(device.is_transient());
        assert!(device.to_string().contains("-32601"));
    }
}
