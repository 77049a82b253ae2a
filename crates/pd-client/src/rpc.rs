//! Transport seam for gateway calls.
//!
//! The gateway exposes every board operation as a remote method taking
//! positional parameters. How a call reaches the gateway is up to the
//! implementor of [`RpcCaller`].

use serde_json::Value;

use crate::error::RpcResult;

/// Issues one remote call and returns its result value.
pub trait RpcCaller {
    fn call(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value>;
}

impl<C: RpcCaller + ?Sized> RpcCaller for Box<C> {
    fn call(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        (**self).call(method, params)
    }
}
