//! pd-client: access to a PurpleDrop gateway.
//!
//! Contains:
//! - rpc (the `RpcCaller` transport seam)
//! - client (`PdClient`, typed gateway calls and the heater device adapter)
//! - error (`RpcError`)
//!
//! No transport ships with this crate; callers implement [`RpcCaller`] for
//! whatever connection they hold to the gateway.

pub mod client;
pub mod error;
pub mod rpc;

pub use client::PdClient;
pub use error::{RpcError, RpcResult};
pub use rpc::RpcCaller;
