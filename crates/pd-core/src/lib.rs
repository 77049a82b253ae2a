//! pd-core: shared foundation for the PurpleDrop client crates.
//!
//! Contains:
//! - ids (zone and hardware channel identifiers)
//! - numeric (finite, range and fraction checks)
//! - error (shared error types)

pub mod error;
pub mod ids;
pub mod numeric;

pub use error::{CoreError, CoreResult};
pub use ids::*;
pub use numeric::*;
