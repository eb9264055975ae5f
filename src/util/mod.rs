//! Utility types and functions shared by the scheduler and devices.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from glam, hashing and the per-path RNG

mod error;
mod math;

pub use error::*;
pub use math::*;
