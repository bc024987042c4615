//! Utility types and functions.
//!
//! - [`Error`] / [`Result`] / [`ErrorKind`] - Error handling
//! - Alignment helpers and math re-exports from glam

mod error;
mod math;

pub use error::*;
pub use math::*;
