//! Data owned by the asset, material and camera collaborators.
//!
//! Geometry and materials are fixed after load; the subsystem only reads them.

mod camera;
pub mod demo;
mod geometry;
mod light;
mod material;

pub use camera::*;
pub use geometry::*;
pub use light::*;
pub use material::*;
