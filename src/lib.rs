//! # hybrid-rt
//!
//! Ray-query subsystem of a hybrid rasterization/ray-tracing renderer.
//!
//! A static scene is indexed once at startup (one bottom level, one
//! instance per object), five ray techniques are compiled with explicit
//! stack budgets, and one hit-group record table is serialized per
//! technique. Each frame a mode selects a technique and the dispatcher
//! records constants, state transitions, bindings and the ray dispatch.
//!
//! ## Modules
//!
//! - [`util`] - Errors, error taxonomy, alignment math
//! - [`abi`] - Shader-visible structures
//! - [`device`] - Backend seam and the software device
//! - [`scene`] - Geometry, materials, cameras and lights from collaborators
//! - [`accel`] - Spatial index builder
//! - [`technique`] - Technique registry
//! - [`records`] - Dispatch record tables
//! - [`history`] - Temporal history buffers
//! - [`frame`] - Modes and the frame dispatcher
//! - [`subsystem`] - Startup entry points
//! - [`settings`] - Persistent render settings
//!
//! ## Example
//!
//! ```ignore
//! use hybrid_rt::prelude::*;
//!
//! let device = SoftwareDevice::new();
//! let scene = demo::demo_scene()?;
//! let subsystem = probe_and_initialize(&device, &scene.meshes, &scene.materials, &builtin_library())?;
//! let mut dispatcher = FrameDispatcher::new(&device, subsystem, (320, 180))?;
//! ```

pub mod abi;
pub mod accel;
pub mod device;
pub mod frame;
pub mod history;
pub mod records;
pub mod scene;
pub mod settings;
pub mod subsystem;
pub mod technique;
pub mod util;

// Re-export commonly used types
pub use util::{Error, ErrorKind, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{SpatialIndex, SpatialIndexBuilder};
    pub use crate::device::software::{builtin_library, SoftwareDevice};
    pub use crate::device::{supports_ray_queries, CommandList, QueueKind, RayDevice};
    pub use crate::frame::{FrameDispatcher, FrameTargets, Mode};
    pub use crate::history::HistoryBufferManager;
    pub use crate::records::{DispatchRecordTable, RecordLayout, RecordTables};
    pub use crate::scene::demo;
    pub use crate::settings::RenderSettings;
    pub use crate::subsystem::{probe_and_initialize, RaySubsystem};
    pub use crate::technique::{TechniqueId, TechniqueRegistry};
    pub use crate::util::{Error, ErrorKind, Result};
}
