//! Device capabilities and the one-shot ray-query probe.

use super::RayDevice;

/// Width of a program identifier in bytes.
pub const PROGRAM_IDENTIFIER_SIZE: usize = 32;

/// Hardware limits that shape acceleration structures and record tables.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCaps {
    /// Adapter name for logging.
    pub name: String,
    /// Whether ray dispatch and acceleration structures are available.
    pub ray_queries: bool,
    /// Deepest nested trace a pipeline may declare.
    pub max_recursion_depth: u32,
    /// Program identifier width in bytes.
    pub program_identifier_size: u32,
    /// Record stride alignment.
    pub record_alignment: u32,
    /// Start-address alignment of a record table.
    pub table_alignment: u32,
    /// Total allocatable bytes.
    pub memory_budget: u64,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            name: "software".to_string(),
            ray_queries: true,
            max_recursion_depth: 31,
            program_identifier_size: PROGRAM_IDENTIFIER_SIZE as u32,
            record_alignment: 32,
            table_alignment: 64,
            memory_budget: 512 * 1024 * 1024,
        }
    }
}

/// Capability probe. Call once at startup; the answer holds for the process lifetime.
pub fn supports_ray_queries(device: &dyn RayDevice) -> bool {
    let caps = device.caps();
    let supported = caps.ray_queries;
    if supported {
        tracing::info!(device = %caps.name, "ray queries supported");
    } else {
        tracing::warn!(device = %caps.name, "ray queries unsupported, ray path disabled");
    }
    supported
}
