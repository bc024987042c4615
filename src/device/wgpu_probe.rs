//! Ray-query capability probe for a real wgpu adapter.
//!
//! Only answers whether the hardware path could be taken; the subsystem
//! itself runs on [`SoftwareDevice`](super::software::SoftwareDevice).

use super::DeviceCaps;

/// Whether the adapter exposes ray queries and acceleration structures.
pub fn adapter_supports_ray_queries(adapter: &wgpu::Adapter) -> bool {
    let features = adapter.features();
    features.contains(wgpu::Features::EXPERIMENTAL_RAY_QUERY)
}

/// Capabilities reported for an adapter. Limits wgpu does not expose keep
/// their defaults.
pub fn adapter_caps(adapter: &wgpu::Adapter) -> DeviceCaps {
    let info = adapter.get_info();
    let ray_queries = adapter_supports_ray_queries(adapter);
    tracing::info!(
        adapter = %info.name,
        backend = ?info.backend,
        ray_queries,
        "adapter probed"
    );
    DeviceCaps {
        name: info.name,
        ray_queries,
        ..DeviceCaps::default()
    }
}

/// Probe the system's default adapter. `None` when no adapter is available.
pub fn probe_default_adapter() -> Option<DeviceCaps> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    match pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default())) {
        Ok(adapter) => Some(adapter_caps(&adapter)),
        Err(err) => {
            tracing::warn!(error = %err, "no wgpu adapter");
            None
        }
    }
}
