//! Fences, state transitions and cross-queue ordering

use hybrid_rt::device::software::{builtin_library, SoftwareDevice};
use hybrid_rt::device::{
    BufferDesc, BufferKind, Command, DeviceError, DispatchRaysDesc, GlobalBindings,
    ProgramIdentifier, RayDevice, ResourceState, SubmissionId, TextureDesc, TextureFormat,
    TextureId,
};
use hybrid_rt::prelude::*;

fn texture(device: &SoftwareDevice, label: &str, format: TextureFormat, state: ResourceState) -> TextureId {
    device
        .create_texture(&TextureDesc::new(label, 8, 8, format, state))
        .unwrap()
}

#[test]
fn test_cross_queue_wait() {
    let device = SoftwareDevice::new();
    let target = texture(&device, "ao", TextureFormat::Rgba16Float, ResourceState::UnorderedAccess);

    let mut compute = CommandList::new(QueueKind::Compute, "ambient_occlusion");
    compute.clear_texture(target, [0.5; 4]);
    let produced = device.submit(compute).unwrap();
    assert_eq!(produced.queue, QueueKind::Compute);

    let mut graphics = CommandList::new(QueueKind::Graphics, "consume");
    graphics.wait(produced);
    graphics.transition(target, ResourceState::UnorderedAccess, ResourceState::ShaderResource);
    device.submit(graphics).unwrap();
}

#[test]
fn test_wait_on_unsubmitted_work_stalls() {
    let device = SoftwareDevice::new();
    let never = SubmissionId {
        queue: QueueKind::Compute,
        value: 3,
    };
    let mut graphics = CommandList::new(QueueKind::Graphics, "consume");
    graphics.wait(never);
    assert_eq!(device.submit(graphics).unwrap_err(), DeviceError::QueueStall(never));
}

#[test]
fn test_wrong_transition_source_rejected() {
    let device = SoftwareDevice::new();
    let color = texture(&device, "color", TextureFormat::Rgba32Float, ResourceState::RenderTarget);
    let mut list = CommandList::new(QueueKind::Graphics, "bad");
    list.transition(color, ResourceState::DepthWrite, ResourceState::ShaderResource);
    assert!(matches!(
        device.submit(list),
        Err(DeviceError::InvalidState {
            actual: ResourceState::RenderTarget,
            ..
        })
    ));
}

/// Global bindings over the subsystem's scene with fresh constant buffers.
fn bindings(device: &SoftwareDevice, subsystem: &RaySubsystem, color: TextureId, depth: TextureId, normal: TextureId, shadow_map: TextureId) -> GlobalBindings {
    let constants = |label: &str| {
        device
            .create_buffer(&BufferDesc::new(label, 256, BufferKind::Upload))
            .unwrap()
    };
    GlobalBindings {
        hit_constants: constants("hit"),
        frame_constants: constants("frame"),
        geometry_info: subsystem.geometry().geometry_info,
        materials: subsystem.materials().materials,
        vertex_buffer: subsystem.geometry().vertex_buffer,
        index_buffer: subsystem.geometry().index_buffer,
        top_level: subsystem.index().top_level(),
        output: color,
        depth,
        normal,
        shadow_map,
    }
}

fn traversal_dispatch(subsystem: &RaySubsystem, ray_generation: ProgramIdentifier) -> DispatchRaysDesc {
    let technique = subsystem.techniques().get(TechniqueId::Traversal);
    DispatchRaysDesc {
        ray_generation,
        miss: technique.miss,
        hit_groups: subsystem.records().get(TechniqueId::Traversal).view(),
        width: 8,
        height: 8,
        depth: 1,
    }
}

#[test]
fn test_dispatch_without_transitions_rejected() {
    let device = SoftwareDevice::new();
    let scene = demo::demo_scene().unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    let color = texture(&device, "color", TextureFormat::Rgba32Float, ResourceState::UnorderedAccess);
    let depth = texture(&device, "depth", TextureFormat::R32Float, ResourceState::DepthWrite);
    let normal = texture(&device, "normal", TextureFormat::Rgba32Float, ResourceState::ShaderResource);
    let shadow = texture(&device, "shadow", TextureFormat::R32Float, ResourceState::ShaderResource);

    let technique = subsystem.techniques().get(TechniqueId::Traversal);
    let mut list = CommandList::new(QueueKind::Graphics, "missing_transition");
    list.set_descriptor_heap(subsystem.materials().heap);
    list.set_pipeline(technique.pipeline);
    list.set_global_bindings(bindings(&device, &subsystem, color, depth, normal, shadow));
    list.dispatch_rays(traversal_dispatch(&subsystem, technique.ray_generation));
    assert!(matches!(
        device.submit(list),
        Err(DeviceError::InvalidState {
            expected: ResourceState::ShaderResource,
            actual: ResourceState::DepthWrite,
            ..
        })
    ));
}

#[test]
fn test_dispatch_with_foreign_identifier_rejected() {
    let device = SoftwareDevice::new();
    let scene = demo::demo_scene().unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    let color = texture(&device, "color", TextureFormat::Rgba32Float, ResourceState::UnorderedAccess);
    let depth = texture(&device, "depth", TextureFormat::R32Float, ResourceState::ShaderResource);
    let normal = texture(&device, "normal", TextureFormat::Rgba32Float, ResourceState::ShaderResource);
    let shadow = texture(&device, "shadow", TextureFormat::R32Float, ResourceState::ShaderResource);
    let technique = subsystem.techniques().get(TechniqueId::Traversal);
    let shadow_rays = subsystem.techniques().get(TechniqueId::ShadowRays);

    let record = |ray_generation: ProgramIdentifier| {
        let mut list = CommandList::new(QueueKind::Graphics, "dispatch");
        list.set_descriptor_heap(subsystem.materials().heap);
        list.set_pipeline(technique.pipeline);
        list.set_global_bindings(bindings(&device, &subsystem, color, depth, normal, shadow));
        list.dispatch_rays(traversal_dispatch(&subsystem, ray_generation));
        list
    };

    // Ray generation compiled into another pipeline
    assert_eq!(
        device.submit(record(shadow_rays.ray_generation)).unwrap_err(),
        DeviceError::IdentifierMismatch("ray generation")
    );
    device.submit(record(technique.ray_generation)).unwrap();
}

#[test]
fn test_clear_without_fence_is_a_hazard_for_blend() {
    let device = SoftwareDevice::new();
    let current = texture(&device, "current", TextureFormat::Rgba32Float, ResourceState::ShaderResource);
    let src = texture(&device, "src", TextureFormat::Rgba16Float, ResourceState::UnorderedAccess);
    let dst = texture(&device, "dst", TextureFormat::Rgba16Float, ResourceState::UnorderedAccess);
    let out = texture(&device, "out", TextureFormat::Rgba32Float, ResourceState::UnorderedAccess);

    let blend = Command::TemporalBlend {
        current,
        history_src: src,
        history_dst: dst,
        output: out,
        weight: 1.0,
    };
    let mut list = CommandList::new(QueueKind::Graphics, "unfenced");
    list.clear_texture(src, [0.0; 4]);
    list.push(blend.clone());
    assert_eq!(
        device.submit(list).unwrap_err(),
        DeviceError::Hazard { resource: src.into() }
    );

    let mut list = CommandList::new(QueueKind::Graphics, "fenced");
    list.clear_texture(src, [0.0; 4]);
    list.uav_barrier(Some(src.into()));
    list.push(blend);
    device.submit(list).unwrap();
}
