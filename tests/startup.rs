//! Startup builds: spatial index, technique registry and record tables

use hybrid_rt::device::software::{builtin_library, SoftwareDevice};
use hybrid_rt::device::{DeviceCaps, DeviceError, ProgramLibrary, RayDevice};
use hybrid_rt::prelude::*;
use hybrid_rt::technique::stack_size_budget;

#[test]
fn test_record_tables_for_37_objects() {
    let device = SoftwareDevice::new();
    let scene = demo::grid_scene(37).unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    let caps = device.caps();
    for id in TechniqueId::ALL {
        let table = subsystem.records().get(id);
        assert_eq!(table.len(), 37);
        assert_eq!(table.stride(), 64);
        assert_eq!(table.stride() % caps.record_alignment as u64, 0);
        assert_eq!(table.byte_len(), 2368);
        assert_eq!(device.buffer_size(table.view().buffer).unwrap(), 2368);
    }
}

#[test]
fn test_instances_match_objects() {
    let device = SoftwareDevice::new();
    let scene = demo::grid_scene(12).unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    let index = subsystem.index();
    assert_eq!(index.instance_count(), 12);
    let descs = index.instance_descs(&device).unwrap();
    assert_eq!(descs.len(), 12);
    for (i, desc) in descs.iter().enumerate() {
        assert_eq!(desc.hit_group_offset(), i as u32);
        assert_eq!(desc.instance_id(), i as u32);
        assert_eq!(desc.mask(), 1);
    }
}

#[test]
fn test_records_carry_hit_group_and_material() {
    let device = SoftwareDevice::new();
    let scene = demo::demo_scene().unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    let technique = subsystem.techniques().get(TechniqueId::ReflectionHit);
    let table = subsystem.records().get(TechniqueId::ReflectionHit);
    let layout = *table.layout();
    let bytes = device.read_buffer(table.view().buffer).unwrap();
    for (i, mesh) in scene.meshes.iter().enumerate() {
        let record = &bytes[i * layout.stride as usize..(i + 1) * layout.stride as usize];
        assert_eq!(&record[..32], &technique.hit_group.0);

        let slot = scene.materials.slot(mesh.material_id).unwrap();
        let at = layout.material_offset as usize;
        assert_eq!(u32::from_le_bytes(record[at..at + 4].try_into().unwrap()), slot);

        let at = layout.descriptor_table_offset as usize;
        let handle = u64::from_le_bytes(record[at..at + 8].try_into().unwrap());
        let expected = subsystem.materials().descriptor_table(&device, slot).unwrap();
        assert_eq!(handle, expected.0);
    }
}

#[test]
fn test_stack_budgets_cover_recursion() {
    let device = SoftwareDevice::new();
    let scene = demo::demo_scene().unwrap();
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();

    for technique in subsystem.techniques().iter() {
        let programs = technique.programs();
        let size = |export: &str| device.program_stack_size(technique.pipeline, export).unwrap();
        let floor = stack_size_budget(
            size(programs.ray_generation),
            size(programs.closest_hit),
            size(programs.any_hit),
            size(programs.miss),
            technique.max_recursion,
        );
        assert_eq!(technique.max_recursion, 2);
        assert!(technique.stack_size >= floor, "{} budget too small", technique.id);
    }
}

#[test]
fn test_missing_export_is_fatal() {
    let device = SoftwareDevice::new();
    let scene = demo::demo_scene().unwrap();
    let library = ProgramLibrary::new(
        "no_reflections",
        b"PrimaryRayGen\nScreenSpaceReflectionRayGen\nShadowRayGen\n\
          PrimaryClosestHit\nDiffuseClosestHit\nShadowClosestHit\n\
          AlphaTestAnyHit\nPrimaryMiss\nShadowMiss\n"
            .to_vec(),
    );
    let err = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &library).unwrap_err();
    match &err {
        Error::MissingExport { technique, export } => {
            assert_eq!(*technique, "ReflectionHit");
            assert_eq!(export, "ReflectionClosestHit");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Construction);
}

#[test]
fn test_allocation_failure_aborts_startup() {
    let device = SoftwareDevice::with_caps(DeviceCaps {
        memory_budget: 16 * 1024,
        ..DeviceCaps::default()
    });
    let scene = demo::grid_scene(37).unwrap();
    let err = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::OutOfMemory { .. })));
    assert_eq!(err.kind(), ErrorKind::Construction);
}

#[test]
fn test_empty_geometry_rejected() {
    let device = SoftwareDevice::new();
    let mut scene = demo::demo_scene().unwrap();
    scene.meshes[1].indices.clear();
    scene.meshes[1].vertices.clear();
    let err = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap_err();
    assert!(matches!(err, Error::EmptyGeometry { id: 1 }));
    assert_eq!(err.kind(), ErrorKind::Construction);
}

#[test]
fn test_raster_only_device_falls_back() {
    let device = SoftwareDevice::without_ray_queries();
    assert!(!supports_ray_queries(&device));
    let scene = demo::demo_scene().unwrap();
    let subsystem = probe_and_initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();
    assert!(subsystem.is_none());
}
