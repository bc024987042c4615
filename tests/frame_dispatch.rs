//! Per-frame dispatch through the software device

use hybrid_rt::device::software::{builtin_library, SoftwareDevice};
use hybrid_rt::device::{DeviceError, RayDevice, ResourceState, TextureDesc, TextureFormat};
use hybrid_rt::frame::{frame_constants, FrameOutcome, FrameTargets};
use hybrid_rt::prelude::*;
use hybrid_rt::scene::demo::DemoScene;
use hybrid_rt::technique::stack_size_budget;

const SIZE: (u32, u32) = (48, 32);

struct Harness {
    device: SoftwareDevice,
    scene: DemoScene,
    dispatcher: FrameDispatcher,
    targets: FrameTargets,
}

fn target(device: &SoftwareDevice, label: &str, size: (u32, u32), format: TextureFormat, state: ResourceState) -> hybrid_rt::device::TextureId {
    device
        .create_texture(&TextureDesc::new(label, size.0, size.1, format, state))
        .unwrap()
}

fn harness(device: SoftwareDevice) -> Harness {
    harness_built_at(device, SIZE)
}

/// Targets are always `SIZE`; the dispatcher is constructed for `initial`.
fn harness_built_at(device: SoftwareDevice, initial: (u32, u32)) -> Harness {
    let scene = demo::demo_scene().unwrap();
    let subsystem = probe_and_initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap();
    let dispatcher = FrameDispatcher::new(&device, subsystem, initial).unwrap();
    let targets = FrameTargets {
        color: target(&device, "color", SIZE, TextureFormat::Rgba32Float, ResourceState::RenderTarget),
        depth: target(&device, "depth", SIZE, TextureFormat::R32Float, ResourceState::DepthWrite),
        normal: target(&device, "normal", SIZE, TextureFormat::Rgba32Float, ResourceState::RenderTarget),
        shadow_map: target(&device, "shadow", (256, 256), TextureFormat::R32Float, ResourceState::DepthWrite),
    };
    Harness {
        device,
        scene,
        dispatcher,
        targets,
    }
}

fn settings(mode: Mode) -> RenderSettings {
    RenderSettings {
        mode,
        width: SIZE.0,
        height: SIZE.1,
        ..RenderSettings::default()
    }
}

impl Harness {
    /// Raster stand-ins, ray dispatch, rebind, submit.
    fn frame(&mut self, settings: &RenderSettings) -> Result<FrameOutcome> {
        if let Some(subsystem) = self.dispatcher.subsystem() {
            let raster = subsystem.raster_scene();
            let camera = self.scene.cameras.get(settings.camera_index)?;
            let mut state = *self.dispatcher.state();
            state.camera_index = settings.camera_index;
            state.resolution = self.targets.extent(&self.device)?;
            let constants = frame_constants(camera, &state);
            self.device
                .reference_prepass(&constants, &raster, self.targets.depth, self.targets.normal)?;
            self.device.reference_shadow_pass(
                settings.light_view_proj(subsystem.geometry()),
                &raster,
                self.targets.shadow_map,
            )?;
        }
        let mut list = CommandList::new(QueueKind::Graphics, "frame");
        let outcome = self
            .dispatcher
            .dispatch(&self.device, &mut list, settings, &self.scene.cameras, &self.targets)?;
        if outcome.technique.is_some() {
            assert!(list.needs_rebind());
            let heap = self.dispatcher.subsystem().unwrap().materials().heap;
            list.set_descriptor_heap(heap);
        }
        self.device.submit(list)?;
        Ok(outcome)
    }

    fn color(&self) -> Vec<[f32; 4]> {
        self.device.read_texture(self.targets.color).unwrap()
    }

    fn render(&mut self, settings: &RenderSettings) -> Vec<[f32; 4]> {
        self.frame(settings).unwrap();
        self.color()
    }
}

#[test]
fn test_traversal_is_deterministic() {
    let mut h = harness(SoftwareDevice::new());
    let first = h.render(&settings(Mode::Traversal));
    let second = h.render(&settings(Mode::Traversal));
    assert_eq!(first, second);
    assert!(first.iter().any(|t| t[0] > 0.0));
}

#[test]
fn test_every_mode_dispatches() {
    let mut h = harness(SoftwareDevice::new());
    for mode in Mode::ALL {
        let outcome = h.frame(&settings(mode)).unwrap();
        assert_eq!(outcome.mode, mode);
        assert_eq!(outcome.technique, mode.route().technique);
    }
    // Targets are back in their raster states
    let state = |t: hybrid_rt::device::TextureId| h.device.resource_state(t.into()).unwrap();
    assert_eq!(state(h.targets.color), ResourceState::RenderTarget);
    assert_eq!(state(h.targets.depth), ResourceState::DepthWrite);
    assert_eq!(state(h.targets.normal), ResourceState::RenderTarget);
    assert_eq!(state(h.targets.shadow_map), ResourceState::DepthWrite);
}

#[test]
fn test_modes_are_repeatable_across_switches() {
    let mut h = harness(SoftwareDevice::new());
    let diffuse = h.render(&settings(Mode::DiffuseShadowRays));
    h.render(&settings(Mode::Reflections));
    h.render(&settings(Mode::Shadows));
    assert_eq!(h.render(&settings(Mode::DiffuseShadowRays)), diffuse);
}

#[test]
fn test_parity_flips_every_frame() {
    let mut h = harness(SoftwareDevice::new());
    let parities: Vec<u32> = (0..4)
        .map(|_| h.frame(&settings(Mode::Traversal)).unwrap().parity)
        .collect();
    assert_eq!(parities, vec![0, 1, 0, 1]);
}

#[test]
fn test_temporal_reenable_matches_single_frame() {
    let mut h = harness(SoftwareDevice::new());
    let plain = settings(Mode::Traversal);
    let temporal = RenderSettings {
        temporal_aa: true,
        ..plain.clone()
    };
    let single = h.render(&plain);

    let outcome = h.frame(&temporal).unwrap();
    assert_eq!(outcome.blend_weight, Some(1.0));
    assert_eq!(h.color(), single);
    let outcome = h.frame(&temporal).unwrap();
    assert_eq!(outcome.blend_weight, Some(0.5));

    // Off, then on again: the first resolve must not see stale history
    h.render(&plain);
    let outcome = h.frame(&temporal).unwrap();
    assert_eq!(outcome.blend_weight, Some(1.0));
    assert_eq!(h.color(), single);
}

#[test]
fn test_reset_clears_history() {
    let mut h = harness(SoftwareDevice::new());
    let temporal = RenderSettings {
        temporal_aa: true,
        ..settings(Mode::Traversal)
    };
    h.frame(&temporal).unwrap();
    h.frame(&temporal).unwrap();
    let reset = RenderSettings {
        reset_history: true,
        ..temporal.clone()
    };
    let outcome = h.frame(&reset).unwrap();
    assert_eq!(outcome.blend_weight, Some(1.0));
    assert_eq!(h.dispatcher.history().unwrap().accumulated(), 1);
}

#[test]
fn test_off_mode_leaves_color_untouched() {
    let mut h = harness(SoftwareDevice::new());
    let outcome = h.frame(&settings(Mode::Off)).unwrap();
    assert_eq!(outcome.technique, None);
    assert!(h.color().iter().all(|t| *t == [0.0; 4]));
}

#[test]
fn test_raster_only_device_forces_off() {
    let mut h = harness(SoftwareDevice::without_ray_queries());
    assert!(!h.dispatcher.ray_path_available());
    for mode in [Mode::Traversal, Mode::Reflections, Mode::DiffuseShadowRays] {
        let outcome = h.frame(&settings(mode)).unwrap();
        assert_eq!(outcome.mode, Mode::Off);
        assert_eq!(outcome.technique, None);
    }
    assert_eq!(h.dispatcher.state().mode, Mode::Off);
}

#[test]
fn test_shadow_rays_need_explicit_stack_budget() {
    let mut h = harness(SoftwareDevice::new());
    let technique = h
        .dispatcher
        .subsystem()
        .unwrap()
        .techniques()
        .get(TechniqueId::DiffuseHit)
        .clone();
    let programs = technique.programs();
    let size = |export: &str| h.device.program_stack_size(technique.pipeline, export).unwrap();
    let single_level = stack_size_budget(
        size(programs.ray_generation),
        size(programs.closest_hit),
        size(programs.any_hit),
        size(programs.miss),
        1,
    );

    // Shadow-map shading never recurses, so one level is enough
    h.device.set_pipeline_stack_size(technique.pipeline, single_level).unwrap();
    h.frame(&settings(Mode::DiffuseShadowMaps)).unwrap();

    let err = h.frame(&settings(Mode::DiffuseShadowRays)).unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::StackOverflow { .. })));
    assert_eq!(err.kind(), ErrorKind::Device);
}

#[test]
fn test_bad_camera_index() {
    let mut h = harness(SoftwareDevice::new());
    let settings = RenderSettings {
        camera_index: 9,
        ..settings(Mode::Traversal)
    };
    let err = h.frame(&settings).unwrap_err();
    assert!(matches!(err, Error::CameraOutOfBounds { index: 9, .. }));
}

#[test]
fn test_device_loss_is_reported() {
    let mut h = harness(SoftwareDevice::new());
    h.render(&settings(Mode::Traversal));
    h.device.simulate_device_loss("hang");
    let mut list = CommandList::new(QueueKind::Graphics, "frame");
    h.dispatcher
        .dispatch(&h.device, &mut list, &settings(Mode::Traversal), &h.scene.cameras, &h.targets)
        .unwrap();
    let err = h.device.submit(list).unwrap_err();
    assert!(matches!(err, DeviceError::DeviceLost(_)));
}

#[test]
fn test_dispatch_follows_color_target_extent() {
    let reference = harness(SoftwareDevice::new()).render(&settings(Mode::Traversal));

    let mut h = harness_built_at(SoftwareDevice::new(), (16, 16));
    let color = h.render(&settings(Mode::Traversal));
    assert!(color.iter().all(|t| t[3] == 1.0), "every texel is traced");
    assert_eq!(color, reference);
    assert_eq!(h.dispatcher.state().resolution, SIZE);

    // History is reallocated to the target extent before the first resolve
    let temporal = RenderSettings {
        temporal_aa: true,
        ..settings(Mode::Traversal)
    };
    let outcome = h.frame(&temporal).unwrap();
    assert_eq!(outcome.blend_weight, Some(1.0));
    assert_eq!(h.dispatcher.history().unwrap().size(), SIZE);
    assert_eq!(h.color(), reference);
}

#[test]
fn test_mismatched_targets_rejected() {
    let mut h = harness(SoftwareDevice::new());
    h.targets.normal = target(&h.device, "normal", (16, 16), TextureFormat::Rgba32Float, ResourceState::RenderTarget);
    let mut list = CommandList::new(QueueKind::Graphics, "frame");
    let err = h
        .dispatcher
        .dispatch(&h.device, &mut list, &settings(Mode::Traversal), &h.scene.cameras, &h.targets)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TargetSize {
            target: "normal",
            expected: SIZE,
            actual: (16, 16),
        }
    ));
    assert!(list.is_empty());
}

#[test]
fn test_raster_only_device_ignores_camera_index() {
    let mut h = harness(SoftwareDevice::without_ray_queries());
    let settings = RenderSettings {
        camera_index: 9,
        ..settings(Mode::Reflections)
    };
    let outcome = h.frame(&settings).unwrap();
    assert_eq!(outcome.mode, Mode::Off);
}
