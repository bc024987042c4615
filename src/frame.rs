//! Per-frame mode selection and ray dispatch.
//!
//! Every mode maps through one lookup table to a technique plus the hit
//! shading flags it needs. The dispatcher records constants, transitions,
//! bindings and the dispatch into the caller's command list; the caller
//! submits it and must rebind descriptor state before further raster work.

use serde::{Deserialize, Serialize};

use crate::abi::{FrameConstants, HitConstants};
use crate::device::{
    BufferDesc, BufferId, BufferKind, CommandList, DispatchRaysDesc, GlobalBindings, RayDevice,
    ResourceState, TextureId,
};
use crate::history::HistoryBufferManager;
use crate::scene::{CameraSet, CameraView};
use crate::settings::RenderSettings;
use crate::subsystem::RaySubsystem;
use crate::technique::TechniqueId;
use crate::util::{Error, Result};

/// Per-frame ray path selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Raster passes only
    #[default]
    Off,
    Traversal,
    ScreenSpaceReflection,
    Shadows,
    DiffuseShadowMaps,
    DiffuseShadowRays,
    Reflections,
}

/// What a mode dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRoute {
    pub technique: Option<TechniqueId>,
    /// Reflective materials trace reflection rays
    pub reflections: bool,
    /// Diffuse shading traces shadow rays instead of sampling the shadow map
    pub shadow_rays: bool,
}

const fn route(technique: Option<TechniqueId>, reflections: bool, shadow_rays: bool) -> ModeRoute {
    ModeRoute {
        technique,
        reflections,
        shadow_rays,
    }
}

const ROUTES: [ModeRoute; 7] = [
    route(None, false, false),
    route(Some(TechniqueId::Traversal), false, false),
    route(Some(TechniqueId::ScreenSpaceReflectionTraversal), true, false),
    route(Some(TechniqueId::ShadowRays), false, false),
    route(Some(TechniqueId::DiffuseHit), false, false),
    route(Some(TechniqueId::DiffuseHit), false, true),
    route(Some(TechniqueId::ReflectionHit), true, false),
];

impl Mode {
    pub const ALL: [Mode; 7] = [
        Self::Off,
        Self::Traversal,
        Self::ScreenSpaceReflection,
        Self::Shadows,
        Self::DiffuseShadowMaps,
        Self::DiffuseShadowRays,
        Self::Reflections,
    ];

    pub fn route(self) -> ModeRoute {
        ROUTES[self as usize]
    }

    /// Command-line name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Traversal => "traversal",
            Self::ScreenSpaceReflection => "ssr",
            Self::Shadows => "shadows",
            Self::DiffuseShadowMaps => "diffuse-shadow-maps",
            Self::DiffuseShadowRays => "diffuse-shadow-rays",
            Self::Reflections => "reflections",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s) || format!("{:?}", m).eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown mode `{}`", s))
    }
}

/// Frame-to-frame state. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    pub mode: Mode,
    pub camera_index: usize,
    pub resolution: (u32, u32),
    /// Selects the history buffer read this frame.
    pub parity: u32,
    pub frame: u64,
}

impl FrameState {
    pub fn new(resolution: (u32, u32)) -> Self {
        Self {
            mode: Mode::Off,
            camera_index: 0,
            resolution,
            parity: 0,
            frame: 0,
        }
    }

    fn advance(&mut self) {
        self.parity ^= 1;
        self.frame += 1;
    }
}

/// Render targets of one frame, in their raster-pass states.
///
/// `color` is a `RenderTarget`, `depth` and `shadow_map` are `DepthWrite`,
/// `normal` is a `RenderTarget`. All are returned in those states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTargets {
    pub color: TextureId,
    pub depth: TextureId,
    pub normal: TextureId,
    pub shadow_map: TextureId,
}

impl FrameTargets {
    /// Extent of the color target. Depth and normal must match it; the
    /// shadow map has its own resolution.
    pub fn extent(&self, device: &dyn RayDevice) -> Result<(u32, u32)> {
        let size = |texture: TextureId| -> Result<(u32, u32)> {
            let desc = device.texture_desc(texture)?;
            Ok((desc.width, desc.height))
        };
        let color = size(self.color)?;
        for (target, texture) in [("depth", self.depth), ("normal", self.normal)] {
            let actual = size(texture)?;
            if actual != color {
                return Err(Error::TargetSize {
                    target,
                    expected: color,
                    actual,
                });
            }
        }
        Ok(color)
    }
}

/// What a dispatch call recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOutcome {
    pub mode: Mode,
    pub technique: Option<TechniqueId>,
    pub parity: u32,
    /// Temporal blend weight, when accumulation ran.
    pub blend_weight: Option<f32>,
}

/// Camera constants of one frame.
pub fn frame_constants(camera: &CameraView, state: &FrameState) -> FrameConstants {
    let (width, height) = state.resolution;
    let matrices = camera.matrices(width as f32 / height.max(1) as f32);
    FrameConstants {
        camera_to_world: matrices.inverse_view_proj.to_cols_array_2d(),
        view_proj: matrices.view_proj.to_cols_array_2d(),
        camera_position: matrices.position.extend(1.0).to_array(),
        resolution: [width, height],
        camera_index: state.camera_index as u32,
        frame_parity: state.parity,
    }
}

/// Built subsystem plus the per-frame buffers it needs.
#[derive(Debug)]
struct RayPath {
    subsystem: RaySubsystem,
    frame_constants: BufferId,
    hit_constants: BufferId,
    history: HistoryBufferManager,
}

impl RayPath {
    /// Reallocate the history pair when the target extent changed.
    fn resize(&mut self, device: &dyn RayDevice, resolution: (u32, u32)) -> Result<()> {
        if self.history.size() == resolution {
            return Ok(());
        }
        tracing::debug!(from = ?self.history.size(), to = ?resolution, "history reallocated");
        self.history = HistoryBufferManager::new(device, resolution.0, resolution.1)?;
        Ok(())
    }

    fn record(
        &mut self,
        list: &mut CommandList,
        state: &FrameState,
        settings: &RenderSettings,
        camera: &CameraView,
        technique: TechniqueId,
        targets: &FrameTargets,
    ) -> Option<f32> {
        let (width, height) = state.resolution;
        let frame = frame_constants(camera, state);
        let light = settings.light_view_proj(self.subsystem.geometry());
        let hit: HitConstants = settings.hit_constants(state.mode, light);
        list.write_buffer(self.frame_constants, 0, &frame);
        list.write_buffer(self.hit_constants, 0, &hit);

        self.history.set_min_blend(settings.min_blend);
        self.history.update(settings.temporal_aa, settings.reset_history);
        let temporal = self.history.is_enabled();
        let output = if temporal {
            self.history.current()
        } else {
            targets.color
        };

        use ResourceState::*;
        if !temporal {
            list.transition(targets.color, RenderTarget, UnorderedAccess);
        }
        list.transition(targets.depth, DepthWrite, ShaderResource);
        list.transition(targets.normal, RenderTarget, ShaderResource);
        list.transition(targets.shadow_map, DepthWrite, ShaderResource);

        let subsystem = &self.subsystem;
        let compiled = subsystem.techniques().get(technique);
        let geometry = subsystem.geometry();
        list.set_descriptor_heap(subsystem.materials().heap);
        list.set_pipeline(compiled.pipeline);
        list.set_global_bindings(GlobalBindings {
            hit_constants: self.hit_constants,
            frame_constants: self.frame_constants,
            geometry_info: geometry.geometry_info,
            materials: subsystem.materials().materials,
            vertex_buffer: geometry.vertex_buffer,
            index_buffer: geometry.index_buffer,
            top_level: subsystem.index().top_level(),
            output,
            depth: targets.depth,
            normal: targets.normal,
            shadow_map: targets.shadow_map,
        });
        list.dispatch_rays(DispatchRaysDesc {
            ray_generation: compiled.ray_generation,
            miss: compiled.miss,
            hit_groups: subsystem.records().get(technique).view(),
            width,
            height,
            depth: 1,
        });

        let weight = temporal.then(|| {
            list.transition(output, UnorderedAccess, ShaderResource);
            list.transition(targets.color, RenderTarget, UnorderedAccess);
            let weight = self.history.record_resolve(list, state.parity, output, targets.color);
            list.transition(output, ShaderResource, UnorderedAccess);
            weight
        });

        list.transition(targets.color, UnorderedAccess, RenderTarget);
        list.transition(targets.depth, ShaderResource, DepthWrite);
        list.transition(targets.normal, ShaderResource, RenderTarget);
        list.transition(targets.shadow_map, ShaderResource, DepthWrite);
        weight
    }
}

/// Orchestrates the ray path every frame.
#[derive(Debug)]
pub struct FrameDispatcher {
    ray: Option<RayPath>,
    state: FrameState,
}

impl FrameDispatcher {
    /// `subsystem` is `None` when the startup probe found no ray-query
    /// support; every frame then runs as [`Mode::Off`]. `resolution` sizes the
    /// initial history pair; each dispatch follows the color target's extent.
    pub fn new(device: &dyn RayDevice, subsystem: Option<RaySubsystem>, resolution: (u32, u32)) -> Result<Self> {
        let ray = match subsystem {
            Some(subsystem) => {
                let constants = |label: &str, size: usize| {
                    device.create_buffer(&BufferDesc::new(label, size as u64, BufferKind::Upload))
                };
                Some(RayPath {
                    frame_constants: constants("frame_constants", std::mem::size_of::<FrameConstants>())?,
                    hit_constants: constants("hit_constants", std::mem::size_of::<HitConstants>())?,
                    history: HistoryBufferManager::new(device, resolution.0, resolution.1)?,
                    subsystem,
                })
            }
            None => {
                tracing::warn!("ray path unavailable, every frame runs raster only");
                None
            }
        };
        Ok(Self {
            ray,
            state: FrameState::new(resolution),
        })
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    pub fn ray_path_available(&self) -> bool {
        self.ray.is_some()
    }

    pub fn subsystem(&self) -> Option<&RaySubsystem> {
        self.ray.as_ref().map(|r| &r.subsystem)
    }

    pub fn history(&self) -> Option<&HistoryBufferManager> {
        self.ray.as_ref().map(|r| &r.history)
    }

    /// Mode a request actually runs in.
    pub fn effective_mode(&self, requested: Mode) -> Mode {
        if self.ray.is_some() {
            requested
        } else {
            Mode::Off
        }
    }

    /// Record one frame of ray work into `list` and advance the parity.
    ///
    /// The dispatch covers the color target's full extent. On return `list`
    /// needs a descriptor heap rebind before raster draws whenever a dispatch
    /// was recorded.
    pub fn dispatch(
        &mut self,
        device: &dyn RayDevice,
        list: &mut CommandList,
        settings: &RenderSettings,
        cameras: &CameraSet,
        targets: &FrameTargets,
    ) -> Result<FrameOutcome> {
        let mode = self.effective_mode(settings.mode);
        self.state.mode = mode;
        self.state.camera_index = settings.camera_index;
        let parity = self.state.parity;
        let technique = mode.route().technique;

        let blend_weight = match (self.ray.as_mut(), technique) {
            (Some(ray), Some(technique)) => {
                let camera = cameras.get(settings.camera_index)?;
                let resolution = targets.extent(device)?;
                ray.resize(device, resolution)?;
                self.state.resolution = resolution;
                ray.record(list, &self.state, settings, camera, technique, targets)
            }
            (Some(ray), None) => {
                ray.history.update(false, false);
                None
            }
            (None, _) => None,
        };
        tracing::trace!(frame = self.state.frame, %mode, parity, "frame recorded");
        self.state.advance();

        Ok(FrameOutcome {
            mode,
            technique,
            parity,
            blend_weight,
        })
    }
}
