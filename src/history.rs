//! Ping-ponged temporal accumulation buffers.
//!
//! Frame parity `p` reads history `p` and writes history `1 - p`, so a write
//! in frame N is the read in frame N+1. Both buffers stay in
//! `UnorderedAccess` for their whole life.

use crate::device::{
    Command, CommandList, RayDevice, ResourceState, TextureDesc, TextureFormat, TextureId,
};
use crate::util::Result;

/// Storage format of the history pair.
pub const HISTORY_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Default lower bound of the blend weight.
pub const DEFAULT_MIN_BLEND: f32 = 0.1;

/// Read and write roles for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRoles {
    pub src: TextureId,
    pub dst: TextureId,
}

impl HistoryRoles {
    /// Roles of the following frame.
    pub fn swapped(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Owns the history pair and the unresolved ray output it blends in.
#[derive(Debug, Clone)]
pub struct HistoryBufferManager {
    buffers: [TextureId; 2],
    current: TextureId,
    width: u32,
    height: u32,
    enabled: bool,
    clear_pending: bool,
    accumulated: u32,
    min_blend: f32,
}

impl HistoryBufferManager {
    pub fn new(device: &dyn RayDevice, width: u32, height: u32) -> Result<Self> {
        let history = |label: &str| {
            device.create_texture(&TextureDesc::new(
                label,
                width,
                height,
                HISTORY_FORMAT,
                ResourceState::UnorderedAccess,
            ))
        };
        let buffers = [history("history_0")?, history("history_1")?];
        // Full precision, so a weight of one reproduces the ray output exactly
        let current = device.create_texture(&TextureDesc::new(
            "ray_current",
            width,
            height,
            TextureFormat::Rgba32Float,
            ResourceState::UnorderedAccess,
        ))?;
        Ok(Self {
            buffers,
            current,
            width,
            height,
            enabled: false,
            clear_pending: true,
            accumulated: 0,
            min_blend: DEFAULT_MIN_BLEND,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn buffers(&self) -> [TextureId; 2] {
        self.buffers
    }

    /// Ray output target while accumulation is enabled. Rests in `UnorderedAccess`.
    pub fn current(&self) -> TextureId {
        self.current
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the next resolve starts by clearing both buffers.
    pub fn clear_pending(&self) -> bool {
        self.clear_pending
    }

    /// Frames blended since the last clear.
    pub fn accumulated(&self) -> u32 {
        self.accumulated
    }

    pub fn set_min_blend(&mut self, min_blend: f32) {
        self.min_blend = min_blend.clamp(0.0, 1.0);
    }

    /// `src = parity`, `dst = 1 - parity`.
    pub fn roles(&self, parity: u32) -> HistoryRoles {
        let p = (parity & 1) as usize;
        HistoryRoles {
            src: self.buffers[p],
            dst: self.buffers[1 - p],
        }
    }

    /// Apply this frame's accumulation settings. Turning accumulation on, or
    /// a reset request while on, schedules a clear before the next blend.
    pub fn update(&mut self, enabled: bool, reset: bool) {
        if enabled && (!self.enabled || reset) {
            tracing::debug!(reenabled = !self.enabled, reset, "history clear scheduled");
            self.clear_pending = true;
        }
        self.enabled = enabled;
    }

    /// Record a zero clear of both buffers.
    pub fn clear_all(&mut self, list: &mut CommandList) {
        for buffer in self.buffers {
            list.clear_texture(buffer, [0.0; 4]);
            list.uav_barrier(Some(buffer.into()));
        }
        self.clear_pending = false;
        self.accumulated = 0;
    }

    /// Weight of the current frame in the next blend.
    pub fn blend_weight(&self) -> f32 {
        if self.accumulated == 0 {
            1.0
        } else {
            (1.0 / (self.accumulated as f32 + 1.0)).max(self.min_blend)
        }
    }

    /// Record `output = dst = current * w + src * (1 - w)`.
    ///
    /// `current` must be `ShaderResource`, `output` `UnorderedAccess`.
    /// Returns the weight used.
    pub fn record_resolve(
        &mut self,
        list: &mut CommandList,
        parity: u32,
        current: TextureId,
        output: TextureId,
    ) -> f32 {
        if self.clear_pending {
            self.clear_all(list);
        }
        let roles = self.roles(parity);
        let weight = self.blend_weight();
        list.push(Command::TemporalBlend {
            current,
            history_src: roles.src,
            history_dst: roles.dst,
            output,
            weight,
        });
        list.uav_barrier(Some(roles.dst.into()));
        list.uav_barrier(Some(output.into()));
        self.accumulated = self.accumulated.saturating_add(1);
        weight
    }
}
