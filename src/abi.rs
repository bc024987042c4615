//! Shader-visible structures.
//!
//! Layouts shared by host uploads and the programs that read them. All are
//! `#[repr(C)]` with explicit padding to 16-byte rows.

use bytemuck::{Pod, Zeroable};

/// Material flag: traces reflection rays.
pub const MATERIAL_REFLECTIVE: u32 = 1 << 0;
/// Material flag: alpha-tested, geometry built non-opaque.
pub const MATERIAL_CUTOUT: u32 = 1 << 1;

/// Heap slots per material: diffuse, specular, normal. A material's
/// descriptors start at `slot * DESCRIPTORS_PER_MATERIAL`.
pub const DESCRIPTORS_PER_MATERIAL: u32 = 3;

/// Interleaved scene vertex (32 bytes). Object strides may be larger;
/// attributes always sit at these offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl SceneVertex {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
    pub const NORMAL_OFFSET: u64 = 12;
    pub const UV_OFFSET: u64 = 24;
}

/// Per-frame camera constants (uploaded every frame).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    /// Inverse view-projection (clip to world).
    pub camera_to_world: [[f32; 4]; 4],
    /// View-projection (world to clip).
    pub view_proj: [[f32; 4]; 4],
    /// xyz = world position, w unused.
    pub camera_position: [f32; 4],
    /// Target width, height.
    pub resolution: [u32; 2],
    pub camera_index: u32,
    pub frame_parity: u32,
}

/// Hit-shading constants: sun, ambient, shadow parameters, technique flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HitConstants {
    /// xyz = direction light travels (normalized).
    pub sun_direction: [f32; 4],
    /// rgb = color * intensity.
    pub sun_color: [f32; 4],
    /// rgb = ambient color * intensity.
    pub ambient: [f32; 4],
    /// World to shadow-map clip space.
    pub light_view_proj: [[f32; 4]; 4],
    /// x = depth bias, y = ray origin offset, zw unused.
    pub shadow_params: [f32; 4],
    /// Nonzero: reflective materials trace reflection rays.
    pub reflections: u32,
    /// Nonzero: diffuse shading uses shadow rays instead of the shadow map.
    pub shadow_rays: u32,
    pub _pad: [u32; 2],
}

/// Per-object vertex/index location (indexed by geometry index).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryInfo {
    /// Byte offset of the first vertex in the scene vertex buffer.
    pub vertex_offset: u32,
    pub vertex_stride: u32,
    /// Byte offset of the first index in the scene index buffer.
    pub index_offset: u32,
    pub triangle_count: u32,
    /// Dense material slot.
    pub material_slot: u32,
    pub _pad: [u32; 3],
}

/// Material shading parameters (indexed by the record's material constant).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    pub base_color: [f32; 4],
    /// x = reflectivity, y = alpha cutoff, zw unused.
    pub params: [f32; 4],
    pub flags: u32,
    pub _pad: [u32; 3],
}

impl GpuMaterial {
    pub fn is_reflective(&self) -> bool {
        self.flags & MATERIAL_REFLECTIVE != 0
    }

    pub fn is_cutout(&self) -> bool {
        self.flags & MATERIAL_CUTOUT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<SceneVertex>(), 32);
        assert_eq!(std::mem::size_of::<FrameConstants>() % 16, 0);
        assert_eq!(std::mem::size_of::<HitConstants>() % 16, 0);
        assert_eq!(std::mem::size_of::<GeometryInfo>(), 32);
        assert_eq!(std::mem::size_of::<GpuMaterial>(), 48);
    }
}
