//! Handles and descriptors for device objects.

use bytemuck::{Pod, Zeroable};

use super::PROGRAM_IDENTIFIER_SIZE;
use crate::util::{affine_to_rows, Affine3A};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Raw slot index.
            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// Device buffer.
    BufferId
);
handle!(
    /// Device 2D texture.
    TextureId
);
handle!(
    /// Compiled ray pipeline.
    PipelineId
);
handle!(
    /// Loaded program library.
    LibraryId
);
handle!(
    /// Shader-visible descriptor heap.
    HeapId
);

/// Any resource that carries a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
}

impl From<BufferId> for ResourceId {
    fn from(id: BufferId) -> Self {
        Self::Buffer(id)
    }
}

impl From<TextureId> for ResourceId {
    fn from(id: TextureId) -> Self {
        Self::Texture(id)
    }
}

/// Usage state of a resource. Transitions are explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    GenericRead,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    AccelerationStructure,
}

/// 64-bit device virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct GpuAddress(pub u64);

/// Buffer memory class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// CPU-writable, permanently `GenericRead`.
    Upload,
    /// Device-local, starts `Common`.
    Default,
    /// Acceleration structure storage, permanently `AccelerationStructure`.
    AccelerationStructure,
    /// Build scratch, permanently `UnorderedAccess`.
    Scratch,
}

impl BufferKind {
    /// State a new buffer of this kind starts in.
    pub fn initial_state(self) -> ResourceState {
        match self {
            Self::Upload => ResourceState::GenericRead,
            Self::Default => ResourceState::Common,
            Self::AccelerationStructure => ResourceState::AccelerationStructure,
            Self::Scratch => ResourceState::UnorderedAccess,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub kind: BufferKind,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, kind: BufferKind) -> Self {
        Self {
            label: label.into(),
            size,
            kind,
        }
    }
}

/// Texel formats. All are sampled as four floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba32Float,
    Rgba16Float,
    R32Float,
}

impl TextureFormat {
    /// Bytes per texel.
    pub fn texel_size(self) -> u64 {
        match self {
            Self::Rgba32Float => 16,
            Self::Rgba16Float => 8,
            Self::R32Float => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub initial_state: ResourceState,
}

impl TextureDesc {
    pub fn new(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: TextureFormat,
        initial_state: ResourceState,
    ) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
            initial_state,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.texel_size()
    }
}

/// Opaque program identifier copied into records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct ProgramIdentifier(pub [u8; PROGRAM_IDENTIFIER_SIZE]);

impl std::fmt::Debug for ProgramIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgramIdentifier(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Compiled program binary supplied by the shader build. Opaque to the subsystem.
#[derive(Debug, Clone)]
pub struct ProgramLibrary {
    pub label: String,
    pub bytecode: Vec<u8>,
}

impl ProgramLibrary {
    pub fn new(label: impl Into<String>, bytecode: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            bytecode,
        }
    }
}

/// One triangle geometry of a bottom-level build (32-bit float positions
/// at vertex offset 0, 32-bit indices).
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleGeometryDesc {
    pub vertex_buffer: BufferId,
    pub vertex_offset: u64,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub index_buffer: BufferId,
    pub index_offset: u64,
    pub index_count: u32,
    /// Opaque geometry never invokes any-hit programs.
    pub opaque: bool,
}

/// Inputs for an acceleration structure size query.
#[derive(Debug, Clone, Copy)]
pub enum AccelInputs<'a> {
    BottomLevel(&'a [TriangleGeometryDesc]),
    TopLevel { instance_count: u32 },
}

/// Size requirements reported before allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// Top-level instance descriptor (64 bytes, hardware layout).
///
/// `id_and_mask`: low 24 bits instance id, high 8 bits mask.
/// `offset_and_flags`: low 24 bits hit-group index offset, high 8 bits flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    pub id_and_mask: u32,
    pub offset_and_flags: u32,
    pub bottom_level: GpuAddress,
}

impl InstanceDesc {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(
        transform: &Affine3A,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        bottom_level: GpuAddress,
    ) -> Self {
        debug_assert!(instance_id < (1 << 24));
        debug_assert!(hit_group_offset < (1 << 24));
        Self {
            transform: affine_to_rows(transform),
            id_and_mask: (instance_id & 0x00ff_ffff) | ((mask as u32) << 24),
            offset_and_flags: hit_group_offset & 0x00ff_ffff,
            bottom_level,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.offset_and_flags & 0x00ff_ffff
    }
}

/// Descriptor range class inside a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeKind {
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: RangeKind,
    pub base_register: u32,
    pub count: u32,
}

/// One parameter of a binding layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingParam {
    ConstantBuffer { register: u32 },
    ShaderResource { register: u32 },
    UnorderedAccess { register: u32 },
    DescriptorTable { ranges: Vec<DescriptorRange> },
    Constants { register: u32, count: u32 },
}

impl BindingParam {
    /// Cost in 32-bit words of the parameter space.
    pub fn cost_words(&self) -> u32 {
        match self {
            Self::DescriptorTable { .. } => 1,
            Self::ConstantBuffer { .. } | Self::ShaderResource { .. } | Self::UnorderedAccess { .. } => 2,
            Self::Constants { count, .. } => *count,
        }
    }

    /// Bytes this parameter occupies inside a record.
    pub fn record_size(&self) -> u64 {
        match self {
            Self::Constants { count, .. } => 4 * *count as u64,
            _ => 8,
        }
    }

    /// Alignment of this parameter inside a record.
    pub fn record_alignment(&self) -> u64 {
        match self {
            Self::Constants { .. } => 4,
            _ => 8,
        }
    }
}

/// Parameter binding layout. Global layouts are shared by every dispatch,
/// local layouts describe the arguments stored in each record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    pub name: &'static str,
    pub local: bool,
    pub params: Vec<BindingParam>,
}

/// Layout after device-side serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedLayout {
    pub layout: BindingLayout,
    pub bytes: Vec<u8>,
}

/// Closest-hit + any-hit pairing.
#[derive(Debug, Clone, Copy)]
pub struct HitGroupDesc<'a> {
    pub name: &'a str,
    pub closest_hit: &'a str,
    pub any_hit: &'a str,
}

/// Everything needed to compile one ray pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub label: &'a str,
    pub library: LibraryId,
    pub ray_generation: &'a str,
    pub miss: &'a str,
    pub hit_group: HitGroupDesc<'a>,
    pub max_recursion: u32,
    pub payload_size: u32,
    pub attribute_size: u32,
    pub global_layout: &'a SerializedLayout,
    pub local_layout: &'a SerializedLayout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Vec3;

    #[test]
    fn test_instance_desc_packing() {
        assert_eq!(InstanceDesc::SIZE, 64);
        let t = Affine3A::from_translation(Vec3::X);
        let d = InstanceDesc::new(&t, 5, 1, 17, GpuAddress(0x1000));
        assert_eq!(d.instance_id(), 5);
        assert_eq!(d.mask(), 1);
        assert_eq!(d.hit_group_offset(), 17);
        assert_eq!(d.bottom_level, GpuAddress(0x1000));
    }

    #[test]
    fn test_param_record_sizes() {
        let table = BindingParam::DescriptorTable { ranges: vec![] };
        assert_eq!(table.record_size(), 8);
        assert_eq!(table.record_alignment(), 8);
        let consts = BindingParam::Constants { register: 0, count: 1 };
        assert_eq!(consts.record_size(), 4);
        assert_eq!(consts.cost_words(), 1);
    }
}
