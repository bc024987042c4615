//! Backend seam.
//!
//! Every GPU-facing operation of the subsystem goes through [`RayDevice`].
//! Startup objects are created directly on the device; per-frame work is
//! recorded into a [`CommandList`] and submitted to a queue.
//!
//! [`software::SoftwareDevice`] is a deterministic CPU implementation used by
//! the CLI and the tests.

mod caps;
mod command;
mod error;
mod resource;
pub mod software;

#[cfg(feature = "gpu")]
pub mod wgpu_probe;

pub use caps::*;
pub use command::*;
pub use error::*;
pub use resource::*;

/// Ray-tracing capable device.
pub trait RayDevice: Send + Sync {
    /// Limits and features of this device.
    fn caps(&self) -> &DeviceCaps;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, DeviceError>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, DeviceError>;
    fn buffer_address(&self, buffer: BufferId) -> Result<GpuAddress, DeviceError>;
    fn buffer_size(&self, buffer: BufferId) -> Result<u64, DeviceError>;

    /// Immediate upload, for startup data.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    /// Immediate readback.
    fn read_buffer(&self, buffer: BufferId) -> Result<Vec<u8>, DeviceError>;
    fn write_texture(&self, texture: TextureId, texels: &[[f32; 4]]) -> Result<(), DeviceError>;
    fn read_texture(&self, texture: TextureId) -> Result<Vec<[f32; 4]>, DeviceError>;
    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc, DeviceError>;
    /// Current state of a resource.
    fn resource_state(&self, resource: ResourceId) -> Result<ResourceState, DeviceError>;

    fn create_descriptor_heap(&self, capacity: u32) -> Result<HeapId, DeviceError>;
    fn write_descriptor(&self, heap: HeapId, index: u32, texture: TextureId) -> Result<(), DeviceError>;
    /// Shader-visible address of a heap slot.
    fn descriptor_handle(&self, heap: HeapId, index: u32) -> Result<GpuAddress, DeviceError>;

    /// Size requirements of an acceleration structure build.
    fn prebuild_info(&self, inputs: &AccelInputs<'_>) -> PrebuildInfo;

    fn serialize_layout(&self, layout: &BindingLayout) -> Result<SerializedLayout, DeviceError>;
    fn load_library(&self, library: &ProgramLibrary) -> Result<LibraryId, DeviceError>;
    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<PipelineId, DeviceError>;
    /// Identifier of an export (or hit group) of a compiled pipeline.
    fn program_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ProgramIdentifier>;
    /// Stack bytes an export needs.
    fn program_stack_size(&self, pipeline: PipelineId, export: &str) -> Option<u64>;
    fn pipeline_stack_size(&self, pipeline: PipelineId) -> Option<u64>;
    fn set_pipeline_stack_size(&self, pipeline: PipelineId, bytes: u64) -> Result<(), DeviceError>;

    /// Execute a command list on its queue.
    fn submit(&self, list: CommandList) -> Result<SubmissionId, DeviceError>;
}
