//! Deterministic CPU implementation of [`RayDevice`].
//!
//! Emulates the parts of a ray-tracing GPU the subsystem relies on:
//! explicit resource states, memory fences between dependent writes and
//! reads, a fixed memory budget, acceleration structure builds, compiled
//! pipelines with per-export stack sizes, record tables decoded through the
//! local binding layout, and cross-queue waits. Ray dispatch runs one task
//! per image row on the rayon pool.

mod accel;
mod build;
mod bvh;
mod programs;
mod trace;

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::abi::FrameConstants;
use crate::device::*;
use crate::util::Mat4;

use accel::{AccelStructure, BottomLevel, TopLevel};
use programs::SoftwarePipeline;

pub use programs::{builtin_library, Kernel, Stage};

/// Bytes per descriptor heap slot.
const DESCRIPTOR_SIZE: u64 = 32;
/// Tag bit of descriptor handles; buffers never map this high.
const DESCRIPTOR_HANDLE_TAG: u64 = 1 << 63;
/// Parameter space of a binding layout, in 32-bit words.
const MAX_LAYOUT_WORDS: u32 = 64;
const LAYOUT_MAGIC: &[u8; 4] = b"RTLY";

pub(crate) struct BufferSlot {
    kind: BufferKind,
    data: Vec<u8>,
    state: ResourceState,
}

pub(crate) struct TextureSlot {
    desc: TextureDesc,
    texels: Vec<[f32; 4]>,
    state: ResourceState,
}

impl TextureSlot {
    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.desc.width.saturating_sub(1));
        let y = y.min(self.desc.height.saturating_sub(1));
        self.texels
            .get((y * self.desc.width + x) as usize)
            .copied()
            .unwrap_or([0.0; 4])
    }
}

pub(crate) struct HeapSlot {
    descriptors: Vec<Option<TextureId>>,
}

/// Bindings established by the commands of one submission.
#[derive(Default)]
struct BindState {
    heap: Option<HeapId>,
    pipeline: Option<PipelineId>,
    globals: Option<GlobalBindings>,
}

#[derive(Default)]
struct DeviceState {
    buffers: Vec<BufferSlot>,
    textures: Vec<TextureSlot>,
    heaps: Vec<HeapSlot>,
    libraries: Vec<Vec<(String, Kernel)>>,
    pipelines: Vec<SoftwarePipeline>,
    /// Built acceleration structures by buffer index.
    accels: HashMap<u32, AccelStructure>,
    /// Resources written by a GPU operation and not yet fenced.
    pending: HashSet<ResourceId>,
    allocated: u64,
    graphics_submitted: u64,
    compute_submitted: u64,
    lost: Option<String>,
}

/// Scene resources read by the reference raster passes.
#[derive(Debug, Clone, Copy)]
pub struct RasterScene {
    pub top_level: BufferId,
    pub geometry_info: BufferId,
    pub materials: BufferId,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub descriptors: HeapId,
}

/// CPU ray-tracing device.
pub struct SoftwareDevice {
    caps: DeviceCaps,
    state: Mutex<DeviceState>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn buffer_address(index: usize) -> GpuAddress {
    GpuAddress((index as u64 + 1) << 32)
}

/// Split an address into buffer index and byte offset.
fn decode_address(address: GpuAddress) -> Option<(usize, u64)> {
    let high = address.0 >> 32;
    if high == 0 || address.0 & DESCRIPTOR_HANDLE_TAG != 0 {
        return None;
    }
    Some(((high - 1) as usize, address.0 & 0xffff_ffff))
}

fn descriptor_address(heap: HeapId, index: u32) -> GpuAddress {
    GpuAddress(DESCRIPTOR_HANDLE_TAG | ((heap.0 as u64) << 32) | (index as u64 * DESCRIPTOR_SIZE))
}

/// Split a descriptor handle into heap and slot index.
pub(crate) fn decode_descriptor(handle: u64) -> Option<(HeapId, u32)> {
    if handle & DESCRIPTOR_HANDLE_TAG == 0 {
        return None;
    }
    let heap = ((handle & !DESCRIPTOR_HANDLE_TAG) >> 32) as u32;
    let offset = handle & 0xffff_ffff;
    if offset % DESCRIPTOR_SIZE != 0 {
        return None;
    }
    Some((HeapId(heap), (offset / DESCRIPTOR_SIZE) as u32))
}

fn bottom_level(accels: &HashMap<u32, AccelStructure>, address: GpuAddress) -> Option<&BottomLevel> {
    match decode_address(address)? {
        (index, 0) => match accels.get(&(index as u32))? {
            AccelStructure::Bottom(blas) => Some(blas),
            AccelStructure::Top(_) => None,
        },
        _ => None,
    }
}

/// Round a texel to what the format stores.
fn quantize(format: TextureFormat, texel: [f32; 4]) -> [f32; 4] {
    match format {
        TextureFormat::Rgba32Float => texel,
        TextureFormat::Rgba16Float => texel.map(|c| half::f16::from_f32(c).to_f32()),
        TextureFormat::R32Float => [texel[0], 0.0, 0.0, 1.0],
    }
}

impl DeviceState {
    fn buffer(&self, id: BufferId) -> Result<&BufferSlot, DeviceError> {
        self.buffers.get(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            index: id.0,
        })
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut BufferSlot, DeviceError> {
        self.buffers.get_mut(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            index: id.0,
        })
    }

    fn texture(&self, id: TextureId) -> Result<&TextureSlot, DeviceError> {
        self.textures.get(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            index: id.0,
        })
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut TextureSlot, DeviceError> {
        self.textures.get_mut(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            index: id.0,
        })
    }

    fn heap(&self, id: HeapId) -> Result<&HeapSlot, DeviceError> {
        self.heaps.get(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "descriptor heap",
            index: id.0,
        })
    }

    fn pipeline(&self, id: PipelineId) -> Result<&SoftwarePipeline, DeviceError> {
        self.pipelines.get(id.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "pipeline",
            index: id.0,
        })
    }

    fn state_of(&self, resource: ResourceId) -> Result<ResourceState, DeviceError> {
        match resource {
            ResourceId::Buffer(id) => Ok(self.buffer(id)?.state),
            ResourceId::Texture(id) => Ok(self.texture(id)?.state),
        }
    }

    fn reserve(&mut self, caps: &DeviceCaps, bytes: u64) -> Result<(), DeviceError> {
        let available = caps.memory_budget.saturating_sub(self.allocated);
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        self.allocated += bytes;
        Ok(())
    }

    /// Fail if `resource` was written by an earlier operation with no fence since.
    fn check_fenced(&self, resource: impl Into<ResourceId>) -> Result<(), DeviceError> {
        let resource = resource.into();
        if self.pending.contains(&resource) {
            return Err(DeviceError::Hazard { resource });
        }
        Ok(())
    }

    fn expect_state(
        &self,
        resource: impl Into<ResourceId>,
        expected: ResourceState,
    ) -> Result<(), DeviceError> {
        let resource = resource.into();
        let actual = self.state_of(resource)?;
        if actual != expected {
            return Err(DeviceError::InvalidState {
                resource,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Shader-readable buffers: upload memory or transitioned default memory.
    fn expect_readable(&self, buffer: BufferId) -> Result<(), DeviceError> {
        let actual = self.buffer(buffer)?.state;
        match actual {
            ResourceState::GenericRead | ResourceState::ShaderResource => self.check_fenced(buffer),
            _ => Err(DeviceError::InvalidState {
                resource: buffer.into(),
                expected: ResourceState::ShaderResource,
                actual,
            }),
        }
    }

    fn buffer_range(&self, id: BufferId, offset: u64, len: u64) -> Result<&[u8], DeviceError> {
        let data = &self.buffer(id)?.data;
        let size = data.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(&data[offset as usize..end as usize]),
            _ => Err(DeviceError::OutOfBounds { offset, len, size }),
        }
    }

    fn submitted(&self, queue: QueueKind) -> u64 {
        match queue {
            QueueKind::Graphics => self.graphics_submitted,
            QueueKind::Compute => self.compute_submitted,
        }
    }

    fn execute(
        &mut self,
        caps: &DeviceCaps,
        bind: &mut BindState,
        command: Command,
    ) -> Result<(), DeviceError> {
        match command {
            Command::WriteBuffer {
                buffer,
                offset,
                data,
            } => {
                let slot = self.buffer(buffer)?;
                if slot.kind != BufferKind::Upload && slot.state != ResourceState::CopyDest {
                    return Err(DeviceError::InvalidState {
                        resource: buffer.into(),
                        expected: ResourceState::CopyDest,
                        actual: slot.state,
                    });
                }
                let size = slot.data.len() as u64;
                let len = data.len() as u64;
                if offset + len > size {
                    return Err(DeviceError::OutOfBounds { offset, len, size });
                }
                let slot = self.buffer_mut(buffer)?;
                slot.data[offset as usize..(offset + len) as usize].copy_from_slice(&data);
            }
            Command::Transition {
                resource,
                before,
                after,
            } => {
                self.expect_state(resource, before)?;
                match resource {
                    ResourceId::Buffer(id) => self.buffer_mut(id)?.state = after,
                    ResourceId::Texture(id) => self.texture_mut(id)?.state = after,
                }
                self.pending.remove(&resource);
            }
            Command::UavBarrier { resource: None } => self.pending.clear(),
            Command::UavBarrier {
                resource: Some(resource),
            } => {
                self.state_of(resource)?;
                self.pending.remove(&resource);
            }
            Command::BuildBottomLevel {
                geometries,
                dest,
                scratch,
            } => self.build_bottom_level(caps, &geometries, dest, scratch)?,
            Command::BuildTopLevel {
                instances,
                instance_count,
                dest,
                scratch,
            } => self.build_top_level(caps, instances, instance_count, dest, scratch)?,
            Command::SetDescriptorHeap(heap) => {
                self.heap(heap)?;
                bind.heap = Some(heap);
            }
            Command::SetPipeline(pipeline) => {
                self.pipeline(pipeline)?;
                bind.pipeline = Some(pipeline);
            }
            Command::SetGlobalBindings(globals) => bind.globals = Some(globals),
            Command::DispatchRays(desc) => {
                if !caps.ray_queries {
                    return Err(DeviceError::Unsupported("ray dispatch".into()));
                }
                self.dispatch_rays(caps, bind, &desc)?;
            }
            Command::ClearTexture { texture, value } => {
                let slot = self.texture_mut(texture)?;
                if !matches!(
                    slot.state,
                    ResourceState::UnorderedAccess | ResourceState::RenderTarget | ResourceState::DepthWrite
                ) {
                    return Err(DeviceError::InvalidState {
                        resource: texture.into(),
                        expected: ResourceState::UnorderedAccess,
                        actual: slot.state,
                    });
                }
                let value = quantize(slot.desc.format, value);
                slot.texels.fill(value);
                self.pending.insert(texture.into());
            }
            Command::TemporalBlend {
                current,
                history_src,
                history_dst,
                output,
                weight,
            } => self.temporal_blend(current, history_src, history_dst, output, weight)?,
            Command::Wait(submission) => {
                if submission.value > self.submitted(submission.queue) {
                    return Err(DeviceError::QueueStall(submission));
                }
            }
        }
        Ok(())
    }

    fn check_build_targets(
        &self,
        dest: BufferId,
        scratch: BufferId,
        info: PrebuildInfo,
    ) -> Result<(), DeviceError> {
        self.expect_state(dest, ResourceState::AccelerationStructure)?;
        self.expect_state(scratch, ResourceState::UnorderedAccess)?;
        self.check_fenced(dest)?;
        self.check_fenced(scratch)?;
        let provided = self.buffer(dest)?.data.len() as u64;
        if provided < info.result_size {
            return Err(DeviceError::DestinationTooSmall {
                required: info.result_size,
                provided,
            });
        }
        let provided = self.buffer(scratch)?.data.len() as u64;
        if provided < info.scratch_size {
            return Err(DeviceError::ScratchTooSmall {
                required: info.scratch_size,
                provided,
            });
        }
        Ok(())
    }

    fn build_bottom_level(
        &mut self,
        caps: &DeviceCaps,
        geometries: &[TriangleGeometryDesc],
        dest: BufferId,
        scratch: BufferId,
    ) -> Result<(), DeviceError> {
        if !caps.ray_queries {
            return Err(DeviceError::Unsupported("acceleration structures".into()));
        }
        let info = accel::prebuild_info(&AccelInputs::BottomLevel(geometries));
        self.check_build_targets(dest, scratch, info)?;
        for geom in geometries {
            self.expect_readable(geom.vertex_buffer)?;
            self.expect_readable(geom.index_buffer)?;
        }
        let blas = BottomLevel::build(geometries, |buffer, offset, len| {
            self.buffer_range(buffer, offset, len)
        })?;
        tracing::debug!(
            dest = dest.0,
            geometries = geometries.len(),
            triangles = blas.triangle_count(),
            "bottom level built"
        );
        self.accels.insert(dest.0, AccelStructure::Bottom(blas));
        self.pending.insert(dest.into());
        self.pending.insert(scratch.into());
        Ok(())
    }

    fn build_top_level(
        &mut self,
        caps: &DeviceCaps,
        instances: BufferId,
        instance_count: u32,
        dest: BufferId,
        scratch: BufferId,
    ) -> Result<(), DeviceError> {
        if !caps.ray_queries {
            return Err(DeviceError::Unsupported("acceleration structures".into()));
        }
        let info = accel::prebuild_info(&AccelInputs::TopLevel { instance_count });
        self.check_build_targets(dest, scratch, info)?;
        self.expect_readable(instances)?;

        let bytes = self.buffer_range(instances, 0, instance_count as u64 * InstanceDesc::SIZE)?;
        let descs: Vec<InstanceDesc> = bytes
            .chunks_exact(InstanceDesc::SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for desc in &descs {
            let (index, _) = decode_address(desc.bottom_level)
                .ok_or(DeviceError::NotAccelerationStructure(u32::MAX))?;
            self.check_fenced(BufferId(index as u32))?;
        }

        let accels = &self.accels;
        let tlas = TopLevel::build(descs, |address| bottom_level(accels, address))?;
        self.accels.insert(dest.0, AccelStructure::Top(tlas));
        self.pending.insert(dest.into());
        self.pending.insert(scratch.into());
        Ok(())
    }

    fn temporal_blend(
        &mut self,
        current: TextureId,
        history_src: TextureId,
        history_dst: TextureId,
        output: TextureId,
        weight: f32,
    ) -> Result<(), DeviceError> {
        self.expect_state(current, ResourceState::ShaderResource)?;
        for target in [history_src, history_dst, output] {
            self.expect_state(target, ResourceState::UnorderedAccess)?;
        }
        self.check_fenced(current)?;
        self.check_fenced(history_src)?;

        let extent = |t: &TextureSlot| (t.desc.width, t.desc.height);
        let size = extent(self.texture(current)?);
        for target in [history_src, history_dst, output] {
            let slot = self.texture(target)?;
            if extent(slot) != size {
                return Err(DeviceError::OutOfBounds {
                    offset: 0,
                    len: slot.desc.byte_size(),
                    size: self.texture(current)?.desc.byte_size(),
                });
            }
        }

        let blended: Vec<[f32; 4]> = {
            let cur = &self.texture(current)?.texels;
            let src = &self.texture(history_src)?.texels;
            cur.iter()
                .zip(src)
                .map(|(c, s)| std::array::from_fn(|i| c[i] * weight + s[i] * (1.0 - weight)))
                .collect()
        };
        for target in [history_dst, output] {
            let slot = self.texture_mut(target)?;
            let format = slot.desc.format;
            slot.texels = blended.iter().map(|t| quantize(format, *t)).collect();
            self.pending.insert(target.into());
        }
        Ok(())
    }

    fn dispatch_rays(
        &mut self,
        caps: &DeviceCaps,
        bind: &BindState,
        desc: &DispatchRaysDesc,
    ) -> Result<(), DeviceError> {
        let globals = bind.globals.ok_or(DeviceError::Unbound("global bindings"))?;
        let output = self.texture(globals.output)?;
        self.expect_state(globals.output, ResourceState::UnorderedAccess)?;
        if desc.width > output.desc.width || desc.height > output.desc.height || desc.depth != 1 {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: desc.width as u64 * desc.height as u64 * desc.depth as u64,
                size: output.desc.width as u64 * output.desc.height as u64,
            });
        }
        let format = output.desc.format;
        let row = output.desc.width as usize;

        let out_index = globals.output.0 as usize;
        let mut texels = std::mem::take(&mut self.textures[out_index].texels);
        let result = trace::dispatch(self, caps, bind, desc, &mut texels, row);
        if result.is_ok() {
            texels.iter_mut().for_each(|t| *t = quantize(format, *t));
        }
        self.textures[out_index].texels = texels;
        self.pending.insert(globals.output.into());
        result
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_caps(DeviceCaps::default())
    }

    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self {
            caps,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// A device that rasterizes but cannot trace rays.
    pub fn without_ray_queries() -> Self {
        Self::with_caps(DeviceCaps {
            name: "software (raster only)".to_string(),
            ray_queries: false,
            ..DeviceCaps::default()
        })
    }

    /// Bytes currently allocated against the memory budget.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Mark the device removed; every later submission fails.
    pub fn simulate_device_loss(&self, reason: impl Into<String>) {
        self.state.lock().lost = Some(reason.into());
    }

    /// Write the depth and normal targets a rasterized prepass would produce.
    ///
    /// `depth` must be in `DepthWrite` and receives clip-space depth (1.0
    /// where nothing is hit). `normal` must be in `RenderTarget` and receives
    /// the world normal in xyz and reflectivity in w.
    pub fn reference_prepass(
        &self,
        frame: &FrameConstants,
        scene: &RasterScene,
        depth: TextureId,
        normal: TextureId,
    ) -> Result<(), DeviceError> {
        let view_proj = Mat4::from_cols_array_2d(&frame.view_proj);
        self.raster_pass(scene, view_proj, depth, Some(normal))
    }

    /// Render sun depth into a `DepthWrite` shadow map.
    pub fn reference_shadow_pass(
        &self,
        light_view_proj: Mat4,
        scene: &RasterScene,
        shadow_map: TextureId,
    ) -> Result<(), DeviceError> {
        self.raster_pass(scene, light_view_proj, shadow_map, None)
    }

    fn raster_pass(
        &self,
        scene: &RasterScene,
        view_proj: Mat4,
        depth: TextureId,
        normal: Option<TextureId>,
    ) -> Result<(), DeviceError> {
        if !self.caps.ray_queries {
            return Err(DeviceError::Unsupported("reference raster passes".into()));
        }
        let mut state = self.state.lock();
        state.expect_state(depth, ResourceState::DepthWrite)?;
        let depth_desc = state.texture(depth)?.desc.clone();
        let (width, height) = (depth_desc.width, depth_desc.height);
        if let Some(normal) = normal {
            state.expect_state(normal, ResourceState::RenderTarget)?;
            let desc = &state.texture(normal)?.desc;
            if (desc.width, desc.height) != (width, height) {
                return Err(DeviceError::OutOfBounds {
                    offset: 0,
                    len: desc.byte_size(),
                    size: width as u64 * height as u64 * desc.format.texel_size(),
                });
            }
        }

        let mut depth_texels = vec![[0.0; 4]; (width * height) as usize];
        let mut normal_texels = vec![[0.0; 4]; (width * height) as usize];
        trace::raster_depth(&state, scene, view_proj, width, &mut depth_texels, &mut normal_texels)?;

        let slot = state.texture_mut(depth)?;
        slot.texels = depth_texels.into_iter().map(|t| quantize(depth_desc.format, t)).collect();
        if let Some(normal) = normal {
            let slot = state.texture_mut(normal)?;
            let format = slot.desc.format;
            slot.texels = normal_texels.into_iter().map(|t| quantize(format, t)).collect();
        }
        Ok(())
    }
}

/// Check register uniqueness and parameter-space cost, then encode.
fn encode_layout(layout: &BindingLayout) -> Result<Vec<u8>, DeviceError> {
    let fail = |reason: String| DeviceError::LayoutSerialization(format!("{}: {}", layout.name, reason));

    let cost: u32 = layout.params.iter().map(BindingParam::cost_words).sum();
    if cost > MAX_LAYOUT_WORDS {
        return Err(fail(format!("{} words exceed the {} word limit", cost, MAX_LAYOUT_WORDS)));
    }

    let mut registers: HashSet<(char, u32)> = HashSet::new();
    let mut claim = |class: char, register: u32| {
        if registers.insert((class, register)) {
            Ok(())
        } else {
            Err(fail(format!("register {}{} bound twice", class, register)))
        }
    };
    let mut bytes = LAYOUT_MAGIC.to_vec();
    bytes.push(layout.local as u8);
    for param in &layout.params {
        match param {
            BindingParam::ConstantBuffer { register } => {
                claim('b', *register)?;
                bytes.push(0);
                bytes.extend_from_slice(&register.to_le_bytes());
            }
            BindingParam::ShaderResource { register } => {
                claim('t', *register)?;
                bytes.push(1);
                bytes.extend_from_slice(&register.to_le_bytes());
            }
            BindingParam::UnorderedAccess { register } => {
                claim('u', *register)?;
                bytes.push(2);
                bytes.extend_from_slice(&register.to_le_bytes());
            }
            BindingParam::DescriptorTable { ranges } => {
                if ranges.is_empty() {
                    return Err(fail("descriptor table without ranges".into()));
                }
                bytes.push(3);
                bytes.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
                for range in ranges {
                    if range.count == 0 {
                        return Err(fail("empty descriptor range".into()));
                    }
                    let class = match range.kind {
                        RangeKind::ShaderResource => 't',
                        RangeKind::UnorderedAccess => 'u',
                        RangeKind::ConstantBuffer => 'b',
                    };
                    for register in range.base_register..range.base_register + range.count {
                        claim(class, register)?;
                    }
                    bytes.push(class as u8);
                    bytes.extend_from_slice(&range.base_register.to_le_bytes());
                    bytes.extend_from_slice(&range.count.to_le_bytes());
                }
            }
            BindingParam::Constants { register, count } => {
                claim('b', *register)?;
                bytes.push(4);
                bytes.extend_from_slice(&register.to_le_bytes());
                bytes.extend_from_slice(&count.to_le_bytes());
            }
        }
    }
    Ok(bytes)
}

impl RayDevice for SoftwareDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, DeviceError> {
        if desc.size == 0 || desc.size > u32::MAX as u64 {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: desc.size,
                size: u32::MAX as u64,
            });
        }
        if desc.kind == BufferKind::AccelerationStructure && !self.caps.ray_queries {
            return Err(DeviceError::Unsupported("acceleration structure buffers".into()));
        }
        let mut state = self.state.lock();
        state.reserve(&self.caps, desc.size)?;
        let id = BufferId(state.buffers.len() as u32);
        state.buffers.push(BufferSlot {
            kind: desc.kind,
            data: vec![0; desc.size as usize],
            state: desc.kind.initial_state(),
        });
        tracing::trace!(buffer = id.0, label = %desc.label, size = desc.size, "buffer created");
        Ok(id)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        let mut state = self.state.lock();
        state.reserve(&self.caps, desc.byte_size())?;
        let id = TextureId(state.textures.len() as u32);
        state.textures.push(TextureSlot {
            desc: desc.clone(),
            texels: vec![quantize(desc.format, [0.0; 4]); (desc.width * desc.height) as usize],
            state: desc.initial_state,
        });
        Ok(id)
    }

    fn buffer_address(&self, buffer: BufferId) -> Result<GpuAddress, DeviceError> {
        self.state.lock().buffer(buffer)?;
        Ok(buffer_address(buffer.0 as usize))
    }

    fn buffer_size(&self, buffer: BufferId) -> Result<u64, DeviceError> {
        Ok(self.state.lock().buffer(buffer)?.data.len() as u64)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let slot = state.buffer_mut(buffer)?;
        let (len, size) = (data.len() as u64, slot.data.len() as u64);
        if offset + len > size {
            return Err(DeviceError::OutOfBounds { offset, len, size });
        }
        slot.data[offset as usize..(offset + len) as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId) -> Result<Vec<u8>, DeviceError> {
        Ok(self.state.lock().buffer(buffer)?.data.clone())
    }

    fn write_texture(&self, texture: TextureId, texels: &[[f32; 4]]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let slot = state.texture_mut(texture)?;
        if texels.len() != slot.texels.len() {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: texels.len() as u64 * slot.desc.format.texel_size(),
                size: slot.desc.byte_size(),
            });
        }
        let format = slot.desc.format;
        slot.texels = texels.iter().map(|t| quantize(format, *t)).collect();
        Ok(())
    }

    fn read_texture(&self, texture: TextureId) -> Result<Vec<[f32; 4]>, DeviceError> {
        Ok(self.state.lock().texture(texture)?.texels.clone())
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc, DeviceError> {
        Ok(self.state.lock().texture(texture)?.desc.clone())
    }

    fn resource_state(&self, resource: ResourceId) -> Result<ResourceState, DeviceError> {
        self.state.lock().state_of(resource)
    }

    fn create_descriptor_heap(&self, capacity: u32) -> Result<HeapId, DeviceError> {
        let mut state = self.state.lock();
        state.reserve(&self.caps, capacity as u64 * DESCRIPTOR_SIZE)?;
        let id = HeapId(state.heaps.len() as u32);
        state.heaps.push(HeapSlot {
            descriptors: vec![None; capacity as usize],
        });
        Ok(id)
    }

    fn write_descriptor(&self, heap: HeapId, index: u32, texture: TextureId) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.texture(texture)?;
        let slot = state.heaps.get_mut(heap.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "descriptor heap",
            index: heap.0,
        })?;
        let capacity = slot.descriptors.len() as u64;
        let entry = slot.descriptors.get_mut(index as usize).ok_or(DeviceError::OutOfBounds {
            offset: index as u64 * DESCRIPTOR_SIZE,
            len: DESCRIPTOR_SIZE,
            size: capacity * DESCRIPTOR_SIZE,
        })?;
        *entry = Some(texture);
        Ok(())
    }

    fn descriptor_handle(&self, heap: HeapId, index: u32) -> Result<GpuAddress, DeviceError> {
        let state = self.state.lock();
        let capacity = state.heap(heap)?.descriptors.len() as u32;
        if index >= capacity {
            return Err(DeviceError::OutOfBounds {
                offset: index as u64 * DESCRIPTOR_SIZE,
                len: DESCRIPTOR_SIZE,
                size: capacity as u64 * DESCRIPTOR_SIZE,
            });
        }
        Ok(descriptor_address(heap, index))
    }

    fn prebuild_info(&self, inputs: &AccelInputs<'_>) -> PrebuildInfo {
        accel::prebuild_info(inputs)
    }

    fn serialize_layout(&self, layout: &BindingLayout) -> Result<SerializedLayout, DeviceError> {
        let bytes = encode_layout(layout)?;
        Ok(SerializedLayout {
            layout: layout.clone(),
            bytes,
        })
    }

    fn load_library(&self, library: &ProgramLibrary) -> Result<LibraryId, DeviceError> {
        let exports = programs::parse_library(library)?;
        let mut state = self.state.lock();
        let id = LibraryId(state.libraries.len() as u32);
        tracing::debug!(library = %library.label, exports = exports.len(), "program library loaded");
        state.libraries.push(exports);
        Ok(id)
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<PipelineId, DeviceError> {
        if !self.caps.ray_queries {
            return Err(DeviceError::Unsupported("ray pipelines".into()));
        }
        if !desc.local_layout.layout.local || desc.global_layout.layout.local {
            return Err(DeviceError::LayoutSerialization(format!(
                "{}: global and local layouts swapped",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let exports = state.libraries.get(desc.library.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "library",
            index: desc.library.0,
        })?;
        let index = state.pipelines.len() as u32;
        let pipeline = SoftwarePipeline::link(index, desc, exports, self.caps.max_recursion_depth)?;
        tracing::debug!(
            pipeline = %pipeline.label,
            stack = pipeline.stack_size,
            "ray pipeline created"
        );
        state.pipelines.push(pipeline);
        Ok(PipelineId(index))
    }

    fn program_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ProgramIdentifier> {
        self.state.lock().pipeline(pipeline).ok()?.identifier(export)
    }

    fn program_stack_size(&self, pipeline: PipelineId, export: &str) -> Option<u64> {
        self.state.lock().pipeline(pipeline).ok()?.export_stack_size(export)
    }

    fn pipeline_stack_size(&self, pipeline: PipelineId) -> Option<u64> {
        self.state.lock().pipeline(pipeline).ok().map(|p| p.stack_size)
    }

    fn set_pipeline_stack_size(&self, pipeline: PipelineId, bytes: u64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let slot = state.pipelines.get_mut(pipeline.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "pipeline",
            index: pipeline.0,
        })?;
        slot.stack_size = bytes;
        Ok(())
    }

    fn submit(&self, list: CommandList) -> Result<SubmissionId, DeviceError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.lost {
            return Err(DeviceError::DeviceLost(reason.clone()));
        }
        let queue = list.queue();
        let label = list.label().to_string();
        let _span = tracing::trace_span!("submit", list = %label, commands = list.len()).entered();

        let mut bind = BindState::default();
        let mut result = Ok(());
        for command in list.into_commands() {
            result = state.execute(&self.caps, &mut bind, command);
            if result.is_err() {
                break;
            }
        }
        // Submission boundaries flush every pending write
        state.pending.clear();
        if let Err(err) = result {
            tracing::error!(list = %label, error = %err, "submission failed");
            return Err(err);
        }

        let counter = match queue {
            QueueKind::Graphics => &mut state.graphics_submitted,
            QueueKind::Compute => &mut state.compute_submitted,
        };
        *counter += 1;
        Ok(SubmissionId {
            queue,
            value: *counter,
        })
    }
}
