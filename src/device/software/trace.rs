//! Ray dispatch: record decoding and the built-in program bodies.
//!
//! Radiance payloads carry color in rgb. Shadow payloads carry visibility
//! in every channel (1 = lit).

use std::collections::HashMap;

use bytemuck::Pod;
use rayon::prelude::*;

use super::accel::{AccelStructure, AnyHitVerdict, Candidate, TopLevel, TraceQuery};
use super::programs::{make_identifier, IdentifierSlot, Kernel, SoftwarePipeline};
use super::{bottom_level, decode_descriptor, BindState, DeviceState, HeapSlot, RasterScene, TextureSlot};
use crate::abi::{FrameConstants, GeometryInfo, GpuMaterial, HitConstants, SceneVertex, DESCRIPTORS_PER_MATERIAL};
use crate::device::{
    DeviceCaps, DeviceError, DispatchRaysDesc, HeapId, ProgramIdentifier, RecordTableView,
    ResourceState, PROGRAM_IDENTIFIER_SIZE,
};
use crate::util::{Mat3, Mat4, Vec2, Vec3, Vec4};

#[derive(Debug, Clone, Copy)]
struct Ray {
    origin: Vec3,
    direction: Vec3,
    t_min: f32,
    t_max: f32,
}

impl Ray {
    fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            t_min: 0.0,
            t_max: f32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TraceFlags {
    accept_first: bool,
    skip_closest_hit: bool,
    shadow: bool,
}

impl TraceFlags {
    const RADIANCE: Self = Self {
        accept_first: false,
        skip_closest_hit: false,
        shadow: false,
    };
    /// Any hit occludes; hit programs other than any-hit never run.
    const OCCLUSION: Self = Self {
        accept_first: true,
        skip_closest_hit: true,
        shadow: true,
    };
    /// Any hit occludes; the closest-hit program reports it.
    const SHADOW: Self = Self {
        accept_first: true,
        skip_closest_hit: false,
        shadow: true,
    };
}

struct Surface {
    position: Vec3,
    normal: Vec3,
    uv: Vec2,
    material_slot: u32,
}

/// Local arguments of one hit-group record.
struct Record {
    descriptors: u64,
    material: u32,
}

/// Surface reconstructed from the depth and normal targets.
struct GBufferSample {
    position: Vec3,
    normal: Vec3,
    reflectivity: f32,
}

fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> Result<T, DeviceError> {
    let len = std::mem::size_of::<T>();
    bytes
        .get(offset..offset + len)
        .map(bytemuck::pod_read_unaligned)
        .ok_or(DeviceError::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            size: bytes.len() as u64,
        })
}

fn read_array<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn reflect(direction: Vec3, normal: Vec3) -> Vec3 {
    direction - 2.0 * direction.dot(normal) * normal
}

fn unproject(inverse_view_proj: &Mat4, ndc: Vec3) -> Vec3 {
    inverse_view_proj.project_point3(ndc)
}

/// Pixel center to normalized device coordinates (y up).
fn pixel_ndc(x: u32, y: u32, width: u32, height: u32) -> Vec2 {
    Vec2::new(
        (x as f32 + 0.5) / width as f32 * 2.0 - 1.0,
        1.0 - (y as f32 + 0.5) / height as f32 * 2.0,
    )
}

/// Ray through a pixel from the near plane toward the far plane.
fn pixel_ray(inverse_view_proj: &Mat4, x: u32, y: u32, width: u32, height: u32) -> Ray {
    let ndc = pixel_ndc(x, y, width, height);
    let near = unproject(inverse_view_proj, ndc.extend(0.0));
    let far = unproject(inverse_view_proj, ndc.extend(1.0));
    Ray::new(near, (far - near).normalize_or_zero())
}

/// Geometry, materials and textures shared by ray dispatch and the raster passes.
struct SceneData<'a> {
    top: &'a TopLevel,
    accels: &'a HashMap<u32, AccelStructure>,
    geometry: Vec<GeometryInfo>,
    materials: Vec<GpuMaterial>,
    vertices: &'a [u8],
    indices: &'a [u8],
    heap_id: HeapId,
    heap: &'a HeapSlot,
    textures: &'a [TextureSlot],
}

impl<'a> SceneData<'a> {
    fn new(state: &'a DeviceState, bindings: &RasterScene) -> Result<Self, DeviceError> {
        for buffer in [
            bindings.geometry_info,
            bindings.materials,
            bindings.vertex_buffer,
            bindings.index_buffer,
        ] {
            state.expect_readable(buffer)?;
        }
        state.expect_state(bindings.top_level, ResourceState::AccelerationStructure)?;
        state.check_fenced(bindings.top_level)?;
        let top = match state.accels.get(&bindings.top_level.0) {
            Some(AccelStructure::Top(top)) => top,
            _ => return Err(DeviceError::NotAccelerationStructure(bindings.top_level.0)),
        };

        Ok(Self {
            top,
            accels: &state.accels,
            geometry: read_array(&state.buffer(bindings.geometry_info)?.data),
            materials: read_array(&state.buffer(bindings.materials)?.data),
            vertices: &state.buffer(bindings.vertex_buffer)?.data,
            indices: &state.buffer(bindings.index_buffer)?.data,
            heap_id: bindings.descriptors,
            heap: state.heap(bindings.descriptors)?,
            textures: &state.textures,
        })
    }

    fn traverse<F>(&self, ray: &Ray, accept_first: bool, any_hit: F) -> Result<Option<Candidate>, DeviceError>
    where
        F: FnMut(&Candidate) -> Result<AnyHitVerdict, DeviceError>,
    {
        let query = TraceQuery {
            origin: ray.origin,
            direction: ray.direction,
            t_min: ray.t_min,
            t_max: ray.t_max,
            mask: 0xff,
            accept_first,
        };
        self.top
            .traverse(|address| bottom_level(self.accels, address), &query, any_hit)
    }

    fn material(&self, index: u32) -> Result<&GpuMaterial, DeviceError> {
        self.materials.get(index as usize).ok_or(DeviceError::InvalidHandle {
            kind: "material",
            index,
        })
    }

    /// Interpolated attributes at a hit, normal in world space facing the ray.
    fn surface(&self, ray: &Ray, hit: &Candidate) -> Result<Surface, DeviceError> {
        let info = self.geometry.get(hit.geometry as usize).ok_or(DeviceError::InvalidHandle {
            kind: "geometry",
            index: hit.geometry,
        })?;
        let indices: [u32; 3] = read_pod(self.indices, info.index_offset as usize + hit.primitive as usize * 12)?;
        let vertex = |i: u32| -> Result<SceneVertex, DeviceError> {
            read_pod(
                self.vertices,
                info.vertex_offset as usize + i as usize * info.vertex_stride as usize,
            )
        };
        let (a, b, c) = (vertex(indices[0])?, vertex(indices[1])?, vertex(indices[2])?);
        let w = 1.0 - hit.u - hit.v;
        let normal = Vec3::from(a.normal) * w + Vec3::from(b.normal) * hit.u + Vec3::from(c.normal) * hit.v;
        let uv = Vec2::from(a.uv) * w + Vec2::from(b.uv) * hit.u + Vec2::from(c.uv) * hit.v;

        let instance = self.top.instance(hit.instance).ok_or(DeviceError::InvalidHandle {
            kind: "instance",
            index: hit.instance,
        })?;
        let normal_matrix = Mat3::from(instance.world_to_object.matrix3).transpose();
        let mut normal = (normal_matrix * normal).normalize_or_zero();
        if normal == Vec3::ZERO {
            normal = -ray.direction.normalize_or_zero();
        }
        if normal.dot(ray.direction) > 0.0 {
            normal = -normal;
        }

        Ok(Surface {
            position: ray.origin + ray.direction * hit.t,
            normal,
            uv,
            material_slot: info.material_slot,
        })
    }

    /// Nearest sample with wrap addressing.
    fn sample(&self, descriptor: u32, uv: Vec2) -> Result<Vec4, DeviceError> {
        let texture = self
            .heap
            .descriptors
            .get(descriptor as usize)
            .copied()
            .flatten()
            .ok_or(DeviceError::InvalidHandle {
                kind: "descriptor",
                index: descriptor,
            })?;
        let slot = self.textures.get(texture.0 as usize).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            index: texture.0,
        })?;
        if slot.state != ResourceState::ShaderResource {
            return Err(DeviceError::InvalidState {
                resource: texture.into(),
                expected: ResourceState::ShaderResource,
                actual: slot.state,
            });
        }
        let x = (uv.x.rem_euclid(1.0) * slot.desc.width as f32) as u32;
        let y = (uv.y.rem_euclid(1.0) * slot.desc.height as f32) as u32;
        Ok(Vec4::from(slot.texel(x, y)))
    }

    /// Alpha test of a cutout material. Other materials always pass.
    fn alpha_passes(&self, material: &GpuMaterial, descriptors: u32, uv: Vec2) -> Result<bool, DeviceError> {
        if !material.is_cutout() {
            return Ok(true);
        }
        let alpha = self.sample(descriptors, uv)?.w * material.base_color[3];
        Ok(alpha >= material.params[1])
    }
}

/// Everything one dispatch reads.
struct TraceScene<'a> {
    scene: SceneData<'a>,
    pipeline: &'a SoftwarePipeline,
    records: &'a [u8],
    table: RecordTableView,
    hit_group: ProgramIdentifier,
    frame: FrameConstants,
    camera_to_world: Mat4,
    hit: HitConstants,
    depth: &'a TextureSlot,
    normal: &'a TextureSlot,
    shadow_map: &'a TextureSlot,
    width: u32,
    height: u32,
}

impl<'a> TraceScene<'a> {
    fn new(
        state: &'a DeviceState,
        caps: &DeviceCaps,
        bind: &BindState,
        desc: &DispatchRaysDesc,
    ) -> Result<Self, DeviceError> {
        let pipeline = state.pipeline(bind.pipeline.ok_or(DeviceError::Unbound("pipeline"))?)?;
        let heap = bind.heap.ok_or(DeviceError::Unbound("descriptor heap"))?;
        let globals = bind.globals.ok_or(DeviceError::Unbound("global bindings"))?;

        if desc.ray_generation != make_identifier(pipeline.index, IdentifierSlot::RayGeneration) {
            return Err(DeviceError::IdentifierMismatch("ray generation"));
        }
        if desc.miss != make_identifier(pipeline.index, IdentifierSlot::Miss) {
            return Err(DeviceError::IdentifierMismatch("miss"));
        }

        let table = desc.hit_groups;
        let alignment = caps.record_alignment as u64;
        if table.stride == 0 || table.stride % alignment != 0 {
            return Err(DeviceError::Misaligned {
                what: "record stride",
                value: table.stride,
                alignment,
            });
        }
        let record_end = [
            Some(PROGRAM_IDENTIFIER_SIZE as u64),
            pipeline.local.descriptor_table.map(|o| o + 8),
            pipeline.local.constants.map(|o| o + 4),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        if table.stride < record_end {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: record_end,
                size: table.stride,
            });
        }
        state.expect_readable(table.buffer)?;
        let records = state.buffer_range(table.buffer, 0, table.size)?;

        state.expect_readable(globals.frame_constants)?;
        state.expect_readable(globals.hit_constants)?;
        let frame: FrameConstants = read_pod(&state.buffer(globals.frame_constants)?.data, 0)?;
        let hit: HitConstants = read_pod(&state.buffer(globals.hit_constants)?.data, 0)?;

        for texture in [globals.depth, globals.normal, globals.shadow_map] {
            state.expect_state(texture, ResourceState::ShaderResource)?;
            state.check_fenced(texture)?;
        }

        let scene = SceneData::new(
            state,
            &RasterScene {
                top_level: globals.top_level,
                geometry_info: globals.geometry_info,
                materials: globals.materials,
                vertex_buffer: globals.vertex_buffer,
                index_buffer: globals.index_buffer,
                descriptors: heap,
            },
        )?;

        Ok(Self {
            scene,
            pipeline,
            records,
            table,
            hit_group: make_identifier(pipeline.index, IdentifierSlot::HitGroup),
            camera_to_world: Mat4::from_cols_array_2d(&frame.camera_to_world),
            frame,
            hit,
            depth: state.texture(globals.depth)?,
            normal: state.texture(globals.normal)?,
            shadow_map: state.texture(globals.shadow_map)?,
            width: desc.width,
            height: desc.height,
        })
    }

    fn sun_direction(&self) -> Vec3 {
        Vec3::from_slice(&self.hit.sun_direction[..3])
    }

    fn record(&self, hit: &Candidate) -> Result<Record, DeviceError> {
        let index = hit.hit_group_offset as u64 + hit.geometry as u64;
        let count = self.table.count();
        if index >= count {
            return Err(DeviceError::RecordOutOfRange { index, count });
        }
        let start = (index * self.table.stride) as usize;
        let record = &self.records[start..start + self.table.stride as usize];
        if record[..PROGRAM_IDENTIFIER_SIZE] != self.hit_group.0 {
            return Err(DeviceError::UnknownIdentifier(index));
        }
        let local = &self.pipeline.local;
        Ok(Record {
            descriptors: match local.descriptor_table {
                Some(offset) => read_pod(record, offset as usize)?,
                None => 0,
            },
            material: match local.constants {
                Some(offset) => read_pod(record, offset as usize)?,
                None => 0,
            },
        })
    }

    /// First heap slot of the record's descriptor table.
    fn descriptor_base(&self, record: &Record) -> Result<u32, DeviceError> {
        let (heap, index) = decode_descriptor(record.descriptors).ok_or(DeviceError::Unbound("descriptor table"))?;
        if heap != self.scene.heap_id {
            return Err(DeviceError::InvalidHandle {
                kind: "descriptor table heap",
                index: heap.0,
            });
        }
        Ok(index)
    }

    fn trace(&self, ray: &Ray, flags: TraceFlags, depth: u32) -> Result<Vec4, DeviceError> {
        if depth > self.pipeline.max_recursion {
            return Err(DeviceError::RecursionExceeded {
                depth,
                max: self.pipeline.max_recursion,
            });
        }
        let required = self.pipeline.stack_required(depth);
        if required > self.pipeline.stack_size {
            return Err(DeviceError::StackOverflow {
                required,
                budget: self.pipeline.stack_size,
            });
        }

        let hit = self
            .scene
            .traverse(ray, flags.accept_first, |candidate| self.any_hit(ray, candidate))?;
        match hit {
            Some(_) if flags.skip_closest_hit => Ok(Vec4::ZERO),
            Some(candidate) => self.closest_hit(ray, &candidate, depth),
            None => Ok(self.miss(ray, flags)),
        }
    }

    fn any_hit(&self, ray: &Ray, hit: &Candidate) -> Result<AnyHitVerdict, DeviceError> {
        if self.pipeline.any_hit.kernel != Kernel::AlphaTestAnyHit {
            return Ok(AnyHitVerdict::Accept);
        }
        let record = self.record(hit)?;
        let material = self.scene.material(record.material)?;
        if !material.is_cutout() {
            return Ok(AnyHitVerdict::Accept);
        }
        let surface = self.scene.surface(ray, hit)?;
        let base = self.descriptor_base(&record)?;
        if self.scene.alpha_passes(material, base, surface.uv)? {
            Ok(AnyHitVerdict::Accept)
        } else {
            Ok(AnyHitVerdict::Ignore)
        }
    }

    fn closest_hit(&self, ray: &Ray, hit: &Candidate, depth: u32) -> Result<Vec4, DeviceError> {
        let kernel = self.pipeline.closest_hit.kernel;
        if kernel == Kernel::ShadowClosestHit {
            return Ok(Vec4::ZERO);
        }
        let record = self.record(hit)?;
        let material = *self.scene.material(record.material)?;
        let base = self.descriptor_base(&record)?;
        let surface = self.scene.surface(ray, hit)?;

        let albedo = Vec3::from_slice(&material.base_color[..3]) * self.scene.sample(base, surface.uv)?.truncate();
        let n_dot_l = surface.normal.dot(-self.sun_direction()).max(0.0);
        let visibility = match kernel {
            Kernel::PrimaryClosestHit => 1.0,
            Kernel::DiffuseClosestHit if self.hit.shadow_rays != 0 => {
                if n_dot_l > 0.0 {
                    self.shadow_ray(&surface, depth + 1)?
                } else {
                    0.0
                }
            }
            _ => self.shadow_map_visibility(surface.position),
        };
        let ambient = Vec3::from_slice(&self.hit.ambient[..3]);
        let sun = Vec3::from_slice(&self.hit.sun_color[..3]);
        let mut color = albedo * (ambient + sun * n_dot_l * visibility);

        if kernel == Kernel::ReflectionClosestHit && self.hit.reflections != 0 && material.is_reflective() {
            let specular = self.scene.sample(base + 1, surface.uv)?;
            let k = (material.params[0] * specular.x).clamp(0.0, 1.0);
            if k > 0.0 {
                let direction = reflect(ray.direction.normalize_or_zero(), surface.normal);
                let origin = surface.position + surface.normal * self.hit.shadow_params[1];
                let reflected = self.trace(&Ray::new(origin, direction), TraceFlags::RADIANCE, depth + 1)?;
                color = color.lerp(reflected.truncate(), k);
            }
        }
        Ok(color.extend(1.0))
    }

    fn miss(&self, ray: &Ray, flags: TraceFlags) -> Vec4 {
        if flags.shadow || self.pipeline.miss.kernel == Kernel::ShadowMiss {
            return Vec4::ONE;
        }
        let up = 0.5 * (ray.direction.normalize_or_zero().y + 1.0);
        (Vec3::from_slice(&self.hit.ambient[..3]) * (0.5 + up)).extend(1.0)
    }

    /// Visibility toward the sun by an occlusion ray.
    fn shadow_ray(&self, surface: &Surface, depth: u32) -> Result<f32, DeviceError> {
        let origin = surface.position + surface.normal * self.hit.shadow_params[1];
        let ray = Ray::new(origin, -self.sun_direction());
        Ok(self.trace(&ray, TraceFlags::OCCLUSION, depth)?.x)
    }

    /// Visibility toward the sun by shadow-map lookup. Outside the map is lit.
    fn shadow_map_visibility(&self, position: Vec3) -> f32 {
        let clip = Mat4::from_cols_array_2d(&self.hit.light_view_proj) * position.extend(1.0);
        if clip.w <= 0.0 {
            return 1.0;
        }
        let ndc = clip.truncate() / clip.w;
        let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        if !(0.0..=1.0).contains(&uv.x) || !(0.0..=1.0).contains(&uv.y) || ndc.z > 1.0 {
            return 1.0;
        }
        let desc = &self.shadow_map.desc;
        let stored = self
            .shadow_map
            .texel((uv.x * desc.width as f32) as u32, (uv.y * desc.height as f32) as u32)[0];
        if ndc.z - self.hit.shadow_params[0] > stored {
            0.0
        } else {
            1.0
        }
    }

    fn gbuffer(&self, x: u32, y: u32) -> Option<GBufferSample> {
        let depth = self.depth.texel(x, y)[0];
        if depth >= 1.0 {
            return None;
        }
        let ndc = pixel_ndc(x, y, self.width, self.height);
        let normal = Vec4::from(self.normal.texel(x, y));
        Some(GBufferSample {
            position: unproject(&self.camera_to_world, ndc.extend(depth)),
            normal: normal.truncate().normalize_or_zero(),
            reflectivity: normal.w,
        })
    }

    fn ray_generation(&self, x: u32, y: u32) -> Result<Vec4, DeviceError> {
        match self.pipeline.ray_generation.kernel {
            Kernel::PrimaryRayGen => {
                let ray = pixel_ray(&self.camera_to_world, x, y, self.width, self.height);
                self.trace(&ray, TraceFlags::RADIANCE, 1)
            }
            Kernel::ShadowRayGen => {
                let Some(sample) = self.gbuffer(x, y) else {
                    return Ok(Vec4::ONE);
                };
                if sample.normal.dot(-self.sun_direction()) <= 0.0 {
                    return Ok(Vec4::new(0.0, 0.0, 0.0, 1.0));
                }
                let origin = sample.position + sample.normal * self.hit.shadow_params[1];
                let visibility = self
                    .trace(&Ray::new(origin, -self.sun_direction()), TraceFlags::SHADOW, 1)?
                    .x;
                Ok(Vec4::new(visibility, visibility, visibility, 1.0))
            }
            Kernel::ScreenSpaceReflectionRayGen => {
                let Some(sample) = self.gbuffer(x, y) else {
                    return Ok(Vec4::ZERO);
                };
                if sample.reflectivity <= 0.0 {
                    return Ok(Vec4::ZERO);
                }
                let eye = Vec3::from_slice(&self.frame.camera_position[..3]);
                let direction = reflect((sample.position - eye).normalize_or_zero(), sample.normal);
                let origin = sample.position + sample.normal * self.hit.shadow_params[1];
                let color = self.trace(&Ray::new(origin, direction), TraceFlags::RADIANCE, 1)?;
                Ok(color.truncate().extend(sample.reflectivity))
            }
            other => Err(DeviceError::Unsupported(format!(
                "{} is not a ray generation program",
                other.name()
            ))),
        }
    }
}

/// Run the bound ray generation program once per pixel of `desc`.
pub(super) fn dispatch(
    state: &DeviceState,
    caps: &DeviceCaps,
    bind: &BindState,
    desc: &DispatchRaysDesc,
    output: &mut [[f32; 4]],
    row: usize,
) -> Result<(), DeviceError> {
    let scene = TraceScene::new(state, caps, bind, desc)?;
    let _span = tracing::debug_span!(
        "dispatch_rays",
        pipeline = %scene.pipeline.label,
        width = desc.width,
        height = desc.height
    )
    .entered();

    output
        .par_chunks_mut(row)
        .take(desc.height as usize)
        .enumerate()
        .try_for_each(|(y, line)| {
            for (x, texel) in line.iter_mut().take(desc.width as usize).enumerate() {
                *texel = scene.ray_generation(x as u32, y as u32)?.to_array();
            }
            Ok(())
        })
}

/// Rasterize scene depth (and normals) through `view_proj`, as the raster
/// pipeline would. Cutout materials are alpha tested.
pub(super) fn raster_depth(
    state: &DeviceState,
    bindings: &RasterScene,
    view_proj: Mat4,
    width: u32,
    depth: &mut [[f32; 4]],
    normal: &mut [[f32; 4]],
) -> Result<(), DeviceError> {
    let scene = SceneData::new(state, bindings)?;
    let inverse = view_proj.inverse();
    let height = (depth.len() / width as usize) as u32;

    depth
        .par_chunks_mut(width as usize)
        .zip(normal.par_chunks_mut(width as usize))
        .enumerate()
        .try_for_each(|(y, (depth_row, normal_row))| {
            for x in 0..width as usize {
                let ray = pixel_ray(&inverse, x as u32, y as u32, width, height);
                let hit = scene.traverse(&ray, false, |candidate| {
                    let surface = scene.surface(&ray, candidate)?;
                    let material = scene.material(surface.material_slot)?;
                    let base = surface.material_slot * DESCRIPTORS_PER_MATERIAL;
                    Ok(if scene.alpha_passes(material, base, surface.uv)? {
                        AnyHitVerdict::Accept
                    } else {
                        AnyHitVerdict::Ignore
                    })
                })?;
                let Some(hit) = hit else {
                    depth_row[x] = [1.0, 0.0, 0.0, 1.0];
                    normal_row[x] = [0.0; 4];
                    continue;
                };
                let surface = scene.surface(&ray, &hit)?;
                let material = scene.material(surface.material_slot)?;
                let reflectivity = if material.is_reflective() {
                    material.params[0]
                } else {
                    0.0
                };
                depth_row[x] = [view_proj.project_point3(surface.position).z, 0.0, 0.0, 1.0];
                normal_row[x] = surface.normal.extend(reflectivity).to_array();
            }
            Ok(())
        })
}
