//! Acceleration structures of the software device.
//!
//! A bottom level is a SAH BVH over the triangles of all its geometries.
//! A top level is a BVH over instance bounds; each instance carries the
//! world-to-object transform used to move rays into bottom-level space.

use smallvec::SmallVec;

use super::build::{build_bvh, Bvh};
use super::bvh::{Aabb, BvhNode, Triangle, PACKED_TRIANGLE_SIZE};
use crate::device::{
    AccelInputs, BufferId, DeviceError, GpuAddress, InstanceDesc, PrebuildInfo,
    TriangleGeometryDesc,
};
use crate::util::{align_up, rows_to_affine, Affine3A, Vec3};

/// Acceleration structure sizes are rounded to this.
const ACCEL_ALIGNMENT: u64 = 256;
/// Per-triangle build scratch: bounds, centroid, index.
const SCRATCH_PER_TRIANGLE: u64 = 40;
const SCRATCH_PER_INSTANCE: u64 = InstanceDesc::SIZE;
const GEOMETRY_HEADER_SIZE: u64 = 16;

pub(crate) enum AccelStructure {
    Bottom(BottomLevel),
    Top(TopLevel),
}

pub(crate) struct BottomLevel {
    bvh: Bvh,
    /// Triangles in BVH leaf order.
    triangles: Vec<Triangle>,
    /// Per geometry.
    opaque: Vec<bool>,
    bounds: Aabb,
}

pub(crate) struct ResolvedInstance {
    pub ordinal: u32,
    pub desc: InstanceDesc,
    pub bottom_level: GpuAddress,
    pub world_to_object: Affine3A,
}

pub(crate) struct TopLevel {
    /// Instances that traversal visits, in ordinal order.
    resolved: Vec<ResolvedInstance>,
    bvh: Bvh,
}

/// Candidate intersection reported during traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub instance: u32,
    pub hit_group_offset: u32,
    pub geometry: u32,
    pub primitive: u32,
    pub t: f32,
    pub u: f32,
    pub v: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnyHitVerdict {
    Accept,
    Ignore,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TraceQuery {
    pub origin: Vec3,
    pub direction: Vec3,
    pub t_min: f32,
    pub t_max: f32,
    pub mask: u8,
    /// Stop at the first accepted hit instead of the closest one.
    pub accept_first: bool,
}

/// Size requirements for a build.
pub(crate) fn prebuild_info(inputs: &AccelInputs<'_>) -> PrebuildInfo {
    match inputs {
        AccelInputs::BottomLevel(geometries) => {
            let triangles: u64 = geometries.iter().map(|g| g.index_count as u64 / 3).sum();
            let nodes = Bvh::max_nodes(triangles as usize) as u64;
            PrebuildInfo {
                result_size: align_up(
                    nodes * BvhNode::SIZE
                        + triangles * PACKED_TRIANGLE_SIZE
                        + geometries.len() as u64 * GEOMETRY_HEADER_SIZE,
                    ACCEL_ALIGNMENT,
                ),
                scratch_size: align_up(triangles * SCRATCH_PER_TRIANGLE + 64, ACCEL_ALIGNMENT),
            }
        }
        AccelInputs::TopLevel { instance_count } => {
            let n = *instance_count as u64;
            let nodes = Bvh::max_nodes(n as usize) as u64;
            PrebuildInfo {
                result_size: align_up(n * InstanceDesc::SIZE + nodes * BvhNode::SIZE + 64, ACCEL_ALIGNMENT),
                scratch_size: align_up(n * SCRATCH_PER_INSTANCE + 64, ACCEL_ALIGNMENT),
            }
        }
    }
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    bytemuck::pod_read_unaligned(&bytes[..4])
}

#[inline]
fn read_vec3(bytes: &[u8]) -> [f32; 3] {
    bytemuck::pod_read_unaligned(&bytes[..12])
}

impl BottomLevel {
    /// Build from triangle geometries. `fetch` returns `len` bytes of a buffer at `offset`.
    pub fn build<'a, F>(geometries: &[TriangleGeometryDesc], fetch: F) -> Result<Self, DeviceError>
    where
        F: Fn(BufferId, u64, u64) -> Result<&'a [u8], DeviceError>,
    {
        let mut source = Vec::new();
        for (g, geom) in geometries.iter().enumerate() {
            let vertices = fetch(
                geom.vertex_buffer,
                geom.vertex_offset,
                geom.vertex_count as u64 * geom.vertex_stride,
            )?;
            let indices = fetch(geom.index_buffer, geom.index_offset, geom.index_count as u64 * 4)?;
            let vertex_count = geom.vertex_count as u64;
            let position = |idx: u32| -> Result<[f32; 3], DeviceError> {
                if idx as u64 >= vertex_count {
                    return Err(DeviceError::OutOfBounds {
                        offset: idx as u64 * geom.vertex_stride,
                        len: 12,
                        size: vertices.len() as u64,
                    });
                }
                let at = (idx as u64 * geom.vertex_stride) as usize;
                Ok(read_vec3(&vertices[at..]))
            };
            for prim in 0..geom.index_count / 3 {
                let base = prim as usize * 12;
                source.push(Triangle {
                    v0: position(read_u32(&indices[base..]))?,
                    v1: position(read_u32(&indices[base + 4..]))?,
                    v2: position(read_u32(&indices[base + 8..]))?,
                    geometry: g as u32,
                    primitive: prim,
                });
            }
        }

        let bounds: Vec<Aabb> = source.iter().map(Triangle::aabb).collect();
        let bvh = build_bvh(&bounds);
        let triangles = bvh.prim_indices.iter().map(|&i| source[i].clone()).collect();
        let mut total = Aabb::EMPTY;
        bounds.iter().for_each(|b| total.grow(b));

        Ok(Self {
            bvh,
            triangles,
            opaque: geometries.iter().map(|g| g.opaque).collect(),
            bounds: total,
        })
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Walk the BVH, committing hits into `best`. Returns true when traversal
    /// should terminate (accept-first hit committed).
    fn traverse<F>(
        &self,
        instance: &ResolvedInstance,
        origin: Vec3,
        direction: Vec3,
        query: &TraceQuery,
        best: &mut Option<Candidate>,
        any_hit: &mut F,
    ) -> Result<bool, DeviceError>
    where
        F: FnMut(&Candidate) -> Result<AnyHitVerdict, DeviceError>,
    {
        let inv_dir = direction.recip();
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(0);

        while let Some(node_idx) = stack.pop() {
            let node = &self.bvh.nodes[node_idx as usize];
            let t_max = best.map_or(query.t_max, |b| b.t);
            if node.bounds().hit(origin, inv_dir, query.t_min, t_max).is_none() {
                continue;
            }
            if !node.is_leaf() {
                stack.push(node.left_or_first + 1);
                stack.push(node.left_or_first);
                continue;
            }
            let first = node.left_or_first as usize;
            for tri in &self.triangles[first..first + node.count as usize] {
                let t_max = best.map_or(query.t_max, |b| b.t);
                let Some((t, u, v)) = tri.intersect(origin, direction, query.t_min, t_max) else {
                    continue;
                };
                let candidate = Candidate {
                    instance: instance.ordinal,
                    hit_group_offset: instance.desc.hit_group_offset(),
                    geometry: tri.geometry,
                    primitive: tri.primitive,
                    t,
                    u,
                    v,
                };
                let opaque = self.opaque.get(tri.geometry as usize).copied().unwrap_or(true);
                if !opaque && any_hit(&candidate)? == AnyHitVerdict::Ignore {
                    continue;
                }
                *best = Some(candidate);
                if query.accept_first {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl TopLevel {
    /// Build from instance descriptors. `bottom` resolves a bottom-level address.
    ///
    /// Instances identical to an earlier one (same bottom level, transform and
    /// mask) produce coincident hits; they are recorded but not traversed, so
    /// the lowest ordinal reports the hit.
    pub fn build<'a, F>(instances: Vec<InstanceDesc>, bottom: F) -> Result<Self, DeviceError>
    where
        F: Fn(GpuAddress) -> Option<&'a BottomLevel>,
    {
        let mut resolved: Vec<ResolvedInstance> = Vec::with_capacity(instances.len());
        let mut bounds = Vec::with_capacity(instances.len());
        for (ordinal, desc) in instances.iter().enumerate() {
            let Some(blas) = bottom(desc.bottom_level) else {
                return Err(DeviceError::NotAccelerationStructure((desc.bottom_level.0 >> 32) as u32));
            };
            let duplicate = resolved.iter().any(|r| {
                r.bottom_level == desc.bottom_level
                    && r.desc.transform == desc.transform
                    && r.desc.mask() == desc.mask()
            });
            if duplicate {
                continue;
            }
            let object_to_world = rows_to_affine(&desc.transform);
            bounds.push(blas.bounds.transformed(&object_to_world));
            resolved.push(ResolvedInstance {
                ordinal: ordinal as u32,
                desc: *desc,
                bottom_level: desc.bottom_level,
                world_to_object: object_to_world.inverse(),
            });
        }
        tracing::debug!(
            instances = instances.len(),
            traversed = resolved.len(),
            "top level built"
        );

        Ok(Self {
            bvh: build_bvh(&bounds),
            resolved,
        })
    }

    pub fn instance(&self, ordinal: u32) -> Option<&ResolvedInstance> {
        self.resolved.iter().find(|r| r.ordinal == ordinal)
    }

    /// Find the closest (or first, with `accept_first`) accepted hit.
    pub fn traverse<'a, B, F>(
        &self,
        bottom: B,
        query: &TraceQuery,
        mut any_hit: F,
    ) -> Result<Option<Candidate>, DeviceError>
    where
        B: Fn(GpuAddress) -> Option<&'a BottomLevel>,
        F: FnMut(&Candidate) -> Result<AnyHitVerdict, DeviceError>,
    {
        let mut best: Option<Candidate> = None;
        if self.resolved.is_empty() {
            return Ok(None);
        }
        let inv_dir = query.direction.recip();
        let mut stack: SmallVec<[u32; 32]> = SmallVec::new();
        stack.push(0);

        while let Some(node_idx) = stack.pop() {
            let node = &self.bvh.nodes[node_idx as usize];
            let t_max = best.map_or(query.t_max, |b| b.t);
            if node.bounds().hit(query.origin, inv_dir, query.t_min, t_max).is_none() {
                continue;
            }
            if !node.is_leaf() {
                stack.push(node.left_or_first + 1);
                stack.push(node.left_or_first);
                continue;
            }
            let first = node.left_or_first as usize;
            for &slot in &self.bvh.prim_indices[first..first + node.count as usize] {
                let instance = &self.resolved[slot];
                if instance.desc.mask() & query.mask == 0 {
                    continue;
                }
                let Some(blas) = bottom(instance.bottom_level) else {
                    return Err(DeviceError::NotAccelerationStructure(
                        (instance.bottom_level.0 >> 32) as u32,
                    ));
                };
                let origin = instance.world_to_object.transform_point3(query.origin);
                let direction = instance.world_to_object.transform_vector3(query.direction);
                if blas.traverse(instance, origin, direction, query, &mut best, &mut any_hit)? {
                    return Ok(best);
                }
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_bytes(z: f32) -> (Vec<u8>, Vec<u8>) {
        let verts: [[f32; 3]; 4] = [[-1.0, -1.0, z], [1.0, -1.0, z], [1.0, 1.0, z], [-1.0, 1.0, z]];
        let idx: [u32; 6] = [0, 1, 2, 0, 2, 3];
        (bytemuck::cast_slice(&verts).to_vec(), bytemuck::cast_slice(&idx).to_vec())
    }

    fn geometry(opaque: bool, vertex_offset: u64, index_offset: u64) -> TriangleGeometryDesc {
        TriangleGeometryDesc {
            vertex_buffer: BufferId(0),
            vertex_offset,
            vertex_count: 4,
            vertex_stride: 12,
            index_buffer: BufferId(1),
            index_offset,
            index_count: 6,
            opaque,
        }
    }

    fn two_quads() -> BottomLevel {
        let (mut v, mut i) = quad_bytes(0.0);
        let (v2, i2) = quad_bytes(-2.0);
        v.extend_from_slice(&v2);
        i.extend_from_slice(&i2);
        let geoms = [geometry(true, 0, 0), geometry(false, 48, 24)];
        let (v, i) = (&v, &i);
        BottomLevel::build(&geoms, move |buffer, offset, len| {
            let data: &[u8] = if buffer == BufferId(0) { v } else { i };
            Ok(&data[offset as usize..(offset + len) as usize])
        })
        .expect("bottom level builds")
    }

    fn query() -> TraceQuery {
        TraceQuery {
            origin: Vec3::new(0.2, 0.1, 5.0),
            direction: Vec3::NEG_Z,
            t_min: 0.0,
            t_max: f32::MAX,
            mask: 0xff,
            accept_first: false,
        }
    }

    #[test]
    fn test_prebuild_sizes_cover_build() {
        let geoms = [geometry(true, 0, 0)];
        let info = prebuild_info(&AccelInputs::BottomLevel(&geoms));
        assert!(info.result_size >= 4 * BvhNode::SIZE + 2 * PACKED_TRIANGLE_SIZE);
        assert_eq!(info.result_size % ACCEL_ALIGNMENT, 0);
        let top = prebuild_info(&AccelInputs::TopLevel { instance_count: 37 });
        assert!(top.scratch_size >= 37 * InstanceDesc::SIZE);
    }

    #[test]
    fn test_closest_hit_and_duplicates() {
        let blas = two_quads();
        assert_eq!(blas.triangle_count(), 4);
        let addr = GpuAddress(1 << 32);
        let desc = |i: u32| InstanceDesc::new(&Affine3A::IDENTITY, i, 1, i, addr);
        let tlas = TopLevel::build(vec![desc(0), desc(1)], |_| Some(&blas)).expect("top level builds");
        assert!(tlas.instance(0).is_some());
        assert!(tlas.instance(1).is_none(), "coincident instance is not traversed");

        let hit = tlas
            .traverse(|_| Some(&blas), &query(), |_| Ok(AnyHitVerdict::Accept))
            .expect("traversal succeeds")
            .expect("ray hits the front quad");
        assert_eq!(hit.geometry, 0);
        assert_eq!(hit.instance, 0);
        assert!((hit.t - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_any_hit_only_for_non_opaque() {
        let blas = two_quads();
        let addr = GpuAddress(1 << 32);
        let tlas = TopLevel::build(
            vec![InstanceDesc::new(&Affine3A::IDENTITY, 0, 1, 0, addr)],
            |_| Some(&blas),
        )
        .expect("top level builds");

        // Ray from behind: hits the non-opaque back quad first
        let mut q = query();
        q.origin = Vec3::new(0.2, 0.1, -5.0);
        q.direction = Vec3::Z;
        let mut calls = 0;
        let hit = tlas
            .traverse(|_| Some(&blas), &q, |c| {
                calls += 1;
                assert_eq!(c.geometry, 1);
                Ok(AnyHitVerdict::Ignore)
            })
            .expect("traversal succeeds")
            .expect("opaque front quad still hit");
        assert_eq!(calls, 1);
        assert_eq!(hit.geometry, 0);
    }

    #[test]
    fn test_mask_filters_instances() {
        let blas = two_quads();
        let addr = GpuAddress(1 << 32);
        let tlas = TopLevel::build(
            vec![InstanceDesc::new(&Affine3A::IDENTITY, 0, 0b10, 0, addr)],
            |_| Some(&blas),
        )
        .expect("top level builds");
        let mut q = query();
        q.mask = 0b01;
        let hit = tlas
            .traverse(|_| Some(&blas), &q, |_| Ok(AnyHitVerdict::Accept))
            .expect("traversal succeeds");
        assert!(hit.is_none());
    }
}
