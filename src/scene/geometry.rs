//! Static scene geometry: objects as byte ranges into shared buffers.

use std::ops::Range;

use crate::abi::{GeometryInfo, SceneVertex};
use crate::device::{BufferDesc, BufferId, BufferKind, RayDevice, TriangleGeometryDesc};
use crate::util::{Error, Result, Vec3};

use super::MaterialTable;

/// One static object. Byte ranges address the scene vertex and index buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryObject {
    pub id: u32,
    pub vertex_range: Range<u64>,
    pub index_range: Range<u64>,
    pub vertex_stride: u64,
    pub material_id: u32,
    pub triangle_count: u32,
}

impl GeometryObject {
    pub fn vertex_count(&self) -> u32 {
        ((self.vertex_range.end - self.vertex_range.start) / self.vertex_stride) as u32
    }

    pub fn index_count(&self) -> u32 {
        self.triangle_count * 3
    }

    /// Check the byte ranges describe whole vertices and triangles.
    pub fn validate(&self) -> Result<()> {
        if self.triangle_count == 0 {
            return Err(Error::EmptyGeometry { id: self.id });
        }
        if self.vertex_stride < SceneVertex::SIZE {
            return Err(Error::invalid_geometry(
                self.id,
                format!("vertex stride {} below {}", self.vertex_stride, SceneVertex::SIZE),
            ));
        }
        let vertex_bytes = self.vertex_range.end.saturating_sub(self.vertex_range.start);
        if vertex_bytes == 0 || vertex_bytes % self.vertex_stride != 0 {
            return Err(Error::invalid_geometry(
                self.id,
                format!("vertex range of {} bytes is not whole vertices", vertex_bytes),
            ));
        }
        let index_bytes = self.index_range.end.saturating_sub(self.index_range.start);
        if index_bytes != self.triangle_count as u64 * 12 {
            return Err(Error::invalid_geometry(
                self.id,
                format!(
                    "index range of {} bytes does not hold {} triangles",
                    index_bytes, self.triangle_count
                ),
            ));
        }
        Ok(())
    }

    /// Bottom-level build input for this object.
    pub fn triangle_desc(&self, vertex_buffer: BufferId, index_buffer: BufferId, opaque: bool) -> TriangleGeometryDesc {
        TriangleGeometryDesc {
            vertex_buffer,
            vertex_offset: self.vertex_range.start,
            vertex_count: self.vertex_count(),
            vertex_stride: self.vertex_stride,
            index_buffer,
            index_offset: self.index_range.start,
            index_count: self.index_count(),
            opaque,
        }
    }
}

/// Indexed triangle mesh before upload. Indices are local to the mesh.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<SceneVertex>,
    pub indices: Vec<u32>,
    pub material_id: u32,
}

impl Mesh {
    pub fn new(material_id: u32) -> Self {
        Self {
            material_id,
            ..Self::default()
        }
    }

    /// Append a planar quad `a b c d` (counter-clockwise seen from `normal`).
    pub fn push_quad(&mut self, corners: [Vec3; 4], normal: Vec3, uv_scale: f32) {
        let base = self.vertices.len() as u32;
        let uvs = [[0.0, 0.0], [uv_scale, 0.0], [uv_scale, uv_scale], [0.0, uv_scale]];
        for (corner, uv) in corners.iter().zip(uvs) {
            self.vertices.push(SceneVertex {
                position: corner.to_array(),
                normal: normal.to_array(),
                uv,
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    /// Append an axis-aligned box.
    pub fn push_box(&mut self, min: Vec3, max: Vec3) {
        let c = |x: f32, y: f32, z: f32| Vec3::new(x, y, z);
        let (a, b) = (min, max);
        self.push_quad([c(a.x, a.y, b.z), c(b.x, a.y, b.z), c(b.x, b.y, b.z), c(a.x, b.y, b.z)], Vec3::Z, 1.0);
        self.push_quad([c(b.x, a.y, a.z), c(a.x, a.y, a.z), c(a.x, b.y, a.z), c(b.x, b.y, a.z)], Vec3::NEG_Z, 1.0);
        self.push_quad([c(b.x, a.y, b.z), c(b.x, a.y, a.z), c(b.x, b.y, a.z), c(b.x, b.y, b.z)], Vec3::X, 1.0);
        self.push_quad([c(a.x, a.y, a.z), c(a.x, a.y, b.z), c(a.x, b.y, b.z), c(a.x, b.y, a.z)], Vec3::NEG_X, 1.0);
        self.push_quad([c(a.x, b.y, b.z), c(b.x, b.y, b.z), c(b.x, b.y, a.z), c(a.x, b.y, a.z)], Vec3::Y, 1.0);
        self.push_quad([c(a.x, a.y, a.z), c(b.x, a.y, a.z), c(b.x, a.y, b.z), c(a.x, a.y, b.z)], Vec3::NEG_Y, 1.0);
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Scene buffers on the device plus the object list addressing them.
#[derive(Debug, Clone)]
pub struct SceneGeometry {
    objects: Vec<GeometryObject>,
    /// Per object: built non-opaque (alpha-tested material).
    cutout: Vec<bool>,
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    /// `GeometryInfo` per object.
    pub geometry_info: BufferId,
    bounds_min: Vec3,
    bounds_max: Vec3,
}

impl SceneGeometry {
    /// Concatenate meshes into shared buffers and upload them.
    #[tracing::instrument(level = "debug", skip_all, fields(meshes = meshes.len()))]
    pub fn upload(device: &dyn RayDevice, meshes: &[Mesh], materials: &MaterialTable) -> Result<Self> {
        if meshes.is_empty() {
            return Err(Error::EmptyScene);
        }
        let mut vertices: Vec<SceneVertex> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        let mut objects = Vec::with_capacity(meshes.len());
        let mut infos = Vec::with_capacity(meshes.len());
        let mut cutout = Vec::with_capacity(meshes.len());
        let (mut bounds_min, mut bounds_max) = (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN));

        for (id, mesh) in meshes.iter().enumerate() {
            let id = id as u32;
            if let Some(&bad) = mesh.indices.iter().find(|&&i| i as usize >= mesh.vertices.len()) {
                return Err(Error::invalid_geometry(
                    id,
                    format!("index {} past {} vertices", bad, mesh.vertices.len()),
                ));
            }
            let slot = materials.slot(mesh.material_id)?;
            let vertex_start = vertices.len() as u64 * SceneVertex::SIZE;
            let index_start = indices.len() as u64 * 4;
            let object = GeometryObject {
                id,
                vertex_range: vertex_start..vertex_start + mesh.vertices.len() as u64 * SceneVertex::SIZE,
                index_range: index_start..index_start + mesh.indices.len() as u64 * 4,
                vertex_stride: SceneVertex::SIZE,
                material_id: mesh.material_id,
                triangle_count: mesh.triangle_count() as u32,
            };
            object.validate()?;

            for v in &mesh.vertices {
                let p = Vec3::from(v.position);
                bounds_min = bounds_min.min(p);
                bounds_max = bounds_max.max(p);
            }
            infos.push(GeometryInfo {
                vertex_offset: object.vertex_range.start as u32,
                vertex_stride: object.vertex_stride as u32,
                index_offset: object.index_range.start as u32,
                triangle_count: object.triangle_count,
                material_slot: slot,
                _pad: [0; 3],
            });
            cutout.push(materials.get(mesh.material_id).is_some_and(|m| m.cutout));
            vertices.extend_from_slice(&mesh.vertices);
            indices.extend_from_slice(&mesh.indices);
            objects.push(object);
        }

        let upload = |label: &str, bytes: &[u8]| -> Result<BufferId> {
            let buffer = device.create_buffer(&BufferDesc::new(label, bytes.len() as u64, BufferKind::Upload))?;
            device.write_buffer(buffer, 0, bytes)?;
            Ok(buffer)
        };
        let vertex_buffer = upload("scene_vertices", bytemuck::cast_slice(&vertices))?;
        let index_buffer = upload("scene_indices", bytemuck::cast_slice(&indices))?;
        let geometry_info = upload("geometry_info", bytemuck::cast_slice(&infos))?;

        tracing::debug!(
            objects = objects.len(),
            vertices = vertices.len(),
            triangles = indices.len() / 3,
            "scene geometry uploaded"
        );
        Ok(Self {
            objects,
            cutout,
            vertex_buffer,
            index_buffer,
            geometry_info,
            bounds_min,
            bounds_max,
        })
    }

    pub fn objects(&self) -> &[GeometryObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether an object's material is alpha-tested.
    pub fn is_cutout(&self, object: usize) -> bool {
        self.cutout.get(object).copied().unwrap_or(false)
    }

    /// Bounding sphere (center, radius) of all vertices.
    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        let center = (self.bounds_min + self.bounds_max) * 0.5;
        (center, (self.bounds_max - center).length().max(1e-3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::SoftwareDevice;
    use crate::scene::Material;

    fn object(triangles: u32) -> GeometryObject {
        GeometryObject {
            id: 4,
            vertex_range: 0..3 * SceneVertex::SIZE,
            index_range: 0..triangles as u64 * 12,
            vertex_stride: SceneVertex::SIZE,
            material_id: 0,
            triangle_count: triangles,
        }
    }

    #[test]
    fn test_zero_triangles_rejected() {
        assert!(matches!(object(0).validate(), Err(Error::EmptyGeometry { id: 4 })));
        assert!(object(1).validate().is_ok());
    }

    #[test]
    fn test_partial_vertex_range_rejected() {
        let mut o = object(1);
        o.vertex_range = 0..SceneVertex::SIZE * 3 - 4;
        assert!(matches!(o.validate(), Err(Error::InvalidGeometry { .. })));
    }

    #[test]
    fn test_box_mesh() {
        let mut mesh = Mesh::new(0);
        mesh.push_box(Vec3::ZERO, Vec3::ONE);
        assert_eq!(mesh.triangle_count(), 12);
        assert_eq!(mesh.vertices.len(), 24);
    }

    #[test]
    fn test_upload_offsets() {
        let device = SoftwareDevice::new();
        let materials = MaterialTable::new(vec![Material::new(7, "grey", [0.5; 4])]).expect("table");
        let mut a = Mesh::new(7);
        a.push_box(Vec3::ZERO, Vec3::ONE);
        let mut b = Mesh::new(7);
        b.push_quad([Vec3::ZERO, Vec3::X, Vec3::ONE, Vec3::Y], Vec3::Z, 1.0);
        let scene = SceneGeometry::upload(&device, &[a, b], &materials).expect("upload");
        let second = &scene.objects()[1];
        assert_eq!(second.vertex_range.start, 24 * SceneVertex::SIZE);
        assert_eq!(second.index_range.start, 36 * 4);
        assert_eq!(second.triangle_count, 2);
    }

    #[test]
    fn test_unknown_material_rejected() {
        let device = SoftwareDevice::new();
        let materials = MaterialTable::new(vec![]).expect("table");
        let mut mesh = Mesh::new(3);
        mesh.push_box(Vec3::ZERO, Vec3::ONE);
        let err = SceneGeometry::upload(&device, &[mesh], &materials).unwrap_err();
        assert!(matches!(err, Error::MaterialNotFound(3)));
    }
}
