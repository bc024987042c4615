//! Startup surface of the ray-query subsystem.

use crate::accel::{SpatialIndex, SpatialIndexBuilder};
use crate::device::software::RasterScene;
use crate::device::{supports_ray_queries, ProgramLibrary, RayDevice};
use crate::records::RecordTables;
use crate::scene::{MaterialBindings, MaterialTable, Mesh, SceneGeometry};
use crate::technique::TechniqueRegistry;
use crate::util::{Error, Result};

/// Everything built once at startup. Lives for the process lifetime.
#[derive(Debug)]
pub struct RaySubsystem {
    geometry: SceneGeometry,
    materials: MaterialBindings,
    index: SpatialIndex,
    techniques: TechniqueRegistry,
    records: RecordTables,
}

impl RaySubsystem {
    /// Upload the scene and build the index, techniques and record tables.
    ///
    /// Fails with [`Error::Unsupported`] on a device without ray queries;
    /// every other error is a fatal construction failure.
    #[tracing::instrument(level = "info", skip_all, fields(objects = meshes.len()))]
    pub fn initialize(
        device: &dyn RayDevice,
        meshes: &[Mesh],
        materials: &MaterialTable,
        library: &ProgramLibrary,
    ) -> Result<Self> {
        let caps = device.caps();
        if !caps.ray_queries {
            return Err(Error::Unsupported(caps.name.clone()));
        }
        let geometry = SceneGeometry::upload(device, meshes, materials)?;
        let bindings = materials.upload(device)?;
        let index = SpatialIndexBuilder::new(device).build(&geometry)?;
        let techniques = TechniqueRegistry::build(device, library)?;
        let records = RecordTables::build(device, &techniques, &geometry, materials, &bindings)?;
        tracing::info!(
            objects = geometry.len(),
            materials = materials.len(),
            "ray subsystem ready"
        );
        Ok(Self {
            geometry,
            materials: bindings,
            index,
            techniques,
            records,
        })
    }

    pub fn geometry(&self) -> &SceneGeometry {
        &self.geometry
    }

    pub fn materials(&self) -> &MaterialBindings {
        &self.materials
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn techniques(&self) -> &TechniqueRegistry {
        &self.techniques
    }

    pub fn records(&self) -> &RecordTables {
        &self.records
    }

    /// Scene resources the reference raster passes read.
    pub fn raster_scene(&self) -> RasterScene {
        RasterScene {
            top_level: self.index.top_level(),
            geometry_info: self.geometry.geometry_info,
            materials: self.materials.materials,
            vertex_buffer: self.geometry.vertex_buffer,
            index_buffer: self.geometry.index_buffer,
            descriptors: self.materials.heap,
        }
    }
}

/// Probe once, then initialize only when rays are available.
///
/// `Ok(None)` means the process runs raster only for its whole lifetime.
pub fn probe_and_initialize(
    device: &dyn RayDevice,
    meshes: &[Mesh],
    materials: &MaterialTable,
    library: &ProgramLibrary,
) -> Result<Option<RaySubsystem>> {
    if !supports_ray_queries(device) {
        return Ok(None);
    }
    RaySubsystem::initialize(device, meshes, materials, library).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::{builtin_library, SoftwareDevice};
    use crate::scene::demo;
    use crate::technique::TechniqueId;

    #[test]
    fn test_initialize_demo_scene() {
        let device = SoftwareDevice::new();
        let scene = demo::demo_scene().expect("scene");
        let subsystem =
            RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).expect("init");
        assert_eq!(subsystem.index().instance_count() as usize, scene.meshes.len());
        for id in TechniqueId::ALL {
            let table = subsystem.records().get(id);
            assert_eq!(table.technique(), id);
            assert_eq!(table.len(), scene.meshes.len());
            assert_eq!(table.byte_len(), table.stride() * scene.meshes.len() as u64);
        }
    }

    #[test]
    fn test_raster_only_device_skips_init() {
        let device = SoftwareDevice::without_ray_queries();
        let scene = demo::demo_scene().expect("scene");
        let result = probe_and_initialize(&device, &scene.meshes, &scene.materials, &builtin_library());
        assert!(matches!(result, Ok(None)));

        let err = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library()).unwrap_err();
        assert_eq!(err.kind(), crate::util::ErrorKind::CapabilityAbsent);
    }
}
