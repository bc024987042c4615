//! Procedural test scene used by the CLI and the tests.

use super::{CameraSet, CameraView, Material, MaterialTable, Mesh, TextureData};
use crate::util::{Result, Vec3};

pub const FLOOR: u32 = 0;
pub const STONE: u32 = 1;
pub const MIRROR: u32 = 2;
pub const FOLIAGE: u32 = 3;

/// Meshes, materials and cameras of a static scene, before upload.
#[derive(Debug, Clone)]
pub struct DemoScene {
    pub meshes: Vec<Mesh>,
    pub materials: MaterialTable,
    pub cameras: CameraSet,
}

fn materials() -> Result<MaterialTable> {
    MaterialTable::new(vec![
        Material::new(FLOOR, "floor", [0.8, 0.8, 0.8, 1.0]).with_diffuse(TextureData::checker(
            16,
            4,
            [1.0, 1.0, 1.0, 1.0],
            [0.3, 0.3, 0.3, 1.0],
        )),
        Material::new(STONE, "stone", [0.7, 0.45, 0.3, 1.0]),
        Material::new(MIRROR, "mirror", [0.9, 0.9, 0.95, 1.0])
            .with_reflectivity(0.8)
            .with_specular(TextureData::solid([1.0, 1.0, 1.0, 1.0])),
        // Alternating opaque and fully transparent cells
        Material::new(FOLIAGE, "foliage", [0.3, 0.7, 0.3, 1.0]).with_cutout(
            TextureData::checker(8, 4, [1.0, 1.0, 1.0, 1.0], [1.0, 1.0, 1.0, 0.0]),
            0.5,
        ),
    ])
}

fn cameras() -> CameraSet {
    CameraSet::new(vec![
        CameraView::look_at(Vec3::new(0.0, 3.0, 8.0), Vec3::new(0.0, 0.5, 0.0)),
        CameraView::look_at(Vec3::new(6.0, 4.0, 2.0), Vec3::ZERO),
    ])
}

fn floor(half: f32) -> Mesh {
    let mut mesh = Mesh::new(FLOOR);
    mesh.push_quad(
        [
            Vec3::new(-half, 0.0, half),
            Vec3::new(half, 0.0, half),
            Vec3::new(half, 0.0, -half),
            Vec3::new(-half, 0.0, -half),
        ],
        Vec3::Y,
        half,
    );
    mesh
}

fn cube(material_id: u32, center: Vec3, half: f32) -> Mesh {
    let mut mesh = Mesh::new(material_id);
    mesh.push_box(center - Vec3::splat(half), center + Vec3::splat(half));
    mesh
}

/// Floor, two stone blocks, a mirror block and an alpha-tested panel.
pub fn demo_scene() -> Result<DemoScene> {
    let mut panel = Mesh::new(FOLIAGE);
    panel.push_quad(
        [
            Vec3::new(-2.5, 0.0, 1.5),
            Vec3::new(-0.5, 0.0, 1.5),
            Vec3::new(-0.5, 2.0, 1.5),
            Vec3::new(-2.5, 2.0, 1.5),
        ],
        Vec3::Z,
        1.0,
    );
    Ok(DemoScene {
        meshes: vec![
            floor(6.0),
            cube(STONE, Vec3::new(-1.5, 0.5, -0.5), 0.5),
            cube(STONE, Vec3::new(1.8, 0.75, 0.5), 0.75),
            cube(MIRROR, Vec3::new(0.0, 1.0, -2.0), 1.0),
            panel,
        ],
        materials: materials()?,
        cameras: cameras(),
    })
}

/// A floor plus `objects - 1` small blocks on a grid, cycling materials.
pub fn grid_scene(objects: usize) -> Result<DemoScene> {
    let mut meshes = vec![floor(8.0)];
    let side = (objects as f32).sqrt().ceil().max(1.0) as usize;
    let spacing = 12.0 / side as f32;
    for i in 0..objects.saturating_sub(1) {
        let (gx, gz) = ((i % side) as f32, (i / side) as f32);
        let center = Vec3::new(
            -6.0 + spacing * (gx + 0.5),
            0.3,
            -6.0 + spacing * (gz + 0.5),
        );
        let material = [STONE, MIRROR, STONE, FOLIAGE][i % 4];
        meshes.push(cube(material, center, (spacing * 0.3).min(0.3)));
    }
    Ok(DemoScene {
        meshes,
        materials: materials()?,
        cameras: cameras(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_scene_materials_resolve() {
        let scene = demo_scene().expect("scene");
        for mesh in &scene.meshes {
            assert!(scene.materials.slot(mesh.material_id).is_ok());
            assert!(mesh.triangle_count() > 0);
        }
    }

    #[test]
    fn test_grid_scene_object_count() {
        assert_eq!(grid_scene(37).expect("scene").meshes.len(), 37);
        assert_eq!(grid_scene(1).expect("scene").meshes.len(), 1);
    }
}
