//! Directional sun light and its shadow-map projection.

use crate::util::{Mat4, Vec3};

/// Orthographic light view-projection covering a bounding sphere.
pub fn sun_view_proj(light_dir: Vec3, scene_center: Vec3, scene_radius: f32) -> Mat4 {
    let dir = light_dir.normalize_or(Vec3::NEG_Y);
    let light_pos = scene_center - dir * scene_radius * 2.0;
    // look_at degenerates when the light points straight down
    let up = if dir.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let view = Mat4::look_at_rh(light_pos, scene_center, up);
    let proj = Mat4::orthographic_rh(
        -scene_radius,
        scene_radius,
        -scene_radius,
        scene_radius,
        0.1,
        scene_radius * 4.0,
    );
    proj * view
}
