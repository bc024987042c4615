//! Cameras supplied by the camera collaborator.

use crate::util::{Error, Mat4, Result, Vec3};

/// A look-at perspective camera. Depth maps to 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical FOV in degrees
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

/// Matrices of one camera at one aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_proj: Mat4,
    pub inverse_view_proj: Mat4,
    pub position: Vec3,
}

impl CameraView {
    pub fn look_at(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
            fov: 45.0,
            near: 0.1,
            far: 100.0,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov.to_radians(), aspect, self.near, self.far)
    }

    pub fn matrices(&self, aspect: f32) -> CameraMatrices {
        let view = self.view_matrix();
        let projection = self.projection_matrix(aspect);
        let view_proj = projection * view;
        CameraMatrices {
            view,
            projection,
            view_proj,
            inverse_view_proj: view_proj.inverse(),
            position: self.position,
        }
    }
}

impl Default for CameraView {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO)
    }
}

/// Indexed camera list.
#[derive(Debug, Clone, Default)]
pub struct CameraSet {
    cameras: Vec<CameraView>,
}

impl CameraSet {
    pub fn new(cameras: Vec<CameraView>) -> Self {
        Self { cameras }
    }

    pub fn get(&self, index: usize) -> Result<&CameraView> {
        self.cameras.get(index).ok_or(Error::CameraOutOfBounds {
            index,
            count: self.cameras.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_maps_target_to_screen_center() {
        let camera = CameraView::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let m = camera.matrices(1.0);
        let ndc = m.view_proj.project_point3(Vec3::ZERO);
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!((0.0..1.0).contains(&ndc.z));
        let back = m.inverse_view_proj.project_point3(ndc);
        assert!(back.length() < 1e-3);
    }

    #[test]
    fn test_camera_index_bounds() {
        let set = CameraSet::new(vec![CameraView::default()]);
        assert!(set.get(0).is_ok());
        assert!(matches!(
            set.get(2),
            Err(Error::CameraOutOfBounds { index: 2, count: 1 })
        ));
    }
}
