//! BVH node and primitive types for the software tracer.
//!
//! Flat array layout:
//! - 32-byte nodes (same layout GPU traversal kernels use)
//! - Triangles carry their geometry and primitive index

use bytemuck::{Pod, Zeroable};

use crate::util::{Affine3A, Vec3};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Grow to include another AABB.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Surface area (for SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        let d = self.extent();
        2.0 * (d[0] * d[1] + d[1] * d[2] + d[2] * d[0])
    }

    #[inline]
    fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Centroid of the AABB.
    #[inline]
    pub fn centroid(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    /// Bounds of this box after an affine transform (all 8 corners).
    pub fn transformed(&self, transform: &Affine3A) -> Aabb {
        let mut out = Aabb::EMPTY;
        for corner in 0..8 {
            let p = Vec3::new(
                if corner & 1 == 0 { self.min[0] } else { self.max[0] },
                if corner & 2 == 0 { self.min[1] } else { self.max[1] },
                if corner & 4 == 0 { self.min[2] } else { self.max[2] },
            );
            out.grow_point(transform.transform_point3(p).to_array());
        }
        out
    }

    /// Slab test. Returns entry distance when the ray overlaps `[t_min, t_max]`.
    #[inline]
    pub fn hit(&self, origin: Vec3, inv_dir: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
        let mut t0 = t_min;
        let mut t1 = t_max;
        for i in 0..3 {
            let near = (self.min[i] - origin[i]) * inv_dir[i];
            let far = (self.max[i] - origin[i]) * inv_dir[i];
            let (near, far) = if near <= far { (near, far) } else { (far, near) };
            // NaN from 0 * inf keeps the current interval
            if near > t0 {
                t0 = near;
            }
            if far < t1 {
                t1 = far;
            }
            if t0 > t1 {
                return None;
            }
        }
        Some(t0)
    }
}

/// BVH node (32 bytes).
///
/// Internal node: left_or_first = left child index, count = 0
/// Leaf node: left_or_first = first primitive index, count > 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub(crate) fn leaf(bounds: &Aabb, first: usize, count: usize) -> Self {
        Self {
            aabb_min: bounds.min,
            left_or_first: first as u32,
            aabb_max: bounds.max,
            count: count as u32,
        }
    }

    pub(crate) fn interior(bounds: &Aabb, left: usize) -> Self {
        Self {
            aabb_min: bounds.min,
            left_or_first: left as u32,
            aabb_max: bounds.max,
            count: 0,
        }
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: self.aabb_min,
            max: self.aabb_max,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Object-space triangle inside a bottom-level structure.
#[derive(Debug, Clone)]
pub struct Triangle {
    pub v0: [f32; 3],
    pub v1: [f32; 3],
    pub v2: [f32; 3],
    /// Index of the geometry within the bottom-level build.
    pub geometry: u32,
    /// Triangle index within its geometry.
    pub primitive: u32,
}

/// Packed triangle size used for result-size estimates.
pub const PACKED_TRIANGLE_SIZE: u64 = 48;

impl Triangle {
    /// Compute AABB of this triangle.
    pub fn aabb(&self) -> Aabb {
        let mut b = Aabb::EMPTY;
        b.grow_point(self.v0);
        b.grow_point(self.v1);
        b.grow_point(self.v2);
        b
    }

    /// Moller-Trumbore. Returns `(t, u, v)` with barycentrics of v1 and v2.
    /// Both faces are hit.
    #[inline]
    pub fn intersect(&self, origin: Vec3, dir: Vec3, t_min: f32, t_max: f32) -> Option<(f32, f32, f32)> {
        let v0 = Vec3::from(self.v0);
        let e1 = Vec3::from(self.v1) - v0;
        let e2 = Vec3::from(self.v2) - v0;
        let p = dir.cross(e2);
        let det = e1.dot(p);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = origin - v0;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(e1);
        let v = dir.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = e2.dot(q) * inv_det;
        if t < t_min || t >= t_max {
            return None;
        }
        Some((t, u, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_hit_and_miss() {
        let tri = Triangle {
            v0: [-1.0, -1.0, 0.0],
            v1: [1.0, -1.0, 0.0],
            v2: [0.0, 1.0, 0.0],
            geometry: 0,
            primitive: 0,
        };
        let hit = tri.intersect(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 0.0, f32::MAX);
        let (t, u, v) = hit.expect("ray through the centre hits");
        assert!((t - 5.0).abs() < 1e-6);
        assert!(u >= 0.0 && v >= 0.0 && u + v <= 1.0);

        assert!(tri.intersect(Vec3::new(3.0, 0.0, 5.0), Vec3::NEG_Z, 0.0, f32::MAX).is_none());
        // t_max excludes the hit
        assert!(tri.intersect(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, 0.0, 4.0).is_none());
    }

    #[test]
    fn test_aabb_slab() {
        let b = Aabb { min: [-1.0; 3], max: [1.0; 3] };
        let dir = Vec3::NEG_Z;
        let t = b.hit(Vec3::new(0.0, 0.0, 5.0), dir.recip(), 0.0, f32::MAX);
        assert_eq!(t, Some(4.0));
        assert!(b.hit(Vec3::new(2.0, 0.0, 5.0), dir.recip(), 0.0, f32::MAX).is_none());
    }

    #[test]
    fn test_transformed_bounds() {
        let b = Aabb { min: [0.0; 3], max: [1.0; 3] };
        let moved = b.transformed(&Affine3A::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(moved.min, [2.0, 0.0, 0.0]);
        assert_eq!(moved.max, [3.0, 1.0, 1.0]);
    }
}
