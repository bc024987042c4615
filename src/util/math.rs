//! Math re-exports and alignment helpers.

pub use glam::{Affine3A, Mat3, Mat4, UVec2, Vec2, Vec3, Vec3A, Vec4};

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero. Power-of-two is not required.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Whether `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value % alignment == 0
}

/// Pack an affine transform into the 3x4 row-major layout used by
/// top-level instance descriptors.
pub fn affine_to_rows(transform: &Affine3A) -> [f32; 12] {
    let m = Mat4::from(*transform).transpose();
    let r = m.to_cols_array();
    [
        r[0], r[1], r[2], r[3], //
        r[4], r[5], r[6], r[7], //
        r[8], r[9], r[10], r[11],
    ]
}

/// Inverse of [`affine_to_rows`].
pub fn rows_to_affine(rows: &[f32; 12]) -> Affine3A {
    let m = Mat4::from_cols_array(&[
        rows[0], rows[1], rows[2], rows[3], //
        rows[4], rows[5], rows[6], rows[7], //
        rows[8], rows[9], rows[10], rows[11], //
        0.0, 0.0, 0.0, 1.0,
    ])
    .transpose();
    Affine3A::from_mat4(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(44, 32), 64);
        assert_eq!(align_up(64, 32), 64);
        assert_eq!(align_up(10, 12), 12);
    }

    #[test]
    fn test_transform_rows_roundtrip() {
        let t = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = affine_to_rows(&t);
        // translation sits in the last column of each row
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        assert_eq!(rows_to_affine(&rows), t);
    }
}
