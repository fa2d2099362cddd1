//! Math aliases and small numeric helpers.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// 3-vector used for positions, velocities and forces.
pub type Vec3 = Vector3<f32>;

/// 3x3 rotation matrix.
pub type Mat3 = Matrix3<f32>;

/// RGB color with components in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Color {
    /// Red component.
    pub r: f32,
    /// Green component.
    pub g: f32,
    /// Blue component.
    pub b: f32,
}

impl Color {
    /// Create a color, clamping each component to [0, 1].
    #[must_use]
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self {
            r: r.clamp(0.0, 1.0),
            g: g.clamp(0.0, 1.0),
            b: b.clamp(0.0, 1.0),
        }
    }

    /// Mid-grey default used for newly created objects.
    #[must_use]
    pub const fn grey() -> Self {
        Self { r: 0.5, g: 0.5, b: 0.5 }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::grey()
    }
}

/// Check that every component of a vector is finite.
#[must_use]
pub fn is_finite(v: &Vec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

/// Replace a non-finite vector with zero, reporting whether it was clamped.
#[must_use]
pub fn sanitize(v: Vec3) -> (Vec3, bool) {
    if is_finite(&v) {
        (v, false)
    } else {
        (Vec3::zeros(), true)
    }
}

/// Build a rotation matrix from nine row-major floats.
#[must_use]
pub fn mat3_from_row_major(m: &[f32; 9]) -> Mat3 {
    Mat3::new(m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8])
}

/// Flatten a rotation matrix to nine row-major floats.
#[must_use]
pub fn mat3_to_row_major(m: &Mat3) -> [f32; 9] {
    [
        m[(0, 0)], m[(0, 1)], m[(0, 2)],
        m[(1, 0)], m[(1, 1)], m[(1, 2)],
        m[(2, 0)], m[(2, 1)], m[(2, 2)],
    ]
}
