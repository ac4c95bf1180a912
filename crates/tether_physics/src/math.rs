//! Host transform handling
//!
//! The host hands over affine transforms whose basis may carry a
//! non-uniform scale. The engine only understands rigid isometries, so every
//! transform is split into an orthonormal rotation, a translation and a
//! per-axis scale before it goes anywhere near a body.

use rapier3d::na::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Tolerance used when deciding that a scale or transform is the identity
pub const SCALE_EPSILON: f32 = 1e-4;

/// Affine transform as the host stores it: basis (rotation * scale) + origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3 {
    pub basis: Matrix3<f32>,
    pub origin: Vector3<f32>,
}

impl Default for Transform3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform3 {
    pub fn identity() -> Self {
        Self {
            basis: Matrix3::identity(),
            origin: Vector3::zeros(),
        }
    }

    /// Create from position only
    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        Self {
            basis: Matrix3::identity(),
            origin: Vector3::new(x, y, z),
        }
    }

    /// Create from a rigid transform
    pub fn from_isometry(isometry: &Isometry3<f32>) -> Self {
        Self {
            basis: *isometry.rotation.to_rotation_matrix().matrix(),
            origin: isometry.translation.vector,
        }
    }

    /// Recombine a rigid transform with a per-axis scale
    pub fn from_parts(isometry: &Isometry3<f32>, scale: &Vector3<f32>) -> Self {
        let rotation = isometry.rotation.to_rotation_matrix();
        Self {
            basis: rotation.matrix() * Matrix3::from_diagonal(scale),
            origin: isometry.translation.vector,
        }
    }

    /// Set scale (builder pattern)
    pub fn with_scale(self, scale: Vector3<f32>) -> Self {
        let (isometry, _) = self.decompose();
        Self::from_parts(&isometry, &scale)
    }

    /// Split into an orthonormal rigid transform and a per-axis scale.
    ///
    /// A mirrored basis (negative determinant) yields a negated scale so
    /// that the remaining basis is a proper rotation.
    pub fn decompose(&self) -> (Isometry3<f32>, Vector3<f32>) {
        let mut scale = Vector3::new(
            self.basis.column(0).norm(),
            self.basis.column(1).norm(),
            self.basis.column(2).norm(),
        );
        if self.basis.determinant() < 0.0 {
            scale = -scale;
        }

        let mut orthonormal = self.basis;
        for axis in 0..3 {
            if scale[axis].abs() > f32::EPSILON {
                let column = orthonormal.column(axis) / scale[axis];
                orthonormal.set_column(axis, &column);
            } else {
                let mut unit = Vector3::zeros();
                unit[axis] = 1.0;
                orthonormal.set_column(axis, &unit);
            }
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&orthonormal));
        let isometry = Isometry3::from_parts(Translation3::from(self.origin), rotation);
        (isometry, scale)
    }

    /// Transform a point
    pub fn transform_point(&self, point: &Vector3<f32>) -> Vector3<f32> {
        self.basis * point + self.origin
    }
}

/// True if every component is within tolerance of 1
pub fn is_unit_scale(scale: &Vector3<f32>) -> bool {
    (scale - Vector3::repeat(1.0)).amax() <= SCALE_EPSILON
}

/// True if all components share one magnitude
pub fn is_uniform_scale(scale: &Vector3<f32>) -> bool {
    let abs = scale.abs();
    abs.max() - abs.min() <= SCALE_EPSILON
}

/// True if the isometry neither rotates nor translates
pub fn is_identity_isometry(isometry: &Isometry3<f32>) -> bool {
    isometry.translation.vector.amax() <= SCALE_EPSILON
        && isometry.rotation.angle() <= SCALE_EPSILON
}

/// Express a scale given in an outer frame in the frame of `rotation`.
///
/// Exact for axis-aligned rotations; otherwise the best per-axis
/// approximation (each local axis picks up the outer scale it projects on).
pub fn scale_in_frame(rotation: &UnitQuaternion<f32>, scale: &Vector3<f32>) -> Vector3<f32> {
    let local = rotation.to_rotation_matrix().matrix().transpose();
    let mut out = Vector3::zeros();
    for row in 0..3 {
        let weights = local.row(row).abs();
        let total = weights.sum();
        out[row] = if total > f32::EPSILON {
            weights.iter().zip(scale.iter()).map(|(w, s)| w * s).sum::<f32>() / total
        } else {
            1.0
        };
    }
    out
}
