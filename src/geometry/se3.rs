//! SE(3) rigid-body transform built on a unit quaternion + translation.
//!
//! All camera and submap poses in this crate are SE3 values. Global poses
//! map submap-local coordinates into the world frame; local poses map a
//! frame's camera space into its submap's frame-0 space.

use nalgebra::{Matrix4, UnitQuaternion, Vector3};

/// Rigid-body transform in SE(3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Compose two transforms: `self * other` (apply `other` first).
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Homogeneous 4x4 matrix form.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        let t = SE3::identity();
        assert_relative_eq!(t.transform_point(&p), p);
    }

    #[test]
    fn test_compose_then_inverse() {
        let a = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, 0.0, -2.0),
        );
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(-0.3, 0.1, 0.0),
            Vector3::new(0.5, 0.5, 0.5),
        );
        let p = Vector3::new(-1.0, 4.0, 2.0);

        let composed = a.compose(&b);
        assert_relative_eq!(
            composed.transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );

        let round_trip = composed.inverse().transform_point(&composed.transform_point(&p));
        assert_relative_eq!(round_trip, p, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_form_matches_point_transform() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.4, -0.1),
            Vector3::new(-0.5, 1.0, 2.0),
        );
        let p = Vector3::new(3.0, -1.0, 0.5);
        let homogeneous = t.to_matrix() * p.push(1.0);
        assert_relative_eq!(homogeneous.xyz(), t.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_quarter_turn() {
        let t = SE3::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2),
            Vector3::zeros(),
        );
        let p = t.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }
}
