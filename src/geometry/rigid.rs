//! Minimum-residual rigid alignment between 3D point sets (Kabsch).
//!
//! Used by the geometric keypoint filter to estimate a relative transform
//! from a set of correspondences and to measure per-correspondence
//! residuals against it.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// Fit the rigid transform minimizing `sum |T * src[i] - dst[i]|^2`.
///
/// Returns `None` for fewer than 3 correspondences or a degenerate
/// (rank-deficient) configuration.
pub fn fit_rigid(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> Option<SE3> {
    if src.len() < 3 || src.len() != dst.len() {
        return None;
    }
    let n = src.len() as f64;

    let centroid_src: Vector3<f64> = src.iter().sum::<Vector3<f64>>() / n;
    let centroid_dst: Vector3<f64> = dst.iter().sum::<Vector3<f64>>() / n;

    let mut cov = Matrix3::<f64>::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        cov += (d - centroid_dst) * (s - centroid_src).transpose();
    }

    let svd = cov.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // Reflection correction: force det(R) = +1.
    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = centroid_dst - r * centroid_src;

    Some(SE3::new(rotation, translation))
}

/// Mean squared residual of `T * src[i]` against `dst[i]`.
pub fn mean_residual_sq(transform: &SE3, src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> f64 {
    if src.is_empty() {
        return f64::INFINITY;
    }
    let sum: f64 = src
        .iter()
        .zip(dst.iter())
        .map(|(s, d)| (transform.transform_point(s) - d).norm_squared())
        .sum();
    sum / src.len() as f64
}
