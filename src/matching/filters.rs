//! Correspondence filter cascade.
//!
//! Stages run cheapest-and-most-discriminative first, each operating only
//! on survivors of the previous stage:
//! 1. geometric: rigid-fit residual rejection + minimum match count,
//! 2. surface area: principal-component spread of the matched points,
//! 3. dense verification: projective depth/normal/photometric check
//!    against the downsampled cache.
//!
//! A stage that rejects a pair clears its filtered list and transform but
//! leaves the raw matches recorded, so incremental pipeline re-runs do not
//! recompute the pair.

use nalgebra::{Matrix3, Vector3};

use crate::cache::CachedFrame;
use crate::config::BundleConfig;
use crate::features::{Correspondence, ImagePairMatch, Keypoint};
use crate::geometry::{fit_rigid, SE3};

/// Reject the pair outright.
fn reject(pair: &mut ImagePairMatch) {
    pair.filtered.clear();
    pair.transform = None;
}

/// Stage 1: estimate a rigid transform from the raw correspondences,
/// iteratively dropping correspondences whose residual exceeds
/// `max_residual_sq`, and reject the pair if fewer than `min_matches`
/// survive.
pub fn filter_geometric(
    pair: &mut ImagePairMatch,
    kps_i: &[Keypoint],
    kps_j: &[Keypoint],
    intrinsics_inv: &Matrix3<f64>,
    min_matches: usize,
    max_residual_sq: f64,
) {
    let mut survivors: Vec<Correspondence> = pair.raw.clone();

    loop {
        if survivors.len() < min_matches.max(3) {
            return reject(pair);
        }

        let src: Vec<Vector3<f64>> = survivors
            .iter()
            .map(|c| kps_i[c.key_i].camera_point(intrinsics_inv))
            .collect();
        let dst: Vec<Vector3<f64>> = survivors
            .iter()
            .map(|c| kps_j[c.key_j].camera_point(intrinsics_inv))
            .collect();

        let Some(transform) = fit_rigid(&src, &dst) else {
            return reject(pair);
        };

        // Trim the single worst correspondence per iteration; one gross
        // outlier skews the fit enough to push inliers over the threshold,
        // so they must not all be dropped at once.
        let (worst_idx, worst_residual) = survivors
            .iter()
            .enumerate()
            .map(|(k, _)| {
                (
                    k,
                    (transform.transform_point(&src[k]) - dst[k]).norm_squared(),
                )
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));

        if worst_residual <= max_residual_sq {
            pair.filtered = survivors;
            pair.transform = Some(transform);
            return;
        }
        survivors.remove(worst_idx);
    }
}

/// Extent of the matched points along their second principal axis.
///
/// Genuine surface overlap spreads matches over an area; matches collapsed
/// onto a line or a point are degenerate for pose estimation.
fn second_principal_extent(points: &[Vector3<f64>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let n = points.len() as f64;
    let centroid: Vector3<f64> = points.iter().sum::<Vector3<f64>>() / n;
    let mut cov = Matrix3::<f64>::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= n;
    let mut eigenvalues: Vec<f64> = cov.symmetric_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));
    eigenvalues[1].max(0.0).sqrt()
}

/// Stage 2: reject pairs whose matched-keypoint spread is inconsistent
/// with genuine overlap, in either frame.
pub fn filter_surface_area(
    pair: &mut ImagePairMatch,
    kps_i: &[Keypoint],
    kps_j: &[Keypoint],
    intrinsics_inv: &Matrix3<f64>,
    pca_thresh: f64,
) {
    if pair.filtered.is_empty() {
        return;
    }
    let points_i: Vec<Vector3<f64>> = pair
        .filtered
        .iter()
        .map(|c| kps_i[c.key_i].camera_point(intrinsics_inv))
        .collect();
    let points_j: Vec<Vector3<f64>> = pair
        .filtered
        .iter()
        .map(|c| kps_j[c.key_j].camera_point(intrinsics_inv))
        .collect();

    if second_principal_extent(&points_i) < pca_thresh
        || second_principal_extent(&points_j) < pca_thresh
    {
        reject(pair);
    }
}

/// Outcome of projecting one cached frame onto another under a transform.
pub struct DenseProjection {
    /// Mean distance between projected and observed points, meters.
    pub mean_error: f64,
    /// Fraction of cache pixels that agree geometrically and photometrically.
    pub agreement: f64,
}

/// Project `frame_i` through `transform` into `frame_j` and measure
/// geometric + photometric agreement against the cached buffers.
pub fn project_dense(
    transform: &SE3,
    frame_i: &CachedFrame,
    frame_j: &CachedFrame,
    width: usize,
    height: usize,
    cfg: &BundleConfig,
) -> DenseProjection {
    let intrinsics = cfg.intrinsics;
    let mut err_sum = 0.0;
    let mut projected = 0usize;
    let mut agreeing = 0usize;

    for idx in 0..width * height {
        let Some(pos_i) = frame_i.camera_pos[idx] else {
            continue;
        };
        let p = transform.transform_point(&pos_i);
        if p.z <= 0.0 {
            continue;
        }
        let uv = intrinsics * p;
        let u = (uv.x / uv.z).round();
        let v = (uv.y / uv.z).round();
        if u < 0.0 || v < 0.0 || u >= width as f64 || v >= height as f64 {
            continue;
        }
        let jdx = v as usize * width + u as usize;
        let Some(pos_j) = frame_j.camera_pos[jdx] else {
            continue;
        };

        let dist = (p - pos_j).norm();
        err_sum += dist;
        projected += 1;

        let normals_agree = match (frame_i.normals[idx], frame_j.normals[jdx]) {
            (Some(ni), Some(nj)) => {
                (transform.rotation * ni).dot(&nj) >= cfg.proj_corr_normal_thresh
            }
            _ => false,
        };
        let color_agrees =
            (frame_i.intensity[idx] - frame_j.intensity[jdx]).abs() <= cfg.proj_corr_color_thresh;

        if dist <= cfg.proj_corr_dist_thresh && normals_agree && color_agrees {
            agreeing += 1;
        }
    }

    if projected == 0 {
        return DenseProjection {
            mean_error: f64::INFINITY,
            agreement: 0.0,
        };
    }
    DenseProjection {
        mean_error: err_sum / projected as f64,
        agreement: agreeing as f64 / (width * height) as f64,
    }
}

/// Stage 3: reject pairs whose projected geometric and photometric
/// residuals exceed the configured thresholds.
pub fn filter_dense_verify(
    pair: &mut ImagePairMatch,
    frame_i: &CachedFrame,
    frame_j: &CachedFrame,
    width: usize,
    height: usize,
    cfg: &BundleConfig,
) {
    if pair.filtered.is_empty() {
        return;
    }
    let Some(transform) = pair.transform else {
        return reject(pair);
    };

    let projection = project_dense(&transform, frame_i, frame_j, width, height, cfg);
    if projection.mean_error > cfg.verify_match_err_thresh
        || projection.agreement < cfg.verify_match_corr_thresh
    {
        reject(pair);
    }
}
