//! Core feature types: keypoints, descriptors, pair matches, residual edges.

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::geometry::SE3;

/// Descriptor dimensionality (SIFT-style float descriptors).
pub const DESCRIPTOR_LEN: usize = 128;

/// A sparse 2D keypoint with its depth measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Pixel position in the feature image.
    pub pos: Vector2<f64>,
    /// Depth at the keypoint, meters.
    pub depth: f64,
}

impl Keypoint {
    /// Back-project to a camera-space 3D point.
    pub fn camera_point(&self, intrinsics_inv: &Matrix3<f64>) -> Vector3<f64> {
        intrinsics_inv * (Vector3::new(self.pos.x, self.pos.y, 1.0) * self.depth)
    }
}

/// Fixed-length feature descriptor, compared by Euclidean distance.
#[derive(Clone, PartialEq)]
pub struct Descriptor(pub [f32; DESCRIPTOR_LEN]);

impl Descriptor {
    /// Squared Euclidean distance to another descriptor.
    pub fn distance_sq(&self, other: &Descriptor) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = (a - b) as f64;
                d * d
            })
            .sum()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor([{:.3}, {:.3}, ..])", self.0[0], self.0[1])
    }
}

/// One keypoint correspondence between two frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Keypoint index in the earlier frame of the pair.
    pub key_i: usize,
    /// Keypoint index in the later frame of the pair.
    pub key_j: usize,
    /// Descriptor distance of the match.
    pub distance: f64,
}

/// Match record for one unordered frame pair.
///
/// Failed pairs are recorded with empty lists so incremental re-runs of the
/// pipeline do not recompute them.
#[derive(Debug, Clone, Default)]
pub struct ImagePairMatch {
    /// Raw ratio-test survivors, sorted by ascending distance.
    pub raw: Vec<Correspondence>,
    /// Survivors of the filter cascade.
    pub filtered: Vec<Correspondence>,
    /// Rigid transform mapping earlier-frame points onto later-frame points,
    /// estimated by the geometric filter.
    pub transform: Option<SE3>,
}

impl ImagePairMatch {
    /// Record the pair as failed, keeping stage counts at zero.
    pub fn mark_empty(&mut self) {
        self.raw.clear();
        self.filtered.clear();
        self.transform = None;
    }
}

/// A residual edge in the correspondence graph, consumed by the solver.
///
/// Edges are never removed; when a frame's validity flips its edges are
/// toggled instead, matching the solver's fixed-size residual layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrEntry {
    pub frame_i: usize,
    pub frame_j: usize,
    /// Camera-space point in frame `i`.
    pub pos_i: Vector3<f64>,
    /// Camera-space point in frame `j`.
    pub pos_j: Vector3<f64>,
    pub enabled: bool,
}
