//! Bundling configuration.
//!
//! A single immutable `BundleConfig` value is built once at startup and
//! passed by reference to every component that needs thresholds. There is
//! no mutable global state.

use nalgebra::Matrix3;

/// Flat table of numeric thresholds and sizes for the bundling pipeline.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// Number of frames per local submap. The following submap re-uses the
    /// last frame as its frame 0, so consecutive submaps overlap by one.
    pub submap_size: usize,
    /// Capacity of a local feature store.
    pub max_local_frames: usize,
    /// Capacity of the global feature store (one entry per submap).
    pub max_global_frames: usize,
    /// Hard per-frame keypoint capacity. Exceeding it is fatal.
    pub max_keys_per_frame: usize,

    /// Absolute descriptor-distance acceptance threshold.
    pub match_thresh: f64,
    /// Nearest/second-nearest ratio limit for intra-submap matching.
    pub ratio_max_local: f64,
    /// Stricter ratio limit for submap-to-submap matching.
    pub ratio_max_global: f64,
    /// Minimum surviving correspondences for a local pair.
    pub min_matches_local: usize,
    /// Minimum surviving correspondences for a global pair.
    pub min_matches_global: usize,
    /// Max squared residual (m^2) a correspondence may have against the
    /// fitted rigid transform.
    pub max_rigid_residual_sq: f64,
    /// Minimum principal-component spread (m) of matched keypoints.
    pub surf_area_pca_thresh: f64,

    /// Dense verification: max projective point distance (m).
    pub proj_corr_dist_thresh: f64,
    /// Dense verification: min normal dot product.
    pub proj_corr_normal_thresh: f64,
    /// Dense verification: max intensity difference.
    pub proj_corr_color_thresh: f64,
    /// Dense verification of a candidate match: max mean reprojection error.
    pub verify_match_err_thresh: f64,
    /// Dense verification of a candidate match: min agreeing-pixel fraction.
    pub verify_match_corr_thresh: f64,
    /// Dense verification of an optimized trajectory: max mean error.
    pub verify_opt_err_thresh: f64,
    /// Dense verification of an optimized trajectory: min agreeing fraction.
    pub verify_opt_corr_thresh: f64,
    /// Whether local submaps are dense-verified after optimization.
    pub use_local_verification: bool,

    /// Sensor depth validity range (m).
    pub depth_min: f64,
    pub depth_max: f64,

    /// Downsampled cache resolution.
    pub cache_width: usize,
    pub cache_height: usize,
    /// Camera intrinsics at cache resolution.
    pub intrinsics: Matrix3<f64>,

    /// Solver iteration counts.
    pub num_local_nonlin_iterations: usize,
    pub num_local_lin_iterations: usize,
    pub num_global_nonlin_iterations: usize,
    pub num_global_lin_iterations: usize,
    /// Run a global solve every this many fused submaps.
    pub global_solve_interval: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            submap_size: 10,
            max_local_frames: 11,
            max_global_frames: 500,
            max_keys_per_frame: 1024,

            match_thresh: 0.7,
            ratio_max_local: 0.8,
            ratio_max_global: 0.7,
            min_matches_local: 12,
            min_matches_global: 25,
            max_rigid_residual_sq: 0.0025,
            surf_area_pca_thresh: 0.032,

            proj_corr_dist_thresh: 0.15,
            proj_corr_normal_thresh: 0.97,
            proj_corr_color_thresh: 0.1,
            verify_match_err_thresh: 0.075,
            verify_match_corr_thresh: 0.02,
            verify_opt_err_thresh: 0.05,
            verify_opt_corr_thresh: 0.001,
            use_local_verification: true,

            depth_min: 0.1,
            depth_max: 4.0,

            cache_width: 80,
            cache_height: 60,
            intrinsics: Matrix3::new(40.0, 0.0, 40.0, 0.0, 40.0, 30.0, 0.0, 0.0, 1.0),

            num_local_nonlin_iterations: 2,
            num_local_lin_iterations: 100,
            num_global_nonlin_iterations: 3,
            num_global_lin_iterations: 150,
            global_solve_interval: 1,
        }
    }
}

impl BundleConfig {
    /// Inverse intrinsics for back-projecting cache pixels.
    ///
    /// Pinhole intrinsics are upper triangular with nonzero focal lengths,
    /// so the inverse always exists; identity is returned for a malformed
    /// matrix rather than panicking mid-pipeline.
    pub fn intrinsics_inv(&self) -> Matrix3<f64> {
        self.intrinsics.try_inverse().unwrap_or_else(Matrix3::identity)
    }
}
