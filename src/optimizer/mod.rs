//! Sparse bundle-adjustment collaborator contract.
//!
//! The numerical solver is external to this crate. The submap manager
//! talks to it through the `SparseBundler` trait: one `align` call refines
//! a pose set in place against a store's correspondence graph, and
//! `verify_trajectory` dense-checks a refined local trajectory against the
//! cache. The solver may also flag that it removed a high-residual frame,
//! which the manager turns into cascading invalidation.

use crate::cache::FrameCache;
use crate::config::BundleConfig;
use crate::features::FeatureStore;
use crate::geometry::SE3;

/// Per-call solver parameters.
#[derive(Debug, Clone, Copy)]
pub struct AlignParams {
    pub nonlin_iterations: usize,
    pub lin_iterations: usize,
    /// Whether the caller will dense-verify the result (local solves).
    pub use_verification: bool,
    /// Record convergence diagnostics.
    pub record_convergence: bool,
    /// First global solve of the run.
    pub is_start: bool,
    /// Allow the solver to drop the frame with the highest residual.
    pub remove_max_residual: bool,
    /// Final solve after the input stream ended.
    pub is_end: bool,
    /// Global frame revalidated just before this solve, if any; lets the
    /// solver re-weight its residuals instead of distrusting them.
    pub revalidated: Option<usize>,
}

impl AlignParams {
    /// Parameters for an intra-submap (local) solve.
    pub fn local(cfg: &BundleConfig) -> Self {
        Self {
            nonlin_iterations: cfg.num_local_nonlin_iterations,
            lin_iterations: cfg.num_local_lin_iterations,
            use_verification: cfg.use_local_verification,
            record_convergence: true,
            is_start: false,
            remove_max_residual: false,
            is_end: false,
            revalidated: None,
        }
    }

    /// Parameters for a global solve.
    pub fn global(
        cfg: &BundleConfig,
        is_start: bool,
        remove_max_residual: bool,
        is_end: bool,
        revalidated: Option<usize>,
    ) -> Self {
        Self {
            nonlin_iterations: cfg.num_global_nonlin_iterations,
            lin_iterations: cfg.num_global_lin_iterations,
            use_verification: false,
            record_convergence: false,
            is_start,
            remove_max_residual,
            is_end,
            revalidated,
        }
    }
}

/// Result of one `align` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignOutcome {
    /// The solver dropped at least one frame as a residual outlier and
    /// updated the store's validity flags accordingly.
    pub removed_outlier: bool,
}

/// External numerical solver capability.
///
/// `align` refines `poses` in place from the store's enabled
/// correspondence graph. It may flip store validity flags when
/// `remove_max_residual` is set; the caller propagates those flips to the
/// per-input-frame bookkeeping.
pub trait SparseBundler: Send {
    fn align(
        &mut self,
        store: &mut FeatureStore,
        cache: &FrameCache,
        poses: &mut [SE3],
        params: AlignParams,
    ) -> AlignOutcome;

    /// Dense check of a refined local trajectory against the cache.
    /// Returns false if too few frames verify.
    fn verify_trajectory(
        &mut self,
        store: &FeatureStore,
        cache: &FrameCache,
        poses: &[SE3],
        cfg: &BundleConfig,
    ) -> bool;
}
