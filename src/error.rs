//! Error taxonomy for the bundling core.
//!
//! Only genuinely fatal conditions are errors. Unmatched frames, failed
//! dense verification, and solver outlier removal are ordinary states of
//! the validity/retry machinery and are returned as values, not `Err`.

use thiserror::Error;

/// Fatal bundling errors. These abort the run.
#[derive(Debug, Error)]
pub enum BundleError {
    /// A frame produced more keypoints than the configured capacity.
    #[error("frame {frame}: {count} keypoints exceeds capacity {max}")]
    CapacityExceeded {
        frame: usize,
        count: usize,
        max: usize,
    },

    /// Local optimization was requested on a submap with fewer than two frames.
    #[error("submap {submap}: {frames} frame(s), need at least 2 to optimize")]
    SubmapTooSmall { submap: usize, frames: usize },

    /// The global solver invalidated the only existing global frame.
    /// There is no earlier state to recover from.
    #[error("first submap invalidated by the global solver")]
    FirstSubmapInvalid,

    /// A feature store reached its frame capacity.
    #[error("{kind} store full at {capacity} frames")]
    StoreFull { kind: &'static str, capacity: usize },
}

pub type Result<T> = std::result::Result<T, BundleError>;
