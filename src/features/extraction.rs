//! Feature extraction collaborator contract.
//!
//! The bundling core does not detect keypoints itself; an external
//! extractor turns one frame's depth + color into keypoints and
//! descriptors. The submap manager checks the returned count against the
//! configured per-frame capacity and treats overflow as fatal.

use crate::cache::{ColorImage, DepthImage};

use super::types::{Descriptor, Keypoint};

/// Keypoints and descriptors for one frame, parallel by index.
pub struct ExtractedFeatures {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl ExtractedFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// External feature-extraction capability.
pub trait FeatureExtractor: Send {
    /// Extract keypoints and descriptors for one frame.
    fn extract(&mut self, depth: &DepthImage, color: &ColorImage) -> ExtractedFeatures;
}
