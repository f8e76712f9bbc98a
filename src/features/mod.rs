//! Sparse features: keypoints, descriptors, per-submap feature stores.

pub mod extraction;
pub mod store;
pub mod types;

pub use extraction::{ExtractedFeatures, FeatureExtractor};
pub use store::{FeatureFrame, FeatureStore, StoreKind};
pub use types::{CorrEntry, Correspondence, Descriptor, ImagePairMatch, Keypoint, DESCRIPTOR_LEN};
