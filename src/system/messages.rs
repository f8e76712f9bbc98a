//! Inter-thread message types.
//!
//! Ownership of a completed submap moves from the ingest thread to the
//! bundling thread through a channel; after the hand-off the ingest side
//! holds no reference to it.

use crate::cache::FrameCache;
use crate::features::FeatureStore;

/// A filled local submap, sent from ingest to bundling.
pub struct CompletedSubmap {
    /// Monotonic submap index; equals the global frame index this submap
    /// will occupy after fusion.
    pub submap_index: usize,

    /// The submap's feature frames, pair matches, and correspondence graph.
    pub store: FeatureStore,

    /// The submap's derived frame buffers.
    pub cache: FrameCache,
}
