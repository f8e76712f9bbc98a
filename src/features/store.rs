//! Feature store: an ordered, capacity-bounded run of feature frames.
//!
//! A store is one "submap". Local stores hold the frames of one bounded
//! window; the single global store holds one representative frame per
//! fused submap. Besides the frames themselves a store owns:
//! - the sparse map from unordered frame pairs to their match record,
//! - the accumulated correspondence graph consumed by the solver,
//! - per-frame validity flags,
//! - (global only) the retry queue of invalid frames awaiting revalidation.
//!
//! The "current frame" cursor normally points at the newest frame but is
//! temporarily rewound during revalidation so the match pipeline re-runs
//! for an older frame.

use std::collections::{HashMap, HashSet, VecDeque};

use nalgebra::Matrix3;
use tracing::debug;

use crate::error::BundleError;

use super::types::{CorrEntry, Descriptor, ImagePairMatch, Keypoint};

/// Which flavor of store this is; selects matching thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Local,
    Global,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Local => "local",
            StoreKind::Global => "global",
        }
    }
}

/// One frame's features plus its validity flag.
pub struct FeatureFrame {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    pub valid: bool,
}

/// Ordered, size-bounded collection of feature frames with the pairwise
/// match cache and correspondence graph accumulated over them.
pub struct FeatureStore {
    kind: StoreKind,
    capacity: usize,
    frames: Vec<FeatureFrame>,
    /// Cursor of the frame currently being matched. Usually the newest
    /// frame; rewound temporarily during revalidation.
    current: usize,
    pair_matches: HashMap<(usize, usize), ImagePairMatch>,
    corr_graph: Vec<CorrEntry>,
    retry_queue: VecDeque<usize>,
    retry_members: HashSet<usize>,
}

impl FeatureStore {
    pub fn new(kind: StoreKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            frames: Vec::new(),
            current: 0,
            pair_matches: HashMap::new(),
            corr_graph: Vec::new(),
            retry_queue: VecDeque::new(),
            retry_members: HashSet::new(),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn frame(&self, index: usize) -> &FeatureFrame {
        &self.frames[index]
    }

    /// Append a frame. Indices increase by exactly 1 per call, independent
    /// of validity. New frames start valid; the match pipeline may flip
    /// them.
    pub fn add_frame(
        &mut self,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
    ) -> Result<usize, BundleError> {
        if self.is_full() {
            return Err(BundleError::StoreFull {
                kind: self.kind.name(),
                capacity: self.capacity,
            });
        }
        debug_assert_eq!(keypoints.len(), descriptors.len());
        let index = self.frames.len();
        self.frames.push(FeatureFrame {
            keypoints,
            descriptors,
            valid: true,
        });
        self.current = index;
        Ok(index)
    }

    /// Index of the frame the match pipeline operates on.
    pub fn current_frame(&self) -> usize {
        self.current
    }

    /// Rewind the cursor to an existing frame (revalidation) or restore it.
    pub fn set_current_frame(&mut self, index: usize) {
        debug_assert!(index < self.frames.len());
        self.current = index;
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.frames[index].valid
    }

    /// Number of currently-valid frames.
    pub fn valid_count(&self) -> usize {
        self.frames.iter().filter(|f| f.valid).count()
    }

    /// Mark a frame invalid and disable its residual edges.
    pub fn invalidate_frame(&mut self, index: usize) {
        if !self.frames[index].valid {
            return;
        }
        self.frames[index].valid = false;
        for entry in &mut self.corr_graph {
            if entry.frame_i == index || entry.frame_j == index {
                entry.enabled = false;
            }
        }
        debug!(kind = self.kind.name(), frame = index, "frame invalidated");
    }

    /// Mark a frame valid again and re-enable edges whose other endpoint is
    /// also valid.
    pub fn revalidate_frame(&mut self, index: usize) {
        if self.frames[index].valid {
            return;
        }
        self.frames[index].valid = true;
        for entry in &mut self.corr_graph {
            if entry.frame_i == index || entry.frame_j == index {
                let other = if entry.frame_i == index {
                    entry.frame_j
                } else {
                    entry.frame_i
                };
                entry.enabled = self.frames[other].valid;
            }
        }
        debug!(kind = self.kind.name(), frame = index, "frame revalidated");
    }

    // ── pair matches ────────────────────────────────────────────────────

    fn pair_key(a: usize, b: usize) -> (usize, usize) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Mutable match record for an unordered frame pair, created on demand.
    pub fn pair_match_mut(&mut self, a: usize, b: usize) -> &mut ImagePairMatch {
        self.pair_matches.entry(Self::pair_key(a, b)).or_default()
    }

    pub fn pair_match(&self, a: usize, b: usize) -> Option<&ImagePairMatch> {
        self.pair_matches.get(&Self::pair_key(a, b))
    }

    // ── correspondence graph ────────────────────────────────────────────

    /// Append the filtered correspondences of pair `(prev, cur)` to the
    /// residual graph as camera-space point pairs. Any earlier edges of the
    /// same pair are replaced, so a pair contributes at most one batch of
    /// edges (re-running the pipeline after a rewind stays deduplicated).
    pub fn add_pair_to_graph(&mut self, prev: usize, cur: usize, intrinsics_inv: &Matrix3<f64>) {
        let (lo, hi) = Self::pair_key(prev, cur);
        let Some(pair) = self.pair_matches.get(&(lo, hi)) else {
            return;
        };
        self.corr_graph
            .retain(|e| !(e.frame_i == lo && e.frame_j == hi));
        let mut entries = Vec::with_capacity(pair.filtered.len());
        for corr in &pair.filtered {
            let pos_i = self.frames[lo].keypoints[corr.key_i].camera_point(intrinsics_inv);
            let pos_j = self.frames[hi].keypoints[corr.key_j].camera_point(intrinsics_inv);
            entries.push(CorrEntry {
                frame_i: lo,
                frame_j: hi,
                pos_i,
                pos_j,
                enabled: true,
            });
        }
        self.corr_graph.extend(entries);
    }

    pub fn corr_graph(&self) -> &[CorrEntry] {
        &self.corr_graph
    }

    /// Enabled residual edges, as seen by the solver.
    pub fn active_correspondences(&self) -> impl Iterator<Item = &CorrEntry> {
        self.corr_graph.iter().filter(|e| e.enabled)
    }

    // ── retry queue (global store only) ─────────────────────────────────

    /// Enqueue an invalid frame for a later revalidation attempt.
    /// Re-adding a queued index is a no-op.
    pub fn push_retry(&mut self, index: usize) {
        if self.retry_members.insert(index) {
            self.retry_queue.push_back(index);
        }
    }

    /// Take the next retry candidate, removing it from the queue. The
    /// caller re-enqueues it on failure.
    pub fn pop_retry(&mut self) -> Option<usize> {
        let index = self.retry_queue.pop_front()?;
        self.retry_members.remove(&index);
        Some(index)
    }

    pub fn retry_len(&self) -> usize {
        self.retry_queue.len()
    }

    // ── persistence hand-off ────────────────────────────────────────────

    /// Opaque byte serialization of the enabled correspondence graph.
    pub fn serialize_correspondences(&self) -> Vec<u8> {
        let active: Vec<&CorrEntry> = self.active_correspondences().collect();
        let mut out = Vec::with_capacity(8 + active.len() * (16 + 48));
        out.extend_from_slice(&(active.len() as u64).to_le_bytes());
        for entry in active {
            out.extend_from_slice(&(entry.frame_i as u64).to_le_bytes());
            out.extend_from_slice(&(entry.frame_j as u64).to_le_bytes());
            for v in [&entry.pos_i, &entry.pos_j] {
                out.extend_from_slice(&v.x.to_le_bytes());
                out.extend_from_slice(&v.y.to_le_bytes());
                out.extend_from_slice(&v.z.to_le_bytes());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::types::{Correspondence, DESCRIPTOR_LEN};
    use nalgebra::Vector2;

    fn dummy_frame(n: usize) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let kps = (0..n)
            .map(|i| Keypoint {
                pos: Vector2::new(i as f64, i as f64),
                depth: 1.0,
            })
            .collect();
        let descs = (0..n).map(|_| Descriptor([0.0; DESCRIPTOR_LEN])).collect();
        (kps, descs)
    }

    fn store_with_frames(n: usize) -> FeatureStore {
        let mut store = FeatureStore::new(StoreKind::Local, 16);
        for _ in 0..n {
            let (kps, descs) = dummy_frame(4);
            store.add_frame(kps, descs).unwrap();
        }
        store
    }

    #[test]
    fn test_monotonic_indices() {
        let mut store = FeatureStore::new(StoreKind::Local, 8);
        for expect in 0..8 {
            let (kps, descs) = dummy_frame(2);
            let idx = store.add_frame(kps, descs).unwrap();
            assert_eq!(idx, expect);
        }
        assert!(matches!(
            store.add_frame(vec![], vec![]),
            Err(BundleError::StoreFull { .. })
        ));
    }

    #[test]
    fn test_validity_toggles_graph_edges() {
        let mut store = store_with_frames(3);
        let intr_inv = Matrix3::identity();
        store.pair_match_mut(0, 2).filtered = vec![Correspondence {
            key_i: 0,
            key_j: 1,
            distance: 0.1,
        }];
        store.add_pair_to_graph(0, 2, &intr_inv);
        assert_eq!(store.active_correspondences().count(), 1);

        store.invalidate_frame(2);
        assert_eq!(store.active_correspondences().count(), 0);

        store.revalidate_frame(2);
        assert_eq!(store.active_correspondences().count(), 1);
    }

    #[test]
    fn test_revalidate_keeps_edges_to_invalid_partner_disabled() {
        let mut store = store_with_frames(3);
        let intr_inv = Matrix3::identity();
        store.pair_match_mut(1, 2).filtered = vec![Correspondence {
            key_i: 0,
            key_j: 0,
            distance: 0.2,
        }];
        store.add_pair_to_graph(1, 2, &intr_inv);

        store.invalidate_frame(1);
        store.invalidate_frame(2);
        store.revalidate_frame(2);
        // Edge endpoint 1 is still invalid, so the edge stays disabled.
        assert_eq!(store.active_correspondences().count(), 0);
    }

    #[test]
    fn test_retry_queue_idempotent() {
        let mut store = store_with_frames(4);
        store.push_retry(2);
        store.push_retry(2);
        store.push_retry(3);
        assert_eq!(store.retry_len(), 2);
        assert_eq!(store.pop_retry(), Some(2));
        assert_eq!(store.pop_retry(), Some(3));
        assert_eq!(store.pop_retry(), None);
    }

    #[test]
    fn test_serialize_correspondences_layout() {
        let mut store = store_with_frames(2);
        let intr_inv = Matrix3::identity();
        store.pair_match_mut(0, 1).filtered = vec![
            Correspondence {
                key_i: 0,
                key_j: 0,
                distance: 0.0,
            },
            Correspondence {
                key_i: 1,
                key_j: 1,
                distance: 0.0,
            },
        ];
        store.add_pair_to_graph(0, 1, &intr_inv);
        let bytes = store.serialize_correspondences();
        // 8-byte count + 2 entries of 2 indices + 6 coordinates.
        assert_eq!(bytes.len(), 8 + 2 * (16 + 48));
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 2);
    }
}
