//! Submap manager: the consumer side of the bundling pipeline.
//!
//! Completed submaps arrive from the ingest thread and flow through:
//! 1. local optimization of the submap's trajectory, with an optional
//!    dense verification pass,
//! 2. fusion of the verified submap into the global store (or an empty
//!    invalid placeholder entry, keeping submap and global indices 1:1),
//! 3. global matching of the new entry against all earlier entries,
//! 4. a revalidation attempt for previously unmatched entries,
//! 5. periodic global optimization, whose residual-outlier removal
//!    cascades down to per-input-frame validity.
//!
//! Global pose bookkeeping lives in the [`TrajectoryBook`]; the numerical
//! solver is abstracted behind [`SparseBundler`].

use std::sync::Arc;

use nalgebra::Vector2;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::FrameCache;
use crate::config::BundleConfig;
use crate::error::{BundleError, Result};
use crate::features::{FeatureStore, Keypoint, StoreKind};
use crate::geometry::SE3;
use crate::matching::{match_and_filter, MatchEngine};
use crate::optimizer::{AlignParams, SparseBundler};
use crate::system::messages::CompletedSubmap;

use super::retry::RetryScan;
use super::trajectory::TrajectoryBook;

/// Result of the local optimization stage.
pub enum LocalOutcome {
    /// Trajectory refined and (if enabled) dense-verified.
    Verified {
        /// Refined pose per local slot, relative to slot 0.
        poses: Vec<SE3>,
        /// Per-slot validity after the solve.
        slot_valid: Vec<bool>,
    },
    /// Too few valid frames, or dense verification failed. The submap is
    /// excluded from the global model.
    Rejected,
}

/// Result of matching a freshly fused global entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalOutcome {
    /// First global entry; nothing to match against yet.
    FirstFrame,
    /// Matched an earlier entry; the global graph gained edges.
    ReadyToSolve,
    /// Unmatched (or placeholder); queued for revalidation where possible.
    NoNewFrame,
}

/// Orchestrates the global store, trajectory bookkeeping, and the solver.
pub struct SubmapManager {
    cfg: Arc<BundleConfig>,
    engine: Arc<Mutex<MatchEngine>>,
    bundler: Box<dyn SparseBundler>,
    global_store: FeatureStore,
    global_cache: FrameCache,
    book: TrajectoryBook,
    scan: RetryScan,
    /// Entry revalidated in the current processing cycle, if any. Seeds
    /// the next fused pose and re-weights the next global solve.
    just_revalidated: Option<usize>,
    global_solves: usize,
}

impl SubmapManager {
    pub fn new(
        cfg: Arc<BundleConfig>,
        engine: Arc<Mutex<MatchEngine>>,
        bundler: Box<dyn SparseBundler>,
    ) -> Self {
        let global_store = FeatureStore::new(StoreKind::Global, cfg.max_global_frames);
        let global_cache = FrameCache::new(cfg.max_global_frames, &cfg);
        let book = TrajectoryBook::new(cfg.submap_size);
        Self {
            cfg,
            engine,
            bundler,
            global_store,
            global_cache,
            book,
            scan: RetryScan::new(),
            just_revalidated: None,
            global_solves: 0,
        }
    }

    /// Runs one completed submap through the full consumer pipeline.
    pub fn process_submap(&mut self, msg: CompletedSubmap) -> Result<()> {
        let CompletedSubmap {
            submap_index,
            mut store,
            cache,
        } = msg;

        match self.optimize_local(submap_index, &mut store, &cache)? {
            LocalOutcome::Verified { poses, slot_valid } => {
                self.fuse_to_global(&store, &cache, &poses, &slot_valid)?;
                if self.match_global() == GlobalOutcome::ReadyToSolve {
                    self.try_revalidation(false);
                    if self.book.num_submaps() % self.cfg.global_solve_interval == 0 {
                        self.optimize_global(true, false)?;
                    }
                }
            }
            LocalOutcome::Rejected => {
                self.add_invalid_global_entry(store.len(), &cache)?;
            }
        }
        Ok(())
    }

    /// Refines the submap's local trajectory and dense-verifies it.
    pub fn optimize_local(
        &mut self,
        submap_index: usize,
        store: &mut FeatureStore,
        cache: &FrameCache,
    ) -> Result<LocalOutcome> {
        if store.len() < 2 {
            return Err(BundleError::SubmapTooSmall {
                submap: submap_index,
                frames: store.len(),
            });
        }
        if store.valid_count() < 2 {
            warn!(
                submap = submap_index,
                valid = store.valid_count(),
                "submap rejected before solve, too few valid frames"
            );
            return Ok(LocalOutcome::Rejected);
        }

        let params = AlignParams::local(&self.cfg);
        let mut poses = vec![SE3::identity(); store.len()];
        self.bundler.align(store, cache, &mut poses, params);

        let verified = !params.use_verification
            || self
                .bundler
                .verify_trajectory(store, cache, &poses, &self.cfg);
        if !verified {
            warn!(submap = submap_index, "local trajectory failed dense verification");
            return Ok(LocalOutcome::Rejected);
        }

        let slot_valid = (0..store.len()).map(|i| store.is_valid(i)).collect();
        debug!(submap = submap_index, "local trajectory verified");
        Ok(LocalOutcome::Verified { poses, slot_valid })
    }

    /// Fuses a verified submap into the global store: the valid frames'
    /// keypoints are transformed into the submap's slot-0 space and
    /// reprojected into one representative feature frame, capped at the
    /// per-frame keypoint capacity.
    pub fn fuse_to_global(
        &mut self,
        store: &FeatureStore,
        cache: &FrameCache,
        poses: &[SE3],
        slot_valid: &[bool],
    ) -> Result<()> {
        let intr = self.cfg.intrinsics;
        let intr_inv = self.cfg.intrinsics_inv();
        let cap = self.cfg.max_keys_per_frame;

        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        'slots: for slot in 0..store.len() {
            if !slot_valid[slot] {
                continue;
            }
            let frame = store.frame(slot);
            for (kp, desc) in frame.keypoints.iter().zip(&frame.descriptors) {
                if keypoints.len() >= cap {
                    break 'slots;
                }
                let p = poses[slot].transform_point(&kp.camera_point(&intr_inv));
                if p.z <= 0.0 {
                    continue;
                }
                let uv = intr * p;
                keypoints.push(Keypoint {
                    pos: Vector2::new(uv.x / p.z, uv.y / p.z),
                    depth: p.z,
                });
                descriptors.push(desc.clone());
            }
        }

        let index = self.global_store.add_frame(keypoints, descriptors)?;
        self.global_cache.copy_frame_from(cache, 0);
        self.book
            .record_submap(poses.to_vec(), slot_valid.to_vec(), self.just_revalidated);
        debug_assert_eq!(index + 1, self.book.num_submaps());
        info!(
            global_frame = index,
            keys = self.global_store.frame(index).keypoints.len(),
            "submap fused to global"
        );
        Ok(())
    }

    /// Records a rejected submap as an empty, invalid global entry so that
    /// submap indices and global frame indices stay 1:1. The cache frame
    /// is still stored to keep cache slots aligned as well.
    pub fn add_invalid_global_entry(
        &mut self,
        num_slots: usize,
        cache: &FrameCache,
    ) -> Result<()> {
        let index = self.global_store.add_frame(Vec::new(), Vec::new())?;
        self.global_store.invalidate_frame(index);
        self.global_cache.copy_frame_from(cache, 0);
        self.book.record_rejected(num_slots);
        warn!(global_frame = index, "submap rejected, invalid global entry added");
        Ok(())
    }

    /// Matches the newest global entry against all earlier entries. On a
    /// match against a non-adjacent predecessor the entry's global pose is
    /// re-anchored from the partner's pose and the pair's relative
    /// transform; the following entry's seed pose derives from it at the
    /// next fusion.
    pub fn match_global(&mut self) -> GlobalOutcome {
        let n = self.global_store.len();
        if n <= 1 {
            return GlobalOutcome::FirstFrame;
        }
        let cur = n - 1;
        if self.global_store.frame(cur).keypoints.is_empty() {
            // Placeholder entry for a rejected submap; nothing to match.
            return GlobalOutcome::NoNewFrame;
        }

        self.global_store.set_current_frame(cur);
        let matched = match_and_filter(
            &mut self.global_store,
            &self.global_cache,
            &self.engine,
            &self.cfg,
        );
        match matched {
            Some(partner) => {
                if partner + 1 != cur {
                    if let Some(pose) = self.anchor_from_pair(cur, partner) {
                        debug!(frame = cur, partner, "re-anchored from non-adjacent match");
                        self.book.reseed_global(cur, pose);
                    }
                }
                GlobalOutcome::ReadyToSolve
            }
            None => {
                self.book.invalidate_submap(cur);
                self.global_store.push_retry(cur);
                info!(frame = cur, "global frame unmatched, queued for revalidation");
                GlobalOutcome::NoNewFrame
            }
        }
    }

    /// Takes one entry off the retry queue and re-runs the match pipeline
    /// for it with the cursor rewound. Success restores the entry's frame
    /// validity and pose; failure re-enqueues it.
    ///
    /// With `scan_complete` set (input stream over) a cycle guard stops
    /// the sweep once a full pass over the queue makes no progress.
    pub fn try_revalidation(&mut self, scan_complete: bool) {
        self.just_revalidated = None;
        let Some(idx) = self.global_store.pop_retry() else {
            return;
        };
        if scan_complete && !self.scan.observe(idx) {
            self.global_store.push_retry(idx);
            return;
        }

        let cur = self.global_store.len() - 1;
        self.global_store.set_current_frame(idx);
        let matched = match_and_filter(
            &mut self.global_store,
            &self.global_cache,
            &self.engine,
            &self.cfg,
        );
        self.global_store.set_current_frame(cur);

        match matched {
            Some(partner) => {
                if let Some(pose) = self.anchor_from_pair(idx, partner) {
                    self.book.reseed_global(idx, pose);
                }
                self.book.revalidate_submap(idx);
                self.just_revalidated = Some(idx);
                self.scan.progressed();
                info!(frame = idx, partner, "global frame revalidated");
            }
            None => {
                self.global_store.push_retry(idx);
            }
        }
    }

    /// Pose for `frame` derived from `partner`'s pose and the matched
    /// pair's relative transform. The stored transform maps lower-index
    /// camera space into higher-index camera space.
    fn anchor_from_pair(&self, frame: usize, partner: usize) -> Option<SE3> {
        let pair = self.global_store.pair_match(frame, partner)?;
        let rel = pair.transform?;
        let anchor = *self.book.global_pose(partner);
        Some(if partner < frame {
            anchor.compose(&rel.inverse())
        } else {
            anchor.compose(&rel)
        })
    }

    /// Runs one global solve. When the solver removes a residual outlier,
    /// every entry the solve newly invalidated has its owned input-frame
    /// range invalidated and is queued for revalidation. Returns whether
    /// an outlier was removed.
    ///
    /// Invalidating the very first entry is fatal: the world anchor is
    /// gone and no earlier state exists to recover from.
    pub fn optimize_global(&mut self, remove_max_residual: bool, is_end: bool) -> Result<bool> {
        let n = self.global_store.len();
        if n < 2 {
            return Ok(false);
        }

        let was_valid: Vec<bool> = (0..n).map(|g| self.global_store.is_valid(g)).collect();
        let params = AlignParams::global(
            &self.cfg,
            self.global_solves == 0,
            remove_max_residual,
            is_end,
            self.just_revalidated,
        );
        let outcome = self.bundler.align(
            &mut self.global_store,
            &self.global_cache,
            self.book.global_poses_mut(),
            params,
        );
        self.global_solves += 1;

        if outcome.removed_outlier {
            if !self.global_store.is_valid(0) {
                return Err(BundleError::FirstSubmapInvalid);
            }
            // Cascade on entries the solver flipped, not on prior frame
            // validity: an entry can be valid while some of its owned
            // frames already are not.
            for g in 1..n {
                if was_valid[g] && !self.global_store.is_valid(g) {
                    warn!(frame = g, "global frame dropped as residual outlier");
                    self.book.invalidate_submap(g);
                    self.global_store.push_retry(g);
                }
            }
        }
        Ok(outcome.removed_outlier)
    }

    /// End-of-stream wrap-up: sweep the retry queue until it empties or a
    /// full pass makes no progress, then run the final global solve.
    pub fn finalize(&mut self) -> Result<()> {
        while self.global_store.retry_len() > 0 {
            self.try_revalidation(true);
            if self.scan.is_exhausted() {
                break;
            }
        }
        self.optimize_global(true, true)?;
        info!(
            frames = self.book.num_frames(),
            submaps = self.book.num_submaps(),
            "bundling finalized"
        );
        Ok(())
    }

    /// Composed world pose per input frame.
    pub fn complete_trajectory(&self) -> Vec<SE3> {
        self.book.compose()
    }

    /// Opaque serialization of the enabled global correspondence graph.
    pub fn serialize_correspondences(&self) -> Vec<u8> {
        self.global_store.serialize_correspondences()
    }

    /// Opaque serialization of the composed trajectory.
    pub fn serialize_trajectory(&self) -> Vec<u8> {
        self.book.serialize()
    }

    pub fn global_store(&self) -> &FeatureStore {
        &self.global_store
    }

    pub fn trajectory_book(&self) -> &TrajectoryBook {
        &self.book
    }
}
