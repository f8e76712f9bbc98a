//! Fusion system - top-level entry point and thread orchestration.
//!
//! The `FusionSystem` owns the shared state and the bundling thread.
//! Frame ingest runs in the calling thread; completed submaps move over a
//! single-slot channel to the bundling thread, which runs local
//! optimization, global fusion, matching, revalidation, and the periodic
//! global solve. `shutdown` flushes any trailing partial submap, waits for
//! the bundling thread, and returns the finalized [`SubmapManager`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::cache::{ColorImage, DepthImage};
use crate::config::BundleConfig;
use crate::error::BundleError;
use crate::features::FeatureExtractor;
use crate::matching::MatchEngine;
use crate::optimizer::SparseBundler;
use crate::submap::SubmapManager;

use super::ingest::FrameIngest;
use super::messages::CompletedSubmap;
use super::shared_state::SharedState;

/// Capacity of the submap channel. A single slot: ingest may be at most
/// one completed submap ahead of the bundling thread.
const SUBMAP_CHANNEL_CAPACITY: usize = 1;

/// Timeout for receiving submaps. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Main system orchestrating frame ingest and submap bundling.
pub struct FusionSystem {
    shared: Arc<SharedState>,
    ingest: FrameIngest,
    bundling_handle: Option<JoinHandle<Result<SubmapManager, BundleError>>>,
}

impl FusionSystem {
    /// Creates the shared state, spawns the bundling thread, and wires the
    /// ingest side to it.
    pub fn new(
        cfg: BundleConfig,
        extractor: Box<dyn FeatureExtractor>,
        bundler: Box<dyn SparseBundler>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let shared = SharedState::new();
        let engine = Arc::new(Mutex::new(MatchEngine::new(cfg.match_thresh)));
        let (sender, receiver) = bounded::<CompletedSubmap>(SUBMAP_CHANNEL_CAPACITY);

        let manager = SubmapManager::new(Arc::clone(&cfg), Arc::clone(&engine), bundler);
        let bundling_handle = Self::spawn_bundling(manager, receiver, Arc::clone(&shared));
        let ingest = FrameIngest::new(cfg, extractor, engine, sender);

        Self {
            shared,
            ingest,
            bundling_handle: Some(bundling_handle),
        }
    }

    fn spawn_bundling(
        mut manager: SubmapManager,
        receiver: Receiver<CompletedSubmap>,
        shared: Arc<SharedState>,
    ) -> JoinHandle<Result<SubmapManager, BundleError>> {
        thread::spawn(move || {
            loop {
                if shared.is_shutdown_requested() && receiver.is_empty() {
                    break;
                }
                match receiver.recv_timeout(RECV_TIMEOUT) {
                    Ok(msg) => {
                        if let Err(e) = manager.process_submap(msg) {
                            error!(error = %e, "bundling failed");
                            return Err(e);
                        }
                        shared.note_submap_processed();
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            manager.finalize()?;
            Ok(manager)
        })
    }

    /// Ingests one input frame in the calling thread. Blocks briefly when
    /// the bundling thread falls a full submap behind.
    pub fn process_frame(&mut self, depth: &DepthImage, color: &ColorImage) -> Result<()> {
        self.ingest.ingest(depth, color)?;
        self.shared.note_frame_ingested();
        Ok(())
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Whether the submap under construction still has enough valid
    /// frames to be worth optimizing.
    pub fn current_submap_valid(&self) -> bool {
        self.ingest.current_submap_valid()
    }

    /// Flushes any trailing partial submap, stops the bundling thread, and
    /// returns the finalized manager with the complete trajectory.
    pub fn shutdown(&mut self) -> Result<SubmapManager> {
        self.ingest.flush()?;
        self.shared.request_shutdown();
        let handle = self
            .bundling_handle
            .take()
            .context("bundling thread already joined")?;
        let manager = handle
            .join()
            .map_err(|_| anyhow!("bundling thread panicked"))??;
        info!(
            frames = self.shared.frames_ingested(),
            submaps = self.shared.submaps_processed(),
            "fusion system shut down"
        );
        Ok(manager)
    }
}

impl Drop for FusionSystem {
    fn drop(&mut self) {
        if let Some(handle) = self.bundling_handle.take() {
            self.shared.request_shutdown();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector2};

    use super::*;
    use crate::cache::FrameCache;
    use crate::features::{
        Descriptor, ExtractedFeatures, FeatureStore, Keypoint, DESCRIPTOR_LEN,
    };
    use crate::geometry::SE3;
    use crate::optimizer::{AlignOutcome, AlignParams};

    /// Emits the same feature set for every frame: a uniformly revisited
    /// scene where everything matches.
    struct UniformExtractor {
        ids: Vec<usize>,
    }

    impl FeatureExtractor for UniformExtractor {
        fn extract(&mut self, _depth: &DepthImage, _color: &ColorImage) -> ExtractedFeatures {
            let keypoints = self
                .ids
                .iter()
                .map(|&id| Keypoint {
                    pos: Vector2::new((id % 4) as f64 * 0.8, ((id / 4) % 4) as f64 * 0.6),
                    depth: 1.0 + 0.07 * id as f64,
                })
                .collect();
            let descriptors = self
                .ids
                .iter()
                .map(|&id| {
                    let mut d = [0.0f32; DESCRIPTOR_LEN];
                    d[id % DESCRIPTOR_LEN] = 1.0;
                    Descriptor(d)
                })
                .collect();
            ExtractedFeatures {
                keypoints,
                descriptors,
            }
        }
    }

    /// Identity solver with a scripted dense-verification verdict per
    /// local solve (defaults to pass once the script runs out).
    struct ScriptedBundler {
        verdicts: VecDeque<bool>,
    }

    impl ScriptedBundler {
        fn passing() -> Self {
            Self {
                verdicts: VecDeque::new(),
            }
        }

        fn with_verdicts(verdicts: &[bool]) -> Self {
            Self {
                verdicts: verdicts.iter().copied().collect(),
            }
        }
    }

    impl SparseBundler for ScriptedBundler {
        fn align(
            &mut self,
            _store: &mut FeatureStore,
            _cache: &FrameCache,
            _poses: &mut [SE3],
            _params: AlignParams,
        ) -> AlignOutcome {
            AlignOutcome::default()
        }

        fn verify_trajectory(
            &mut self,
            _store: &FeatureStore,
            _cache: &FrameCache,
            _poses: &[SE3],
            _cfg: &BundleConfig,
        ) -> bool {
            self.verdicts.pop_front().unwrap_or(true)
        }
    }

    fn test_config() -> BundleConfig {
        let mut cfg = BundleConfig::default();
        cfg.submap_size = 2;
        cfg.max_local_frames = 3;
        cfg.max_keys_per_frame = 8;
        cfg.cache_width = 4;
        cfg.cache_height = 3;
        cfg.intrinsics = Matrix3::new(4.0, 0.0, 2.0, 0.0, 4.0, 1.5, 0.0, 0.0, 1.0);
        cfg.min_matches_local = 3;
        cfg.min_matches_global = 3;
        cfg.surf_area_pca_thresh = 1e-4;
        cfg.verify_match_corr_thresh = 0.0;
        cfg
    }

    fn flat_inputs() -> (DepthImage, ColorImage) {
        (
            DepthImage::new(4, 3, vec![1.0; 12]),
            ColorImage::new(4, 3, vec![[128, 128, 128]; 12]),
        )
    }

    #[test]
    fn uniform_sequence_fuses_every_submap() {
        let extractor = UniformExtractor {
            ids: (0..8).collect(),
        };
        let mut sys = FusionSystem::new(
            test_config(),
            Box::new(extractor),
            Box::new(ScriptedBundler::passing()),
        );

        let (depth, color) = flat_inputs();
        for i in 0..6 {
            sys.process_frame(&depth, &color).unwrap();
            if i == 2 {
                // overlap slot plus one owned frame, both valid
                assert!(sys.current_submap_valid());
            }
        }
        let mgr = sys.shutdown().unwrap();

        assert_eq!(sys.shared_state().frames_ingested(), 6);
        assert_eq!(mgr.global_store().len(), 3);
        assert_eq!(mgr.global_store().valid_count(), 3);
        assert_eq!(mgr.global_store().retry_len(), 0);

        // One pose per input frame; the static scene stays at identity.
        let traj = mgr.complete_trajectory();
        assert_eq!(traj.len(), 6);
        for pose in &traj {
            assert_relative_eq!(pose.translation.norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn rejected_submap_leaves_a_carried_forward_gap() {
        let extractor = UniformExtractor {
            ids: (0..8).collect(),
        };
        // Second local solve fails dense verification.
        let bundler = ScriptedBundler::with_verdicts(&[true, false, true]);
        let mut sys = FusionSystem::new(test_config(), Box::new(extractor), Box::new(bundler));

        let (depth, color) = flat_inputs();
        for _ in 0..6 {
            sys.process_frame(&depth, &color).unwrap();
        }
        let mgr = sys.shutdown().unwrap();

        // The rejected submap occupies an empty invalid global entry.
        assert_eq!(mgr.global_store().len(), 3);
        assert!(!mgr.global_store().is_valid(1));
        assert!(mgr.global_store().frame(1).keypoints.is_empty());
        assert!(mgr.global_store().is_valid(2));

        // Its frames repeat the last valid pose instead of vanishing.
        let traj = mgr.complete_trajectory();
        assert_eq!(traj.len(), 6);
        assert!(!mgr.trajectory_book().is_frame_valid(2));
        assert!(!mgr.trajectory_book().is_frame_valid(3));
        assert!(mgr.trajectory_book().is_frame_valid(4));
    }

    #[test]
    fn trailing_partial_submap_is_flushed() {
        let extractor = UniformExtractor {
            ids: (0..8).collect(),
        };
        let mut sys = FusionSystem::new(
            test_config(),
            Box::new(extractor),
            Box::new(ScriptedBundler::passing()),
        );

        let (depth, color) = flat_inputs();
        // 3 frames: one full submap plus one owned frame after the overlap.
        for _ in 0..3 {
            sys.process_frame(&depth, &color).unwrap();
        }
        let mgr = sys.shutdown().unwrap();

        assert_eq!(mgr.global_store().len(), 2);
        assert_eq!(mgr.complete_trajectory().len(), 3);
        // count header plus one 64-byte row per frame
        assert_eq!(mgr.serialize_trajectory().len(), 8 + 3 * 64);
    }

    #[test]
    fn single_frame_stream_yields_empty_trajectory() {
        let extractor = UniformExtractor {
            ids: (0..8).collect(),
        };
        let mut sys = FusionSystem::new(
            test_config(),
            Box::new(extractor),
            Box::new(ScriptedBundler::passing()),
        );

        let (depth, color) = flat_inputs();
        sys.process_frame(&depth, &color).unwrap();
        let mgr = sys.shutdown().unwrap();

        // One frame carries no optimizable constraints and is dropped.
        assert_eq!(sys.shared_state().frames_ingested(), 1);
        assert_eq!(mgr.global_store().len(), 0);
        assert!(mgr.complete_trajectory().is_empty());
    }

    #[test]
    fn keypoint_overflow_is_fatal() {
        let extractor = UniformExtractor {
            ids: (0..9).collect(),
        };
        let mut sys = FusionSystem::new(
            test_config(),
            Box::new(extractor),
            Box::new(ScriptedBundler::passing()),
        );

        let (depth, color) = flat_inputs();
        let err = sys.process_frame(&depth, &color).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BundleError>(),
            Some(BundleError::CapacityExceeded { count: 9, .. })
        ));
    }
}
