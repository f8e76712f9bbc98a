//! Frame ingest: the producer side of the bundling pipeline.
//!
//! Each input frame is feature-extracted, appended to the current local
//! store and cache, and matched against the submap's earlier frames. When
//! the submap's last owned slot fills, the final frame is duplicated into
//! a fresh store as the overlap slot, and the completed submap is sent to
//! the bundling thread. The sender blocks if the bundling thread is still
//! busy with the previous submap.

use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{ColorImage, DepthImage, FrameCache};
use crate::config::BundleConfig;
use crate::error::BundleError;
use crate::features::{FeatureExtractor, FeatureStore, StoreKind};
use crate::matching::{match_and_filter, MatchEngine};

use super::messages::CompletedSubmap;

/// Accumulates input frames into local submaps and hands them off.
pub struct FrameIngest {
    cfg: Arc<BundleConfig>,
    extractor: Box<dyn FeatureExtractor>,
    engine: Arc<Mutex<MatchEngine>>,
    store: FeatureStore,
    cache: FrameCache,
    sender: Sender<CompletedSubmap>,
    frames_ingested: usize,
    submaps_completed: usize,
}

impl FrameIngest {
    pub fn new(
        cfg: Arc<BundleConfig>,
        extractor: Box<dyn FeatureExtractor>,
        engine: Arc<Mutex<MatchEngine>>,
        sender: Sender<CompletedSubmap>,
    ) -> Self {
        let store = FeatureStore::new(StoreKind::Local, cfg.max_local_frames);
        let cache = FrameCache::new(cfg.max_local_frames, &cfg);
        Self {
            cfg,
            extractor,
            engine,
            store,
            cache,
            sender,
            frames_ingested: 0,
            submaps_completed: 0,
        }
    }

    /// Number of frames accepted so far.
    pub fn frames_ingested(&self) -> usize {
        self.frames_ingested
    }

    /// Whether the current submap still has enough valid frames to be
    /// worth optimizing.
    pub fn current_submap_valid(&self) -> bool {
        self.store.valid_count() >= 2
    }

    /// Ingests one input frame: extract, append, match. Completes and
    /// hands off the submap when its last owned slot fills.
    ///
    /// A frame whose keypoint count exceeds the configured per-frame
    /// capacity is fatal; downstream buffers are sized to that capacity.
    pub fn ingest(&mut self, depth: &DepthImage, color: &ColorImage) -> Result<()> {
        let frame = self.frames_ingested;
        let features = self.extractor.extract(depth, color);
        if features.len() > self.cfg.max_keys_per_frame {
            return Err(BundleError::CapacityExceeded {
                frame,
                count: features.len(),
                max: self.cfg.max_keys_per_frame,
            }
            .into());
        }

        self.store
            .add_frame(features.keypoints, features.descriptors)?;
        self.cache.store(depth, color);
        let matched = match_and_filter(&mut self.store, &self.cache, &self.engine, &self.cfg);
        debug!(frame, ?matched, "frame ingested");

        self.frames_ingested += 1;
        if self.frames_ingested % self.cfg.submap_size == 0 {
            self.complete_submap()?;
        }
        Ok(())
    }

    /// Sends any partially filled trailing submap. Called at shutdown; a
    /// store holding fewer than two frames carries no optimizable
    /// constraints and is dropped. A stream that ends after a single
    /// input frame therefore yields an empty trajectory.
    pub fn flush(&mut self) -> Result<()> {
        if self.store.len() < 2 {
            return Ok(());
        }
        let store = mem::replace(
            &mut self.store,
            FeatureStore::new(StoreKind::Local, self.cfg.max_local_frames),
        );
        let cache = mem::replace(
            &mut self.cache,
            FrameCache::new(self.cfg.max_local_frames, &self.cfg),
        );
        self.send_completed(store, cache)
    }

    fn complete_submap(&mut self) -> Result<()> {
        // Seed the next store with the overlap frame: a duplicate of the
        // current submap's final frame, owned by the next submap as its
        // slot 0.
        let mut next = FeatureStore::new(StoreKind::Local, self.cfg.max_local_frames);
        let mut next_cache = FrameCache::new(self.cfg.max_local_frames, &self.cfg);
        let last = self.store.len() - 1;
        let overlap = self.store.frame(last);
        next.add_frame(overlap.keypoints.clone(), overlap.descriptors.clone())?;
        next_cache.copy_frame_from(&self.cache, last);

        let store = mem::replace(&mut self.store, next);
        let cache = mem::replace(&mut self.cache, next_cache);
        self.send_completed(store, cache)
    }

    fn send_completed(&mut self, store: FeatureStore, cache: FrameCache) -> Result<()> {
        let msg = CompletedSubmap {
            submap_index: self.submaps_completed,
            store,
            cache,
        };
        info!(submap = msg.submap_index, frames = msg.store.len(), "submap completed");
        self.submaps_completed += 1;
        self.sender
            .send(msg)
            .map_err(|_| anyhow!("bundling thread stopped"))
    }
}
