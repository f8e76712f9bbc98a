//! Per-frame match-and-filter pipeline.
//!
//! Run once for each newly completed frame of a store (and re-run with a
//! rewound cursor during revalidation): raw descriptor matching against
//! the candidate frames, the filter cascade per pair, best-pair selection,
//! and the validity/graph side effects.

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::FrameCache;
use crate::config::BundleConfig;
use crate::features::{FeatureStore, StoreKind};

use super::engine::MatchEngine;
use super::filters::{filter_dense_verify, filter_geometric, filter_surface_area};

/// Match the store's current frame against its candidate partners and
/// filter the results. Returns the index of the best-matching partner, or
/// `None` if the frame is unmatched.
///
/// Candidates: all prior frames when the cursor is the newest frame;
/// only frames newer than the cursor when it has been rewound for a
/// revalidation pass (the older ones were already tried when the frame
/// first failed).
///
/// Side effects: the pair-match cache is written for every candidate
/// (failed candidates record zero matches), the current frame's validity
/// flag is set from the outcome, and surviving pairs are added to the
/// correspondence graph. Frame 0 is left untouched: it has no prior to
/// match against and is always valid.
pub fn match_and_filter(
    store: &mut FeatureStore,
    cache: &FrameCache,
    engine: &Mutex<MatchEngine>,
    cfg: &BundleConfig,
) -> Option<usize> {
    let num_frames = store.len();
    let cur = store.current_frame();
    if cur == 0 && num_frames <= 1 {
        return None;
    }

    let (ratio_max, min_matches) = match store.kind() {
        StoreKind::Local => (cfg.ratio_max_local, cfg.min_matches_local),
        StoreKind::Global => (cfg.ratio_max_global, cfg.min_matches_global),
    };
    let intrinsics_inv = cfg.intrinsics_inv();

    let candidates: Vec<usize> = if cur + 1 == num_frames {
        (0..cur).collect()
    } else {
        (cur + 1..num_frames).collect()
    };
    if candidates.is_empty() {
        return None;
    }

    if store.frame(cur).keypoints.is_empty() {
        for &prev in &candidates {
            store.pair_match_mut(prev, cur).mark_empty();
        }
        store.invalidate_frame(cur);
        return None;
    }

    // Raw matching. The engine processes one descriptor pair at a time;
    // the lock is held for the whole batch so a local-mode and a
    // global-mode batch never interleave.
    {
        let engine = engine.lock();
        for &prev in &candidates {
            if !store.is_valid(prev) || store.frame(prev).keypoints.is_empty() {
                store.pair_match_mut(prev, cur).mark_empty();
                continue;
            }
            // Pair records are keyed (lo, hi) and their correspondences run
            // lo -> hi, also when the cursor was rewound below `prev`.
            let (lo, hi) = if prev < cur { (prev, cur) } else { (cur, prev) };
            let mut raw = engine.match_pair(
                &store.frame(lo).descriptors,
                &store.frame(hi).descriptors,
                ratio_max,
            );
            raw.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            let pair = store.pair_match_mut(lo, hi);
            pair.raw = raw;
            pair.filtered.clear();
            pair.transform = None;
        }
    }

    // Filter cascade per candidate pair.
    for &prev in &candidates {
        if store.pair_match(prev, cur).map_or(true, |p| p.raw.is_empty()) {
            continue;
        }
        let (lo, hi) = if prev < cur { (prev, cur) } else { (cur, prev) };
        let mut pair = std::mem::take(store.pair_match_mut(lo, hi));

        filter_geometric(
            &mut pair,
            &store.frame(lo).keypoints,
            &store.frame(hi).keypoints,
            &intrinsics_inv,
            min_matches,
            cfg.max_rigid_residual_sq,
        );
        filter_surface_area(
            &mut pair,
            &store.frame(lo).keypoints,
            &store.frame(hi).keypoints,
            &intrinsics_inv,
            cfg.surf_area_pca_thresh,
        );
        filter_dense_verify(
            &mut pair,
            cache.frame(lo),
            cache.frame(hi),
            cache.width(),
            cache.height(),
            cfg,
        );

        *store.pair_match_mut(lo, hi) = pair;
    }

    // Best-supported surviving pair decides the frame's fate.
    let mut best: Option<(usize, usize)> = None; // (match count, partner)
    for &prev in &candidates {
        if !store.is_valid(prev) {
            continue;
        }
        let count = store
            .pair_match(prev, cur)
            .map_or(0, |p| p.filtered.len());
        if count > 0 && best.map_or(true, |(c, _)| count >= c) {
            best = Some((count, prev));
        }
    }

    match best {
        Some((count, matched)) => {
            store.revalidate_frame(cur);
            for &prev in &candidates {
                if store
                    .pair_match(prev, cur)
                    .is_some_and(|p| !p.filtered.is_empty())
                {
                    store.add_pair_to_graph(prev, cur, &intrinsics_inv);
                }
            }
            debug!(
                kind = store.kind().name(),
                frame = cur,
                matched,
                count,
                "frame matched"
            );
            Some(matched)
        }
        None => {
            store.invalidate_frame(cur);
            debug!(kind = store.kind().name(), frame = cur, "frame unmatched");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ColorImage, DepthImage};
    use crate::features::{Descriptor, Keypoint, DESCRIPTOR_LEN};
    use nalgebra::Vector2;

    fn pipeline_config() -> BundleConfig {
        BundleConfig {
            min_matches_local: 5,
            min_matches_global: 5,
            cache_width: 8,
            cache_height: 6,
            intrinsics: nalgebra::Matrix3::new(4.0, 0.0, 4.0, 0.0, 4.0, 3.0, 0.0, 0.0, 1.0),
            // The synthetic flat-wall cache frames carry no texture, so the
            // photometric agreement never clears the default fraction.
            verify_match_corr_thresh: 0.0,
            verify_match_err_thresh: 1.0,
            max_rigid_residual_sq: 0.01,
            surf_area_pca_thresh: 0.001,
            ..BundleConfig::default()
        }
    }

    fn distinctive_desc(seed: usize) -> Descriptor {
        let mut d = [0.0f32; DESCRIPTOR_LEN];
        d[seed % DESCRIPTOR_LEN] = 0.3;
        d[(seed * 7 + 1) % DESCRIPTOR_LEN] = 0.2;
        Descriptor(d)
    }

    fn matchable_frame(n: usize) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let kps = (0..n)
            .map(|k| Keypoint {
                pos: Vector2::new(0.5 + 1.1 * (k % 4) as f64, 0.5 + 1.3 * (k / 4) as f64),
                depth: 1.0 + 0.2 * (k % 3) as f64,
            })
            .collect();
        let descs = (0..n).map(distinctive_desc).collect();
        (kps, descs)
    }

    fn filled_cache(cfg: &BundleConfig, frames: usize) -> FrameCache {
        let mut cache = FrameCache::new(frames, cfg);
        let depth = DepthImage::new(16, 12, vec![1.5; 16 * 12]);
        let color = ColorImage::new(16, 12, vec![[100, 100, 100]; 16 * 12]);
        for _ in 0..frames {
            cache.store(&depth, &color);
        }
        cache
    }

    #[test]
    fn test_identical_frames_match() {
        let cfg = pipeline_config();
        let cache = filled_cache(&cfg, 2);
        let engine = Mutex::new(MatchEngine::new(cfg.match_thresh));
        let mut store = FeatureStore::new(StoreKind::Local, 4);

        let (kps, descs) = matchable_frame(10);
        store.add_frame(kps.clone(), descs.clone()).unwrap();
        assert_eq!(match_and_filter(&mut store, &cache, &engine, &cfg), None);
        assert!(store.is_valid(0));

        store.add_frame(kps, descs).unwrap();
        let matched = match_and_filter(&mut store, &cache, &engine, &cfg);
        assert_eq!(matched, Some(0));
        assert!(store.is_valid(1));
        assert!(store.active_correspondences().count() >= 5);
    }

    #[test]
    fn test_unrelated_frame_marked_invalid() {
        let cfg = pipeline_config();
        let cache = filled_cache(&cfg, 2);
        let engine = Mutex::new(MatchEngine::new(cfg.match_thresh));
        let mut store = FeatureStore::new(StoreKind::Local, 4);

        let (kps, descs) = matchable_frame(10);
        store.add_frame(kps.clone(), descs).unwrap();
        // Same geometry, completely different descriptors.
        let other_descs = (0..10).map(|k| distinctive_desc(k + 57)).collect();
        store.add_frame(kps, other_descs).unwrap();

        let matched = match_and_filter(&mut store, &cache, &engine, &cfg);
        assert_eq!(matched, None);
        assert!(!store.is_valid(1));
        assert!(store.pair_match(0, 1).is_some());
    }

    #[test]
    fn test_empty_frame_invalid() {
        let cfg = pipeline_config();
        let cache = filled_cache(&cfg, 2);
        let engine = Mutex::new(MatchEngine::new(cfg.match_thresh));
        let mut store = FeatureStore::new(StoreKind::Local, 4);

        let (kps, descs) = matchable_frame(10);
        store.add_frame(kps, descs).unwrap();
        store.add_frame(vec![], vec![]).unwrap();

        assert_eq!(match_and_filter(&mut store, &cache, &engine, &cfg), None);
        assert!(!store.is_valid(1));
    }
}
