//! Shared descriptor matching engine.
//!
//! One engine instance serves both local and global matching. It can only
//! process one descriptor pair at a time, so callers serialize access
//! through a dedicated `Mutex` around it and hold the lock for an entire
//! per-frame batch; a global-mode batch must never interleave with a
//! concurrently running local-mode batch. That lock is distinct from any
//! lock protecting store contents.

use crate::features::{Correspondence, Descriptor};

/// Brute-force nearest/second-nearest descriptor matcher with a ratio test.
pub struct MatchEngine {
    /// Absolute descriptor-distance acceptance threshold.
    match_thresh: f64,
}

impl MatchEngine {
    pub fn new(match_thresh: f64) -> Self {
        Self { match_thresh }
    }

    /// Match one descriptor set pair.
    ///
    /// For each descriptor of frame `i`, the nearest and second-nearest
    /// neighbors in frame `j` are found; the match is kept if the nearest
    /// distance passes the absolute threshold and the nearest/second-nearest
    /// ratio stays below `ratio_max` (mode-dependent: looser for local,
    /// stricter for global).
    pub fn match_pair(
        &self,
        descs_i: &[Descriptor],
        descs_j: &[Descriptor],
        ratio_max: f64,
    ) -> Vec<Correspondence> {
        let mut matches = Vec::new();
        if descs_j.is_empty() {
            return matches;
        }

        for (key_i, di) in descs_i.iter().enumerate() {
            let mut best = f64::INFINITY;
            let mut second = f64::INFINITY;
            let mut best_j = 0usize;
            for (key_j, dj) in descs_j.iter().enumerate() {
                let dist_sq = di.distance_sq(dj);
                if dist_sq < best {
                    second = best;
                    best = dist_sq;
                    best_j = key_j;
                } else if dist_sq < second {
                    second = dist_sq;
                }
            }

            let distance = best.sqrt();
            if distance > self.match_thresh {
                continue;
            }
            // With a single candidate there is no second neighbor to test.
            if second.is_finite() && distance / second.sqrt() > ratio_max {
                continue;
            }
            matches.push(Correspondence {
                key_i,
                key_j: best_j,
                distance,
            });
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DESCRIPTOR_LEN;

    fn desc(seed: f32) -> Descriptor {
        let mut d = [0.0f32; DESCRIPTOR_LEN];
        d[0] = seed;
        Descriptor(d)
    }

    #[test]
    fn test_matches_nearest() {
        let engine = MatchEngine::new(0.7);
        let a = vec![desc(1.0)];
        let b = vec![desc(5.0), desc(1.1), desc(9.0)];
        let matches = engine.match_pair(&a, &b, 0.9);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].key_j, 1);
    }

    #[test]
    fn test_absolute_threshold_rejects() {
        let engine = MatchEngine::new(0.7);
        let a = vec![desc(0.0)];
        let b = vec![desc(2.0), desc(9.0)];
        assert!(engine.match_pair(&a, &b, 0.9).is_empty());
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous() {
        let engine = MatchEngine::new(1.0);
        let a = vec![desc(0.0)];
        // Two nearly equidistant candidates: ambiguous, must be dropped.
        let b = vec![desc(0.5), desc(0.55)];
        assert!(engine.match_pair(&a, &b, 0.8).is_empty());
        // A clearly closer candidate survives.
        let b = vec![desc(0.1), desc(0.9)];
        assert_eq!(engine.match_pair(&a, &b, 0.8).len(), 1);
    }
}
