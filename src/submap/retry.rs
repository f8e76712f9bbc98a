//! Cycle guard for the revalidation retry queue.
//!
//! Unmatched submaps sit in a queue and are retried whenever new global
//! context arrives. Once the input stream has ended the queue is swept in
//! order; seeing the same index twice without any successful revalidation
//! in between means a full pass produced no progress, and further sweeping
//! would spin forever. This tracks that condition explicitly.

/// State of the end-of-stream retry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScan {
    /// No sweep in progress.
    NotRunning,
    /// Sweeping; `start` is the first index seen this pass.
    Scanning { start: usize },
    /// A full pass completed without progress. Retrying is pointless
    /// until something changes.
    Exhausted,
}

impl RetryScan {
    pub fn new() -> Self {
        RetryScan::NotRunning
    }

    /// Records that `idx` is about to be retried. Returns `false` when the
    /// sweep has come back around to its starting index without any
    /// revalidation succeeding, i.e. the caller should stop.
    pub fn observe(&mut self, idx: usize) -> bool {
        match *self {
            RetryScan::NotRunning => {
                *self = RetryScan::Scanning { start: idx };
                true
            }
            RetryScan::Scanning { start } if start == idx => {
                *self = RetryScan::Exhausted;
                false
            }
            RetryScan::Scanning { .. } => true,
            RetryScan::Exhausted => false,
        }
    }

    /// A revalidation succeeded; the queue shrank, so a fresh pass is
    /// worth making.
    pub fn progressed(&mut self) {
        *self = RetryScan::NotRunning;
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryScan::Exhausted)
    }
}

impl Default for RetryScan {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halts_after_one_full_pass_without_progress() {
        let mut scan = RetryScan::new();
        // Queue of three indices cycling 4 -> 7 -> 9 -> 4 ...
        assert!(scan.observe(4));
        assert!(scan.observe(7));
        assert!(scan.observe(9));
        assert!(!scan.observe(4));
        assert!(scan.is_exhausted());
        // Stays exhausted on further attempts.
        assert!(!scan.observe(7));
    }

    #[test]
    fn progress_restarts_the_sweep() {
        let mut scan = RetryScan::new();
        assert!(scan.observe(2));
        assert!(scan.observe(5));
        scan.progressed();
        // 2 comes around again but the pass restarted, so it is fresh.
        assert!(scan.observe(2));
        assert!(scan.observe(5));
        assert!(!scan.observe(2));
    }

    #[test]
    fn exhausted_clears_on_progress() {
        let mut scan = RetryScan::new();
        assert!(scan.observe(1));
        assert!(!scan.observe(1));
        assert!(scan.is_exhausted());
        scan.progressed();
        assert!(scan.observe(1));
    }
}
