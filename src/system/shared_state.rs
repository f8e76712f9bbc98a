//! Shared state between the ingest and bundling threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Flags and counters accessible by both threads.
pub struct SharedState {
    /// Request the bundling thread to finish processing and exit.
    pub shutdown_requested: AtomicBool,

    /// Total input frames accepted by ingest.
    pub frames_ingested: AtomicUsize,

    /// Completed submaps the bundling thread has processed.
    pub submaps_processed: AtomicUsize,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shutdown_requested: AtomicBool::new(false),
            frames_ingested: AtomicUsize::new(0),
            submaps_processed: AtomicUsize::new(0),
        })
    }

    /// Request shutdown of the bundling thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn note_frame_ingested(&self) {
        self.frames_ingested.fetch_add(1, Ordering::SeqCst);
    }

    pub fn frames_ingested(&self) -> usize {
        self.frames_ingested.load(Ordering::SeqCst)
    }

    pub fn note_submap_processed(&self) {
        self.submaps_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn submaps_processed(&self) -> usize {
        self.submaps_processed.load(Ordering::SeqCst)
    }
}
