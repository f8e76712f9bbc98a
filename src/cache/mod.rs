//! Downsampled per-frame buffer cache.

pub mod frame_cache;

pub use frame_cache::{CachedFrame, ColorImage, DepthImage, FrameCache};
