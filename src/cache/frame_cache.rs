//! Frame cache: a ring of fully-derived per-frame buffers.
//!
//! For each stored frame the cache holds a downsampled depth map and the
//! buffers derived from it: camera-space positions, normals, intensity and
//! intensity gradients. These feed the dense-verification filter and the
//! dense trajectory check. The cache is pure storage + transform; frame
//! validity lives in the feature store, not here.
//!
//! Frames are addressed by their slot index. `copy_frame_from` duplicates a
//! fully-derived frame between caches without recomputation, which is how a
//! submap's representative frame is handed to the global cache and how the
//! overlap frame pre-seeds the next submap's cache.

use nalgebra::Vector3;

use crate::config::BundleConfig;

/// Depth sentinel for pixels without a valid measurement.
const INVALID_DEPTH: f64 = f64::NEG_INFINITY;

/// Raw depth input at sensor resolution, row-major, meters.
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f64>,
}

impl DepthImage {
    pub fn new(width: usize, height: usize, pixels: Vec<f64>) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        Self {
            width,
            height,
            pixels,
        }
    }

    fn at(&self, x: usize, y: usize) -> f64 {
        self.pixels[y * self.width + x]
    }
}

/// Raw color input at sensor resolution, row-major RGB.
#[derive(Debug, Clone)]
pub struct ColorImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[u8; 3]>,
}

impl ColorImage {
    pub fn new(width: usize, height: usize, pixels: Vec<[u8; 3]>) -> Self {
        debug_assert_eq!(pixels.len(), width * height);
        Self {
            width,
            height,
            pixels,
        }
    }

    fn luminance_at(&self, x: usize, y: usize) -> f64 {
        let [r, g, b] = self.pixels[y * self.width + x];
        (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64) / 255.0
    }
}

/// One frame's derived buffers at cache resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFrame {
    /// Downsampled depth; `INVALID_DEPTH` marks holes.
    pub depth: Vec<f64>,
    /// Camera-space position per pixel.
    pub camera_pos: Vec<Option<Vector3<f64>>>,
    /// Surface normal per pixel.
    pub normals: Vec<Option<Vector3<f64>>>,
    /// Downsampled intensity in [0, 1].
    pub intensity: Vec<f64>,
    /// Central-difference intensity gradients.
    pub intensity_dx: Vec<f64>,
    pub intensity_dy: Vec<f64>,
}

/// Ring of cached frames for one feature store.
pub struct FrameCache {
    width: usize,
    height: usize,
    max_frames: usize,
    depth_min: f64,
    depth_max: f64,
    intrinsics_inv: nalgebra::Matrix3<f64>,
    frames: Vec<CachedFrame>,
    current: usize,
}

impl FrameCache {
    pub fn new(max_frames: usize, cfg: &BundleConfig) -> Self {
        Self {
            width: cfg.cache_width,
            height: cfg.cache_height,
            max_frames,
            depth_min: cfg.depth_min,
            depth_max: cfg.depth_max,
            intrinsics_inv: cfg.intrinsics_inv(),
            frames: Vec::new(),
            current: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of frames currently stored.
    pub fn len(&self) -> usize {
        self.current
    }

    pub fn is_empty(&self) -> bool {
        self.current == 0
    }

    pub fn frame(&self, index: usize) -> &CachedFrame {
        &self.frames[index]
    }

    /// Downsample and derive one input frame, writing the next ring slot.
    /// Returns the slot index.
    pub fn store(&mut self, depth: &DepthImage, color: &ColorImage) -> usize {
        debug_assert!(self.current < self.max_frames, "frame cache overrun");

        let frame = self.derive(depth, color);
        self.put(frame)
    }

    /// Duplicate a fully-derived frame from another cache into the next slot.
    pub fn copy_frame_from(&mut self, src: &FrameCache, src_index: usize) -> usize {
        debug_assert_eq!((src.width, src.height), (self.width, self.height));
        self.put(src.frames[src_index].clone())
    }

    /// Rewind the ring for reuse by the next submap. Slot storage is kept.
    pub fn reset(&mut self) {
        self.current = 0;
    }

    fn put(&mut self, frame: CachedFrame) -> usize {
        let slot = self.current;
        if slot == self.frames.len() {
            self.frames.push(frame);
        } else {
            self.frames[slot] = frame;
        }
        self.current += 1;
        slot
    }

    fn derive(&self, depth_in: &DepthImage, color_in: &ColorImage) -> CachedFrame {
        let (w, h) = (self.width, self.height);
        let n = w * h;

        // Depth: box-average of valid source pixels in each block.
        let mut depth = vec![INVALID_DEPTH; n];
        let sx = depth_in.width / w;
        let sy = depth_in.height / h;
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                let mut count = 0usize;
                for dy in 0..sy.max(1) {
                    for dx in 0..sx.max(1) {
                        let ix = (x * sx + dx).min(depth_in.width - 1);
                        let iy = (y * sy + dy).min(depth_in.height - 1);
                        let d = depth_in.at(ix, iy);
                        if d.is_finite() && d >= self.depth_min && d <= self.depth_max {
                            sum += d;
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    depth[y * w + x] = sum / count as f64;
                }
            }
        }

        // Camera-space positions from back-projection.
        let mut camera_pos = vec![None; n];
        for y in 0..h {
            for x in 0..w {
                let d = depth[y * w + x];
                if d != INVALID_DEPTH {
                    let ray = self.intrinsics_inv * Vector3::new(x as f64, y as f64, 1.0);
                    camera_pos[y * w + x] = Some(ray * d);
                }
            }
        }

        // Normals from cross products of forward differences.
        let mut normals = vec![None; n];
        for y in 0..h.saturating_sub(1) {
            for x in 0..w.saturating_sub(1) {
                if let (Some(c), Some(px), Some(py)) = (
                    camera_pos[y * w + x],
                    camera_pos[y * w + x + 1],
                    camera_pos[(y + 1) * w + x],
                ) {
                    let normal = (px - c).cross(&(py - c));
                    let norm = normal.norm();
                    if norm > 1e-12 {
                        normals[y * w + x] = Some(normal / norm);
                    }
                }
            }
        }

        // Intensity: nearest-pixel luminance at block centers.
        let csx = color_in.width / w;
        let csy = color_in.height / h;
        let mut intensity = vec![0.0; n];
        for y in 0..h {
            for x in 0..w {
                let ix = (x * csx).min(color_in.width - 1);
                let iy = (y * csy).min(color_in.height - 1);
                intensity[y * w + x] = color_in.luminance_at(ix, iy);
            }
        }

        // Central-difference gradients, zero at the border.
        let mut intensity_dx = vec![0.0; n];
        let mut intensity_dy = vec![0.0; n];
        for y in 1..h.saturating_sub(1) {
            for x in 1..w.saturating_sub(1) {
                intensity_dx[y * w + x] =
                    0.5 * (intensity[y * w + x + 1] - intensity[y * w + x - 1]);
                intensity_dy[y * w + x] =
                    0.5 * (intensity[(y + 1) * w + x] - intensity[(y - 1) * w + x]);
            }
        }

        CachedFrame {
            depth,
            camera_pos,
            normals,
            intensity,
            intensity_dx,
            intensity_dy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BundleConfig {
        BundleConfig {
            cache_width: 8,
            cache_height: 6,
            intrinsics: nalgebra::Matrix3::new(4.0, 0.0, 4.0, 0.0, 4.0, 3.0, 0.0, 0.0, 1.0),
            ..BundleConfig::default()
        }
    }

    fn flat_inputs(depth_value: f64) -> (DepthImage, ColorImage) {
        let depth = DepthImage::new(16, 12, vec![depth_value; 16 * 12]);
        let color = ColorImage::new(16, 12, vec![[128, 128, 128]; 16 * 12]);
        (depth, color)
    }

    #[test]
    fn test_store_derives_positions_and_normals() {
        let cfg = test_config();
        let mut cache = FrameCache::new(4, &cfg);
        let (depth, color) = flat_inputs(2.0);

        let slot = cache.store(&depth, &color);
        assert_eq!(slot, 0);
        assert_eq!(cache.len(), 1);

        let frame = cache.frame(0);
        assert!(frame.depth.iter().all(|&d| (d - 2.0).abs() < 1e-12));
        // Flat wall facing the camera: normals along -Z in camera convention.
        let normal = frame.normals[1 * 8 + 1].unwrap();
        assert!(normal.z.abs() > 0.99);
        // Uniform gray image: zero gradients.
        assert!(frame.intensity_dx.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_out_of_range_depth_invalid() {
        let cfg = test_config();
        let mut cache = FrameCache::new(1, &cfg);
        let (depth, color) = flat_inputs(100.0);
        cache.store(&depth, &color);
        let frame = cache.frame(0);
        assert!(frame.camera_pos.iter().all(|p| p.is_none()));
    }

    #[test]
    fn test_copy_frame_fidelity() {
        let cfg = test_config();
        let mut src = FrameCache::new(2, &cfg);
        let mut dst = FrameCache::new(2, &cfg);
        let (depth, color) = flat_inputs(1.5);
        src.store(&depth, &color);

        let slot = dst.copy_frame_from(&src, 0);
        assert_eq!(dst.frame(slot), src.frame(0));
    }

    #[test]
    fn test_reset_rewinds_ring() {
        let cfg = test_config();
        let mut cache = FrameCache::new(2, &cfg);
        let (depth, color) = flat_inputs(1.0);
        cache.store(&depth, &color);
        cache.store(&depth, &color);
        cache.reset();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.store(&depth, &color), 0);
    }
}
