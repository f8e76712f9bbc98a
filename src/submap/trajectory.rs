//! Bookkeeping for the two-level trajectory.
//!
//! Each submap carries a local trajectory expressed relative to its first
//! frame, and every submap has one global pose anchoring that first frame
//! in world coordinates. The full per-frame trajectory is the composition
//! of the two. Frames can be invalidated (and later revalidated) in whole
//! submap-sized ranges; composition carries the last valid pose forward
//! across invalid stretches so downstream consumers always get a pose per
//! frame.
//!
//! Frame layout: submap `k` owns input frames `[k*S, k*S + owned_len)`.
//! Submaps after the first start with an overlap slot holding a copy of
//! the previous submap's final frame, so their owned frames sit at local
//! slots `1..=S` rather than `0..S-1`.

use crate::geometry::SE3;

/// One fused submap's worth of trajectory state.
struct SubmapEntry {
    /// Poses relative to the submap's first slot, one per local slot.
    local: Vec<SE3>,
    /// Per-slot validity as decided by the local solve.
    slot_valid: Vec<bool>,
    /// Number of input frames this submap owns (submap size except for a
    /// short trailing submap).
    owned_len: usize,
    /// Local slot index of the first owned frame (0 for the first submap,
    /// 1 afterwards because of the overlap slot).
    owned_offset: usize,
}

/// Global poses, per-submap local trajectories, and per-frame validity.
pub struct TrajectoryBook {
    submap_size: usize,
    global: Vec<SE3>,
    submaps: Vec<SubmapEntry>,
    frame_valid: Vec<bool>,
}

impl TrajectoryBook {
    pub fn new(submap_size: usize) -> Self {
        Self {
            submap_size,
            global: Vec::new(),
            submaps: Vec::new(),
            frame_valid: Vec::new(),
        }
    }

    pub fn num_submaps(&self) -> usize {
        self.submaps.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frame_valid.len()
    }

    pub fn global_pose(&self, submap: usize) -> &SE3 {
        &self.global[submap]
    }

    pub fn global_poses_mut(&mut self) -> &mut [SE3] {
        &mut self.global
    }

    /// Anchors `submap`'s global pose at `pose`, overriding the seed. Used
    /// when a global match against a non-adjacent predecessor gives a
    /// better initialization than dead reckoning.
    pub fn reseed_global(&mut self, submap: usize, pose: SE3) {
        self.global[submap] = pose;
    }

    /// Records a verified submap: its local trajectory, per-slot validity,
    /// and a seeded global pose for its anchor frame.
    ///
    /// The seed is the previous global pose composed with the previous
    /// submap's motion across the overlap, unless `revalidated` names a
    /// submap whose pose was just recovered, in which case that pose is
    /// taken directly.
    pub fn record_submap(
        &mut self,
        local: Vec<SE3>,
        slot_valid: Vec<bool>,
        revalidated: Option<usize>,
    ) {
        let owned_offset = if self.submaps.is_empty() { 0 } else { 1 };
        let owned_len = local.len() - owned_offset;

        self.global.push(self.seed_pose(revalidated));
        for slot in owned_offset..local.len() {
            self.frame_valid.push(slot_valid[slot]);
        }
        self.submaps.push(SubmapEntry {
            local,
            slot_valid,
            owned_len,
            owned_offset,
        });
    }

    /// Records a rejected submap of `num_slots` local frames: identity
    /// local poses, every owned frame invalid, global pose seeded from the
    /// previous submap alone.
    pub fn record_rejected(&mut self, num_slots: usize) {
        let owned_offset = if self.submaps.is_empty() { 0 } else { 1 };
        let owned_len = num_slots - owned_offset;

        self.global.push(self.seed_pose(None));
        for _ in 0..owned_len {
            self.frame_valid.push(false);
        }
        self.submaps.push(SubmapEntry {
            local: vec![SE3::identity(); num_slots],
            slot_valid: vec![false; num_slots],
            owned_len,
            owned_offset,
        });
    }

    fn seed_pose(&self, revalidated: Option<usize>) -> SE3 {
        if let Some(r) = revalidated {
            if r < self.global.len() {
                return self.global[r];
            }
        }
        match self.submaps.last() {
            None => SE3::identity(),
            Some(prev) => {
                let k = self.submaps.len() - 1;
                // The next anchor frame is the previous submap's last slot.
                match prev.local.last() {
                    Some(step) => self.global[k].compose(step),
                    None => self.global[k],
                }
            }
        }
    }

    /// Marks every frame owned by `submap` invalid.
    pub fn invalidate_submap(&mut self, submap: usize) {
        if submap >= self.submaps.len() {
            return;
        }
        let start = submap * self.submap_size;
        let len = self.submaps[submap].owned_len;
        for f in start..start + len {
            self.frame_valid[f] = false;
        }
    }

    /// Restores `submap`'s owned frames to the validity its local solve
    /// decided, used after a successful revalidation.
    pub fn revalidate_submap(&mut self, submap: usize) {
        if submap >= self.submaps.len() {
            return;
        }
        let start = submap * self.submap_size;
        let entry = &self.submaps[submap];
        for i in 0..entry.owned_len {
            self.frame_valid[start + i] = entry.slot_valid[entry.owned_offset + i];
        }
    }

    pub fn is_frame_valid(&self, frame: usize) -> bool {
        self.frame_valid.get(frame).copied().unwrap_or(false)
    }

    /// Composes the full per-frame trajectory. Invalid frames repeat the
    /// last valid composed pose; a leading invalid stretch yields identity.
    pub fn compose(&self) -> Vec<SE3> {
        let mut out = Vec::with_capacity(self.frame_valid.len());
        let mut last = SE3::identity();
        for f in 0..self.frame_valid.len() {
            let k = f / self.submap_size;
            if self.frame_valid[f] && k < self.submaps.len() {
                let entry = &self.submaps[k];
                let slot = f % self.submap_size + entry.owned_offset;
                last = self.global[k].compose(&entry.local[slot]);
            }
            out.push(last);
        }
        out
    }

    /// Serializes the composed trajectory as little-endian rows: frame
    /// index, then quaternion (w, i, j, k), then translation (x, y, z).
    pub fn serialize(&self) -> Vec<u8> {
        let poses = self.compose();
        let mut buf = Vec::with_capacity(8 + poses.len() * (8 + 7 * 8));
        buf.extend_from_slice(&(poses.len() as u64).to_le_bytes());
        for (f, pose) in poses.iter().enumerate() {
            buf.extend_from_slice(&(f as u64).to_le_bytes());
            let q = pose.rotation.quaternion();
            for v in [q.w, q.i, q.j, q.k] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            for v in [
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
            ] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf
    }

}
