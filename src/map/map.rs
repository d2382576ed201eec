//! Map - Registry of KeyFrames and MapPoints.
//!
//! The Map owns every entity behind an `Arc` and hands out ids for
//! cross-references: keyframe slots hold `MapPointId`s and landmark
//! observations hold `KeyFrameId`s. Id counters are atomic, so entities can be
//! created from tracking, local mapping and loop closing concurrently.
//!
//! It provides:
//! - Creation of keyframes (promotion from a Frame) and landmarks
//! - Bidirectional associations (KF slot ↔ MP observation)
//! - Landmark lifecycle: erase observation, set bad, replace (fusion)
//! - Descriptor and normal/depth maintenance
//! - Covisibility and scene-depth queries
//!
//! Registry locks are only held to clone an `Arc` out; no entity lock is
//! taken while a registry lock is held. Edits that touch both sides of an
//! association (associate, erase, set bad, replace, keyframe insert/erase)
//! run under one update lock, taken before any entity lock, so a keyframe
//! slot and the landmark's observation always change together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::features::FeatureType;
use crate::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::{compute_normal_and_depth, select_distinctive_descriptor, MapPoint};
use super::types::{KeyFrameId, MapPointId};

/// Keyframes a replacement record is kept for. Only frames tracked since the
/// fusion can still refer to the fused-away landmark.
const REPLACEMENT_HISTORY_KEYFRAMES: u64 = 2;

#[derive(Debug, Clone, Copy)]
struct Replacement {
    by: MapPointId,
    /// Keyframe counter when the fusion happened.
    at_kf: u64,
}

/// The SLAM map containing KeyFrames and MapPoints.
#[derive(Default)]
pub struct Map {
    keyframes: RwLock<HashMap<KeyFrameId, Arc<KeyFrame>>>,
    map_points: RwLock<HashMap<MapPointId, Arc<MapPoint>>>,
    /// Fused-away landmark -> the landmark that absorbed it. Chains are
    /// collapsed, so every entry points at the final survivor.
    replaced: Mutex<HashMap<MapPointId, Replacement>>,
    update: Mutex<()>,
    next_kf_id: AtomicU64,
    next_mp_id: AtomicU64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.next_kf_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_map_point_id(&self) -> MapPointId {
        MapPointId::new(self.next_mp_id.fetch_add(1, Ordering::SeqCst))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Promote `frame` to a keyframe and register it.
    ///
    /// Every live landmark in the frame's slots gains an observation from the
    /// new keyframe and has its descriptor and normal refreshed. Slots whose
    /// landmark is gone, or that would observe a landmark twice, are cleared.
    pub fn insert_keyframe(&self, frame: &Frame) -> Arc<KeyFrame> {
        let _update = self.update.lock();
        let kf = Arc::new(KeyFrame::from_frame(self.next_keyframe_id(), frame));
        self.keyframes.write().insert(kf.id, Arc::clone(&kf));
        self.prune_replacements(kf.id);

        let mut observed = Vec::new();
        for (channel, idx, mp_id) in kf.all_map_point_slots() {
            let Some(mp) = self.map_point(mp_id) else {
                kf.set_map_point(channel, idx, None);
                continue;
            };
            if mp.channel != channel {
                kf.set_map_point(channel, idx, None);
                continue;
            }
            let stereo = kf.features(channel).is_stereo(idx);
            if mp.add_observation(kf.id, idx, stereo) {
                observed.push(mp_id);
            } else {
                kf.set_map_point(channel, idx, None);
            }
        }

        for &mp_id in &observed {
            self.update_normal_and_depth(mp_id);
            self.compute_distinctive_descriptors(mp_id);
        }

        debug!(
            "[Map] inserted {} from {}: {} landmarks observed",
            kf.id,
            frame.id,
            observed.len()
        );
        kf
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.keyframes.read().get(&id).cloned()
    }

    pub fn keyframes(&self) -> Vec<Arc<KeyFrame>> {
        self.keyframes.read().values().cloned().collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.read().len()
    }

    /// Mark a keyframe bad and detach it from every landmark it observes.
    ///
    /// Landmarks left with too little support are discarded in turn.
    pub fn erase_keyframe(&self, kf_id: KeyFrameId) {
        let _update = self.update.lock();
        let Some(kf) = self.keyframe(kf_id) else {
            return;
        };
        kf.set_bad();

        for (channel, idx, mp_id) in kf.all_map_point_slots() {
            kf.erase_map_point_match(channel, idx, mp_id);
            self.erase_observation_locked(mp_id, kf_id);
        }

        self.keyframes.write().remove(&kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark whose reference is `reference_kf`.
    ///
    /// The landmark has no observations yet; add them with [`Map::associate`].
    pub fn create_map_point(
        &self,
        channel: FeatureType,
        position: Vector3<f64>,
        descriptor: Vec<u8>,
        reference_kf: &KeyFrame,
    ) -> Arc<MapPoint> {
        let mp = Arc::new(MapPoint::new(
            self.next_map_point_id(),
            channel,
            position,
            descriptor,
            Some(reference_kf.id),
            reference_kf.frame_id,
        ));
        self.map_points.write().insert(mp.id, Arc::clone(&mp));
        mp
    }

    /// Create a landmark from keypoint `idx` of a tracked frame.
    ///
    /// The normal points from the frame's camera centre to the landmark and
    /// the distance band is derived from the keypoint's octave. The frame's
    /// slot is not touched.
    pub fn create_map_point_from_frame(
        &self,
        frame: &Frame,
        channel: FeatureType,
        idx: usize,
        position: Vector3<f64>,
    ) -> Option<Arc<MapPoint>> {
        let features = frame.features(channel);
        if idx >= features.len() {
            return None;
        }

        let mp = MapPoint::new(
            self.next_map_point_id(),
            channel,
            position,
            features.descriptors.row(idx).to_vec(),
            None,
            frame.id,
        );

        let po = position - frame.camera_center();
        let dist = po.norm();
        let normal = if dist > 0.0 { po / dist } else { Vector3::zeros() };
        let level = features.keypoints_un[idx].octave;
        let max_distance = dist * frame.pyramid.level_scale(level);
        let min_distance = max_distance / frame.pyramid.max_level_scale();
        mp.set_normal_and_depth(normal, min_distance, max_distance);

        let mp = Arc::new(mp);
        self.map_points.write().insert(mp.id, Arc::clone(&mp));
        Some(mp)
    }

    /// Live landmark by id. Bad landmarks are never returned.
    pub fn map_point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        let mp = self.map_points.read().get(&id).cloned()?;
        if mp.is_bad() {
            None
        } else {
            Some(mp)
        }
    }

    /// All live landmarks.
    pub fn map_points(&self) -> Vec<Arc<MapPoint>> {
        self.map_points
            .read()
            .values()
            .filter(|mp| !mp.is_bad())
            .cloned()
            .collect()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.read().len()
    }

    /// The landmark that currently stands for `id`, following recent fusions.
    pub fn resolve_map_point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        if let Some(mp) = self.map_point(id) {
            return Some(mp);
        }
        let by = self.replaced.lock().get(&id)?.by;
        self.map_point(by)
    }

    pub fn num_replacement_records(&self) -> usize {
        self.replaced.lock().len()
    }

    /// Forget fusions older than the replacement horizon or whose survivor
    /// is gone.
    fn prune_replacements(&self, current: KeyFrameId) {
        let map_points = self.map_points.read();
        self.replaced.lock().retain(|_, r| {
            current.0.saturating_sub(r.at_kf) < REPLACEMENT_HISTORY_KEYFRAMES && map_points.contains_key(&r.by)
        });
    }

    /// Redirect a frame's slots that refer to fused-away landmarks and clear
    /// slots whose landmark no longer exists. Returns the number of redirects.
    pub fn refresh_frame_matches(&self, frame: &mut Frame) -> usize {
        let mut redirected = 0;
        for channel in FeatureType::ALL {
            for slot in frame.channel_mut(channel).map_points.iter_mut() {
                let Some(id) = *slot else { continue };
                match self.resolve_map_point(id) {
                    Some(mp) if mp.id != id => {
                        *slot = Some(mp.id);
                        redirected += 1;
                    }
                    Some(_) => {}
                    None => *slot = None,
                }
            }
        }
        redirected
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Associate keypoint `idx` of a keyframe channel with a landmark.
    ///
    /// Adds the observation to the landmark and fills the keyframe slot.
    /// Returns false when either entity is unknown or bad, the landmark
    /// belongs to another channel, the index is out of range, the slot is
    /// already taken, or the keyframe already observes the landmark. An
    /// occupied slot must be released with [`Map::disassociate`] or fused with
    /// [`Map::replace_map_point`] first.
    pub fn associate(&self, kf_id: KeyFrameId, channel: FeatureType, idx: usize, mp_id: MapPointId) -> bool {
        let _update = self.update.lock();
        let (Some(kf), Some(mp)) = (self.keyframe(kf_id), self.map_point(mp_id)) else {
            return false;
        };
        if mp.channel != channel || idx >= kf.num_features(channel) {
            return false;
        }
        if kf.map_point(channel, idx).is_some() {
            return false;
        }

        let stereo = kf.features(channel).is_stereo(idx);
        if !mp.add_observation(kf_id, idx, stereo) {
            return false;
        }
        kf.set_map_point(channel, idx, Some(mp_id));
        true
    }

    /// Clear keyframe slot `idx` and remove the matching observation.
    ///
    /// Returns the landmark that was in the slot.
    pub fn disassociate(&self, kf_id: KeyFrameId, channel: FeatureType, idx: usize) -> Option<MapPointId> {
        let _update = self.update.lock();
        let kf = self.keyframe(kf_id)?;
        let mp_id = kf.map_point(channel, idx)?;
        kf.erase_map_point_match(channel, idx, mp_id);
        self.erase_observation_locked(mp_id, kf_id);
        Some(mp_id)
    }

    /// Remove the observation of `mp_id` from `kf_id`, discarding the
    /// landmark when its remaining weight is too low.
    ///
    /// The keyframe slot is left as is; see [`Map::disassociate`].
    pub fn erase_observation(&self, mp_id: MapPointId, kf_id: KeyFrameId) {
        let _update = self.update.lock();
        self.erase_observation_locked(mp_id, kf_id);
    }

    fn erase_observation_locked(&self, mp_id: MapPointId, kf_id: KeyFrameId) {
        let Some(mp) = self.map_points.read().get(&mp_id).cloned() else {
            return;
        };
        if mp.erase_observation(kf_id) {
            self.set_bad_locked(mp_id);
        }
    }

    /// Discard a landmark: clear every keyframe slot referring to it and
    /// remove it from the registry.
    pub fn set_bad_map_point(&self, mp_id: MapPointId) {
        let _update = self.update.lock();
        self.set_bad_locked(mp_id);
    }

    fn set_bad_locked(&self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.read().get(&mp_id).cloned() else {
            return;
        };
        let Some(retired) = mp.retire(None) else {
            return;
        };

        for (kf_id, idx, _) in retired.observations {
            if let Some(kf) = self.keyframe(kf_id) {
                kf.erase_map_point_match(mp.channel, idx, mp_id);
            }
        }

        self.map_points.write().remove(&mp_id);
        trace!("[Map] {} set bad", mp_id);
    }

    /// Fuse landmark `old_id` into `new_id`.
    ///
    /// `old_id` becomes bad. Every keyframe that observed it now observes
    /// `new_id` at the same slot, unless it already observed `new_id`, in
    /// which case the slot is cleared. Visible/found counters are summed and
    /// the descriptor of `new_id` is recomputed.
    ///
    /// Returns false if the ids are equal, either landmark is unknown or bad,
    /// or they belong to different channels.
    pub fn replace_map_point(&self, old_id: MapPointId, new_id: MapPointId) -> bool {
        if old_id == new_id {
            return false;
        }
        let _update = self.update.lock();
        let (Some(old), Some(new)) = (self.map_point(old_id), self.map_point(new_id)) else {
            return false;
        };
        if old.channel != new.channel {
            return false;
        }
        let Some(retired) = old.retire(Some(new_id)) else {
            return false;
        };
        let channel = old.channel;

        for (kf_id, idx, stereo) in retired.observations {
            let Some(kf) = self.keyframe(kf_id) else {
                continue;
            };
            if !new.is_in_keyframe(kf_id) {
                kf.replace_map_point_match(channel, idx, old_id, new_id);
                new.add_observation(kf_id, idx, stereo);
            } else {
                kf.erase_map_point_match(channel, idx, old_id);
            }
        }

        new.increase_found(retired.found);
        new.increase_visible(retired.visible);
        self.compute_distinctive_descriptors(new_id);

        let at_kf = self.next_kf_id.load(Ordering::SeqCst);
        let mut replaced = self.replaced.lock();
        for r in replaced.values_mut() {
            if r.by == old_id {
                r.by = new_id;
            }
        }
        replaced.insert(old_id, Replacement { by: new_id, at_kf });
        drop(replaced);
        self.map_points.write().remove(&old_id);
        trace!("[Map] {} replaced by {}", old_id, new_id);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Choose the observed descriptor with the least median distance to the
    /// others as the landmark's representative. Returns false when the
    /// landmark is bad or no observing keyframe is available.
    pub fn compute_distinctive_descriptors(&self, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_point(mp_id) else {
            return false;
        };

        let descriptors: Vec<Vec<u8>> = mp
            .observations()
            .into_iter()
            .filter_map(|(kf_id, idx)| {
                let kf = self.keyframe(kf_id)?;
                if kf.is_bad() {
                    return None;
                }
                let features = kf.features(mp.channel);
                (idx < features.len()).then(|| features.descriptors.row(idx).to_vec())
            })
            .collect();

        match select_distinctive_descriptor(&descriptors) {
            Some(best) => {
                mp.set_descriptor(descriptors[best].clone());
                true
            }
            None => false,
        }
    }

    /// Recompute a landmark's mean viewing direction and distance band from
    /// its observing keyframes.
    pub fn update_normal_and_depth(&self, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_point(mp_id) else {
            return false;
        };
        let Some((reference_id, ref_idx, observers)) = mp.observation_snapshot() else {
            return false;
        };
        let Some(reference) = self.keyframe(reference_id) else {
            return false;
        };

        let centers: Vec<Vector3<f64>> = observers
            .iter()
            .filter_map(|&id| self.keyframe(id))
            .map(|kf| kf.camera_center())
            .collect();

        let features = reference.features(mp.channel);
        let Some(kp) = features.keypoints_un.get(ref_idx) else {
            return false;
        };
        let position = mp.position();

        match compute_normal_and_depth(
            &position,
            &centers,
            &reference.camera_center(),
            reference.pyramid.level_scale(kp.octave),
            reference.pyramid.max_level_scale(),
        ) {
            Some((normal, min_distance, max_distance)) => {
                mp.set_normal_and_depth(normal, min_distance, max_distance);
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The `n` keyframes sharing the most landmarks with `kf_id`, across all
    /// channels, best first. Ties are broken by keyframe id.
    pub fn best_covisible_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        let Some(kf) = self.keyframe(kf_id) else {
            return Vec::new();
        };

        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, _, mp_id) in kf.all_map_point_slots() {
            let Some(mp) = self.map_point(mp_id) else {
                continue;
            };
            for other in mp.observations().into_keys() {
                if other != kf_id {
                    *counts.entry(other).or_insert(0) += 1;
                }
            }
        }

        let mut covisibles: Vec<(KeyFrameId, usize)> = counts
            .into_iter()
            .filter(|(id, _)| self.keyframe(*id).is_some_and(|kf| !kf.is_bad()))
            .collect();
        covisibles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        covisibles.into_iter().take(n).map(|(id, _)| id).collect()
    }

    /// Median depth of the keyframe's landmarks in its camera frame.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId) -> Option<f64> {
        let kf = self.keyframe(kf_id)?;
        let pose_cw = kf.pose_cw();

        let mut depths: Vec<f64> = kf
            .all_map_point_slots()
            .into_iter()
            .filter_map(|(_, _, mp_id)| self.map_point(mp_id))
            .map(|mp| pose_cw.transform_point(&mp.position()).z)
            .collect();
        if depths.is_empty() {
            return None;
        }

        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / 2])
    }

    pub fn clear(&self) {
        let _update = self.update.lock();
        self.keyframes.write().clear();
        self.map_points.write().clear();
        self.replaced.lock().clear();
        self.next_kf_id.store(0, Ordering::SeqCst);
        self.next_mp_id.store(0, Ordering::SeqCst);
    }
}
