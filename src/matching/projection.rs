//! Search by projection: landmarks with known positions are projected into a
//! view and matched against keypoints in a window around the projection.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::features::{descriptor_distance, FeatureType};
use crate::frame::{Frame, TrackedProjection};
use crate::geometry::Sim3;
use crate::map::{KeyFrame, Map, MapPointId};

use super::{radius_by_viewing_cos, Associater};

/// Whether a frame slot holds a live landmark that keyframes already observe.
/// Such slots are never overwritten by tracking searches.
pub(super) fn holds_observed_landmark(map: &Map, slot: Option<MapPointId>) -> bool {
    slot.and_then(|id| map.map_point(id))
        .is_some_and(|mp| mp.num_observations() > 0)
}

impl Associater {
    /// Track the landmarks of the previous frame into the current frame.
    ///
    /// The current frame must carry a pose estimate. Non-outlier landmarks of
    /// `last` are projected with it; the search window is `th` times the scale
    /// of the keypoint the landmark was matched to in `last`. When the camera
    /// moved forward (backward) by more than the baseline, only coarser
    /// (finer) octaves are searched.
    ///
    /// # Arguments
    /// * `th` - Window half-size at octave 0, in pixels
    /// * `monocular` - Disables the forward/backward octave restriction
    ///
    /// A keypoint is given to at most one landmark per call.
    ///
    /// # Returns
    /// Number of current-frame slots filled.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        th: f64,
        monocular: bool,
        channel: FeatureType,
        map: &Map,
    ) -> usize {
        let thresholds = *self.thresholds(channel);
        let mut rot_hist = self.rotation_histogram(channel);

        let pose_cw = current.pose_cw();
        let camera = current.camera;
        let pyramid = Arc::clone(&current.pyramid);
        let t_lc = last.pose_cw().transform_point(&current.camera_center());
        let forward = !monocular && t_lc.z > camera.baseline;
        let backward = !monocular && -t_lc.z > camera.baseline;

        let last_channel = last.channel(channel);
        let last_features = Arc::clone(&last_channel.features);
        let features = Arc::clone(current.features(channel));

        // Keypoints taken by an earlier landmark of this search.
        let mut assigned = vec![false; features.len()];
        let mut num_matches = 0;

        for (i, slot) in last_channel.map_points.iter().enumerate() {
            let Some(mp_id) = *slot else { continue };
            if last_channel.outliers[i] {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }

            let p_cam = pose_cw.transform_point(&mp.position());
            if p_cam.z < 0.0 {
                continue;
            }
            let inv_z = 1.0 / p_cam.z;
            let uv = camera.project(&p_cam);
            if !camera.is_in_image(uv.x, uv.y) {
                continue;
            }

            let last_octave = last_features.keypoints[i].octave;
            let radius = th * pyramid.level_scale(last_octave);
            let (min_level, max_level) = if forward {
                (Some(last_octave), None)
            } else if backward {
                (Some(0), Some(last_octave))
            } else {
                (Some(last_octave - 1), Some(last_octave + 1))
            };

            let candidates = features.features_in_area(uv.x, uv.y, radius, min_level, max_level);
            if candidates.is_empty() {
                continue;
            }

            let descriptor = mp.descriptor();
            let u_right = camera.project_right(uv.x, inv_z);
            let mut best_dist = u32::MAX;
            let mut best_idx = None;

            for idx in candidates {
                if assigned[idx] || holds_observed_landmark(map, current.channel(channel).map_points[idx]) {
                    continue;
                }
                let kp_right = features.u_right[idx] as f64;
                if kp_right > 0.0 && (u_right - kp_right).abs() > radius {
                    continue;
                }

                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(best_idx) = best_idx else { continue };
            if best_dist <= thresholds.high {
                current.channel_mut(channel).map_points[best_idx] = Some(mp_id);
                assigned[best_idx] = true;
                num_matches += 1;

                if self.check_orientation() {
                    rot_hist.add(
                        last_features.keypoints_un[i].angle - features.keypoints_un[best_idx].angle,
                        best_idx,
                    );
                }
            }
        }

        if self.check_orientation() {
            let slots = &mut current.channel_mut(channel).map_points;
            for idx in rot_hist.inconsistent() {
                if slots[idx].take().is_some() {
                    num_matches -= 1;
                }
            }
        }

        debug!(
            "[SearchByProjection] last frame {} -> {} on {}: {} matches",
            last.id, current.id, channel, num_matches
        );
        num_matches
    }

    /// Match frustum-tested local landmarks into a frame.
    ///
    /// The window is `radius_by_viewing_cos(view_cos)`, times `th` when
    /// `th != 1`, times the scale of the predicted level. Candidates must lie
    /// in octaves `[level - 1, level]`. The ratio test is only applied when the
    /// two best candidates come from the same octave.
    ///
    /// # Returns
    /// Number of frame slots filled.
    pub fn search_by_projection_local(
        &self,
        frame: &mut Frame,
        projections: &[TrackedProjection],
        th: f64,
        map: &Map,
    ) -> usize {
        let pyramid = Arc::clone(&frame.pyramid);
        let mut assigned: HashSet<(FeatureType, usize)> = HashSet::new();
        let mut num_matches = 0;

        for proj in projections {
            let channel = proj.channel;
            let Some(mp) = map.map_point(proj.map_point) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }

            let level = proj.scale_level;
            let mut r = radius_by_viewing_cos(proj.view_cos);
            if th != 1.0 {
                r *= th;
            }
            let radius = r * pyramid.level_scale(level);

            let features = Arc::clone(frame.features(channel));
            let candidates = features.features_in_area(proj.u, proj.v, radius, Some(level - 1), Some(level));
            if candidates.is_empty() {
                continue;
            }

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_level = -1;
            let mut best_dist2 = u32::MAX;
            let mut best_level2 = -1;
            let mut best_idx = None;

            for idx in candidates {
                if assigned.contains(&(channel, idx))
                    || holds_observed_landmark(map, frame.channel(channel).map_points[idx])
                {
                    continue;
                }
                let kp_right = features.u_right[idx] as f64;
                if kp_right > 0.0 && (proj.u_right - kp_right).abs() > radius {
                    continue;
                }

                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                let octave = features.keypoints_un[idx].octave;
                if dist < best_dist {
                    best_dist2 = best_dist;
                    best_level2 = best_level;
                    best_dist = dist;
                    best_level = octave;
                    best_idx = Some(idx);
                } else if dist < best_dist2 {
                    best_dist2 = dist;
                    best_level2 = octave;
                }
            }

            let Some(best_idx) = best_idx else { continue };
            if best_dist > self.thresholds(channel).high {
                continue;
            }
            if best_level == best_level2 && !self.passes_ratio(best_dist, best_dist2) {
                continue;
            }

            frame.channel_mut(channel).map_points[best_idx] = Some(proj.map_point);
            assigned.insert((channel, best_idx));
            num_matches += 1;
        }

        debug!(
            "[SearchByProjection] local map -> {}: {} matches from {} projections",
            frame.id,
            num_matches,
            projections.len()
        );
        num_matches
    }

    /// Project loop candidates into a keyframe under a corrected pose.
    ///
    /// `scw` is the world-to-camera similarity of `kf`; only its rigid part is
    /// used. `matched` is the keyframe's match table (one entry per keypoint
    /// of `channel`); landmarks already in it and keypoints already matched
    /// are skipped.
    ///
    /// # Returns
    /// Number of entries added to `matched`.
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_projection_sim3(
        &self,
        kf: &KeyFrame,
        scw: &Sim3,
        points: &[MapPointId],
        matched: &mut [Option<MapPointId>],
        th: f64,
        channel: FeatureType,
        map: &Map,
    ) -> usize {
        let thresholds = *self.thresholds(channel);
        let pose_cw = scw.unscaled_rigid();
        let center = scw.camera_center();
        let features = kf.features(channel);

        let already_found: HashSet<MapPointId> = matched.iter().flatten().copied().collect();
        let mut num_matches = 0;

        for &mp_id in points {
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }

            let p_world = mp.position();
            let p_cam = pose_cw.transform_point(&p_world);
            if p_cam.z < 0.0 {
                continue;
            }
            let uv = kf.camera.project(&p_cam);
            if !kf.is_in_image(uv.x, uv.y) {
                continue;
            }

            let po = p_world - center;
            let dist = po.norm();
            if !mp.is_in_distance_band(dist) {
                continue;
            }
            if po.dot(&mp.normal()) < 0.5 * dist {
                continue;
            }

            let level = mp.predict_scale(dist, &kf.pyramid);
            let radius = th * kf.pyramid.level_scale(level);
            let candidates = features.features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level));

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidates {
                if matched.get(idx).map_or(true, Option::is_some) {
                    continue;
                }
                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if let Some(best_idx) = best_idx {
                if best_dist <= thresholds.low {
                    matched[best_idx] = Some(mp_id);
                    num_matches += 1;
                }
            }
        }

        debug!(
            "[SearchByProjection] Sim3 into {} on {}: {} matches",
            kf.id, channel, num_matches
        );
        num_matches
    }

    /// Project a keyframe's landmarks into a frame during relocalization.
    ///
    /// Landmarks in `already_found` are skipped, only empty frame slots are
    /// filled, and candidates are searched in octaves `[level - 1, level + 1]`.
    ///
    /// # Arguments
    /// * `max_distance` - Descriptor-distance acceptance threshold
    #[allow(clippy::too_many_arguments)]
    pub fn search_by_projection_keyframe(
        &self,
        current: &mut Frame,
        kf: &KeyFrame,
        already_found: &HashSet<MapPointId>,
        th: f64,
        max_distance: u32,
        channel: FeatureType,
        map: &Map,
    ) -> usize {
        let mut rot_hist = self.rotation_histogram(channel);
        let pose_cw = current.pose_cw();
        let center = current.camera_center();
        let camera = current.camera;
        let pyramid = Arc::clone(&current.pyramid);
        let features = Arc::clone(current.features(channel));
        let kf_features = kf.features(channel);

        let mut num_matches = 0;

        for (i, slot) in kf.map_point_matches(channel).into_iter().enumerate() {
            let Some(mp_id) = slot else { continue };
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }

            let p_world = mp.position();
            let p_cam = pose_cw.transform_point(&p_world);
            if p_cam.z < 0.0 {
                continue;
            }
            let uv = camera.project(&p_cam);
            if !camera.is_in_image(uv.x, uv.y) {
                continue;
            }

            let dist = (p_world - center).norm();
            if !mp.is_in_distance_band(dist) {
                continue;
            }

            let level = mp.predict_scale(dist, &pyramid);
            let radius = th * pyramid.level_scale(level);
            let candidates =
                features.features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level + 1));

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidates {
                if current.channel(channel).map_points[idx].is_some() {
                    continue;
                }
                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(best_idx) = best_idx else { continue };
            if best_dist <= max_distance {
                current.channel_mut(channel).map_points[best_idx] = Some(mp_id);
                num_matches += 1;

                if self.check_orientation() {
                    rot_hist.add(
                        kf_features.keypoints_un[i].angle - features.keypoints_un[best_idx].angle,
                        best_idx,
                    );
                }
            }
        }

        if self.check_orientation() {
            let slots = &mut current.channel_mut(channel).map_points;
            for idx in rot_hist.inconsistent() {
                if slots[idx].take().is_some() {
                    num_matches -= 1;
                }
            }
        }

        debug!(
            "[SearchByProjection] relocalization {} -> {} on {}: {} matches",
            kf.id, current.id, channel, num_matches
        );
        num_matches
    }
}
