//! Bidirectional landmark search between two keyframes related by a
//! similarity (loop-closure verification).

use tracing::debug;

use crate::features::{descriptor_distance, FeatureType};
use crate::geometry::Sim3;
use crate::map::{KeyFrame, Map, MapPointId};

use super::Associater;

impl Associater {
    /// Match the landmarks of `kf1` and `kf2` under `s12`.
    ///
    /// `s12` maps kf2 camera coordinates into kf1 camera coordinates.
    /// Landmarks of kf1 are projected into kf2 with `s12⁻¹` and landmarks of
    /// kf2 into kf1 with `s12`; a pair is kept only when both directions pick
    /// each other. Entries already present in `matches12` (one per keypoint
    /// of kf1) are left untouched and excluded from the search.
    ///
    /// # Returns
    /// Number of new entries in `matches12`.
    pub fn search_by_sim3(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        matches12: &mut [Option<MapPointId>],
        s12: &Sim3,
        th: f64,
        channel: FeatureType,
        map: &Map,
    ) -> usize {
        let s21 = s12.inverse();

        let slots1 = kf1.map_point_matches(channel);
        let slots2 = kf2.map_point_matches(channel);

        let mut already_matched1 = vec![false; slots1.len()];
        let mut already_matched2 = vec![false; slots2.len()];
        for (i, m) in matches12.iter().enumerate().take(slots1.len()) {
            let Some(mp_id) = m else { continue };
            already_matched1[i] = true;
            if let Some(idx2) = map.map_point(*mp_id).and_then(|mp| mp.index_in_keyframe(kf2.id)) {
                if let Some(flag) = already_matched2.get_mut(idx2) {
                    *flag = true;
                }
            }
        }

        let match1 = self.project_for_sim3(kf1, &slots1, &already_matched1, kf2, &s21, th, channel, map);
        let match2 = self.project_for_sim3(kf2, &slots2, &already_matched2, kf1, s12, th, channel, map);

        let mut num_found = 0;
        for (i1, m) in match1.iter().enumerate() {
            let Some(idx2) = *m else { continue };
            if match2.get(idx2).copied().flatten() == Some(i1) && i1 < matches12.len() {
                matches12[i1] = slots2[idx2];
                num_found += 1;
            }
        }

        debug!(
            "[SearchBySim3] {} <-> {} on {}: {} matches",
            kf1.id, kf2.id, channel, num_found
        );
        num_found
    }

    /// Project the landmarks of `source` into `target`.
    ///
    /// `s_ts` maps source camera coordinates to target camera coordinates.
    /// Returns, per source keypoint, the target keypoint its landmark matched.
    #[allow(clippy::too_many_arguments)]
    fn project_for_sim3(
        &self,
        source: &KeyFrame,
        source_slots: &[Option<MapPointId>],
        skip: &[bool],
        target: &KeyFrame,
        s_ts: &Sim3,
        th: f64,
        channel: FeatureType,
        map: &Map,
    ) -> Vec<Option<usize>> {
        let high = self.thresholds(channel).high;
        let source_cw = source.pose_cw();
        let target_features = target.features(channel);

        let mut out = vec![None; source_slots.len()];
        for (i, slot) in source_slots.iter().enumerate() {
            let Some(mp_id) = *slot else { continue };
            if skip[i] {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }

            let p_target = s_ts.transform_point(&source_cw.transform_point(&mp.position()));
            if p_target.z < 0.0 {
                continue;
            }
            let uv = target.camera.project(&p_target);
            if !target.is_in_image(uv.x, uv.y) {
                continue;
            }

            let dist = p_target.norm();
            if !mp.is_in_distance_band(dist) {
                continue;
            }

            let level = mp.predict_scale(dist, &target.pyramid);
            let radius = th * target.pyramid.level_scale(level);
            let candidates = target_features.features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level));

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidates {
                let dist = descriptor_distance(&descriptor, target_features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if best_dist <= high {
                out[i] = best_idx;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{descriptor, feature, flip_bits, frame, pose_at, project};
    use nalgebra::Vector3;
    use std::sync::Arc;

    const ORB: FeatureType = FeatureType::Orb;

    /// Keyframe at `pose` observing `points` with their own landmarks.
    fn observing_keyframe(
        map: &Map,
        id: u64,
        x: f64,
        points: &[Vector3<f64>],
        flip: usize,
    ) -> Arc<KeyFrame> {
        let pose = pose_at(x, 0.0, 0.0);
        let specs: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let (u, v) = project(&pose, p);
                feature(u, v, flip_bits(&descriptor(i as u64), flip))
            })
            .collect();
        let kf = map.insert_keyframe(&frame(id, pose, ORB, &specs));
        for (i, p) in points.iter().enumerate() {
            let mp = map.create_map_point(ORB, *p, flip_bits(&descriptor(i as u64), flip), &kf);
            map.associate(kf.id, ORB, i, mp.id);
            map.update_normal_and_depth(mp.id);
        }
        kf
    }

    /// Relative similarity kf2 camera -> kf1 camera for keyframes at `x1`, `x2`.
    fn relative(x1: f64, x2: f64) -> Sim3 {
        Sim3::from_se3(&pose_at(x2 - x1, 0.0, 0.0))
    }

    #[test]
    fn test_sim3_mutual_matches() {
        let map = Map::new();
        let points = [
            Vector3::new(-0.5, 0.1, 5.0),
            Vector3::new(0.4, -0.2, 5.0),
            Vector3::new(0.9, 0.3, 6.0),
        ];
        let kf1 = observing_keyframe(&map, 0, 0.0, &points, 0);
        let kf2 = observing_keyframe(&map, 1, 0.3, &points, 6);

        let mut matches12 = vec![None; 3];
        let n = Associater::default().search_by_sim3(&kf1, &kf2, &mut matches12, &relative(0.0, 0.3), 7.5, ORB, &map);
        assert_eq!(n, 3);
        for i in 0..3 {
            assert_eq!(matches12[i], kf2.map_point(ORB, i));
        }
    }

    #[test]
    fn test_sim3_keeps_existing_entries() {
        let map = Map::new();
        let points = [Vector3::new(-0.5, 0.1, 5.0), Vector3::new(0.4, -0.2, 5.0)];
        let kf1 = observing_keyframe(&map, 0, 0.0, &points, 0);
        let kf2 = observing_keyframe(&map, 1, 0.3, &points, 6);

        let preset = kf2.map_point(ORB, 0);
        let mut matches12 = vec![preset, None];
        let n = Associater::default().search_by_sim3(&kf1, &kf2, &mut matches12, &relative(0.0, 0.3), 7.5, ORB, &map);
        assert_eq!(n, 1);
        assert_eq!(matches12, vec![preset, kf2.map_point(ORB, 1)]);
    }

    #[test]
    fn test_sim3_wrong_transform_finds_nothing() {
        let map = Map::new();
        let points = [Vector3::new(-0.5, 0.1, 5.0), Vector3::new(0.4, -0.2, 5.0)];
        let kf1 = observing_keyframe(&map, 0, 0.0, &points, 0);
        let kf2 = observing_keyframe(&map, 1, 0.3, &points, 6);

        let mut matches12 = vec![None; 2];
        let n = Associater::default().search_by_sim3(&kf1, &kf2, &mut matches12, &relative(0.0, -0.3), 7.5, ORB, &map);
        assert_eq!(n, 0);
        assert!(matches12.iter().all(Option::is_none));
    }
}
