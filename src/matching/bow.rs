//! Search by Bag-of-Words: only keypoints assigned to the same vocabulary
//! node are compared.

use tracing::debug;

use crate::features::{descriptor_distance, shared_nodes, FeatureType};
use crate::frame::Frame;
use crate::map::{KeyFrame, Map, MapPointId};

use super::Associater;

impl Associater {
    /// Match the landmarks of a keyframe to the keypoints of a frame.
    ///
    /// # Returns
    /// The match count and a table with one entry per frame keypoint of
    /// `channel`, holding the keyframe landmark it was matched to.
    pub fn search_by_bow_frame(
        &self,
        kf: &KeyFrame,
        frame: &Frame,
        channel: FeatureType,
        map: &Map,
    ) -> (usize, Vec<Option<MapPointId>>) {
        let thresholds = *self.thresholds(channel);
        let mut rot_hist = self.rotation_histogram(channel);

        let kf_slots = kf.map_point_matches(channel);
        let kf_features = kf.features(channel);
        let features = frame.features(channel);

        let mut matches: Vec<Option<MapPointId>> = vec![None; features.len()];
        let mut num_matches = 0;

        for (_, kf_indices, frame_indices) in shared_nodes(&kf_features.feature_vector, &features.feature_vector) {
            for &kf_idx in kf_indices {
                let Some(mp_id) = kf_slots.get(kf_idx).copied().flatten() else {
                    continue;
                };
                if !map.map_point(mp_id).is_some_and(|mp| mp.channel == channel) {
                    continue;
                }

                let kf_desc = kf_features.descriptors.row(kf_idx);
                let mut best_dist1 = u32::MAX;
                let mut best_dist2 = u32::MAX;
                let mut best_idx = None;

                for &f_idx in frame_indices {
                    if matches[f_idx].is_some() {
                        continue;
                    }
                    let dist = descriptor_distance(kf_desc, features.descriptors.row(f_idx));
                    if dist < best_dist1 {
                        best_dist2 = best_dist1;
                        best_dist1 = dist;
                        best_idx = Some(f_idx);
                    } else if dist < best_dist2 {
                        best_dist2 = dist;
                    }
                }

                let Some(best_idx) = best_idx else { continue };
                if best_dist1 <= thresholds.low && self.passes_ratio(best_dist1, best_dist2) {
                    matches[best_idx] = Some(mp_id);
                    num_matches += 1;

                    if self.check_orientation() {
                        rot_hist.add(
                            kf_features.keypoints_un[kf_idx].angle - features.keypoints_un[best_idx].angle,
                            best_idx,
                        );
                    }
                }
            }
        }

        if self.check_orientation() {
            for idx in rot_hist.inconsistent() {
                if matches[idx].take().is_some() {
                    num_matches -= 1;
                }
            }
        }

        debug!(
            "[SearchByBoW] {} -> {} on {}: {} matches",
            kf.id, frame.id, channel, num_matches
        );
        (num_matches, matches)
    }

    /// Match the landmarks of two keyframes.
    ///
    /// Both keypoints of a pair must carry live landmarks; a keypoint of
    /// `kf2` is matched at most once.
    ///
    /// # Returns
    /// The match count and a table with one entry per keypoint of `kf1`,
    /// holding the landmark of `kf2` it was matched to.
    pub fn search_by_bow_keyframes(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        channel: FeatureType,
        map: &Map,
    ) -> (usize, Vec<Option<MapPointId>>) {
        let thresholds = *self.thresholds(channel);
        let mut rot_hist = self.rotation_histogram(channel);

        let slots1 = kf1.map_point_matches(channel);
        let slots2 = kf2.map_point_matches(channel);
        let features1 = kf1.features(channel);
        let features2 = kf2.features(channel);

        let is_live = |slot: Option<MapPointId>| {
            slot.and_then(|id| map.map_point(id))
                .is_some_and(|mp| mp.channel == channel)
        };

        let mut matches12: Vec<Option<MapPointId>> = vec![None; slots1.len()];
        let mut matched2 = vec![false; slots2.len()];
        let mut num_matches = 0;

        for (_, indices1, indices2) in shared_nodes(&features1.feature_vector, &features2.feature_vector) {
            for &idx1 in indices1 {
                if !is_live(slots1[idx1]) {
                    continue;
                }

                let desc1 = features1.descriptors.row(idx1);
                let mut best_dist1 = u32::MAX;
                let mut best_dist2 = u32::MAX;
                let mut best_idx2 = None;

                for &idx2 in indices2 {
                    if matched2[idx2] || !is_live(slots2[idx2]) {
                        continue;
                    }
                    let dist = descriptor_distance(desc1, features2.descriptors.row(idx2));
                    if dist < best_dist1 {
                        best_dist2 = best_dist1;
                        best_dist1 = dist;
                        best_idx2 = Some(idx2);
                    } else if dist < best_dist2 {
                        best_dist2 = dist;
                    }
                }

                let Some(idx2) = best_idx2 else { continue };
                if best_dist1 < thresholds.low && self.passes_ratio(best_dist1, best_dist2) {
                    matches12[idx1] = slots2[idx2];
                    matched2[idx2] = true;
                    num_matches += 1;

                    if self.check_orientation() {
                        rot_hist.add(
                            features1.keypoints_un[idx1].angle - features2.keypoints_un[idx2].angle,
                            idx1,
                        );
                    }
                }
            }
        }

        if self.check_orientation() {
            for idx1 in rot_hist.inconsistent() {
                if matches12[idx1].take().is_some() {
                    num_matches -= 1;
                }
            }
        }

        debug!(
            "[SearchByBoW] {} <-> {} on {}: {} matches",
            kf1.id, kf2.id, channel, num_matches
        );
        (num_matches, matches12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{descriptor, feature, flip_bits, frame, pose_at};
    use nalgebra::Vector3;
    use std::sync::Arc;

    const ORB: FeatureType = FeatureType::Orb;

    /// Keyframe whose keypoints all carry fresh landmarks.
    fn keyframe_with_points(map: &Map, id: u64, descs: &[(Vec<u8>, u32)]) -> Arc<KeyFrame> {
        let specs: Vec<_> = descs
            .iter()
            .enumerate()
            .map(|(i, (d, node))| feature(50.0 + 30.0 * i as f32, 100.0, d.clone()).node(*node))
            .collect();
        let kf = map.insert_keyframe(&frame(id, pose_at(0.0, 0.0, 0.0), ORB, &specs));
        for (i, (d, _)) in descs.iter().enumerate() {
            let mp = map.create_map_point(ORB, Vector3::new(i as f64, 0.0, 5.0), d.clone(), &kf);
            assert!(map.associate(kf.id, ORB, i, mp.id));
        }
        kf
    }

    #[test]
    fn test_bow_frame_matches_within_shared_nodes() {
        let map = Map::new();
        let kf = keyframe_with_points(&map, 0, &[(descriptor(1), 7), (descriptor(2), 9)]);

        let f = frame(1, pose_at(0.0, 0.0, 0.0), ORB, &[
            feature(10.0, 10.0, descriptor(50)).node(7),
            feature(20.0, 10.0, flip_bits(&descriptor(1), 5)).node(7),
            // Identical descriptor but a different vocabulary node.
            feature(30.0, 10.0, descriptor(2)).node(3),
        ]);

        let (n, matches) = Associater::default().search_by_bow_frame(&kf, &f, ORB, &map);
        assert_eq!(n, 1);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[1], kf.map_point(ORB, 0));
        assert_eq!(matches[2], None);
    }

    #[test]
    fn test_bow_frame_ratio_rejects_ambiguous() {
        let map = Map::new();
        let kf = keyframe_with_points(&map, 0, &[(descriptor(1), 7)]);
        let f = frame(1, pose_at(0.0, 0.0, 0.0), ORB, &[
            feature(10.0, 10.0, flip_bits(&descriptor(1), 20)).node(7),
            feature(20.0, 10.0, flip_bits(&descriptor(1), 22)).node(7),
        ]);
        let (n, matches) = Associater::default().search_by_bow_frame(&kf, &f, ORB, &map);
        assert_eq!(n, 0);
        assert!(matches.iter().all(Option::is_none));
    }

    #[test]
    fn test_bow_keyframes_requires_live_points() {
        let map = Map::new();
        let kf1 = keyframe_with_points(&map, 0, &[(descriptor(1), 4), (descriptor(2), 4)]);
        let kf2 = keyframe_with_points(&map, 1, &[(flip_bits(&descriptor(2), 3), 4), (flip_bits(&descriptor(1), 49), 4)]);

        let associater = Associater::default();
        let (n, matches) = associater.search_by_bow_keyframes(&kf1, &kf2, ORB, &map);
        assert_eq!(n, 2);
        assert_eq!(matches[0], kf2.map_point(ORB, 1));
        assert_eq!(matches[1], kf2.map_point(ORB, 0));

        // A keyframe keypoint without a landmark is not matched.
        map.disassociate(kf2.id, ORB, 0);
        let (n, matches) = associater.search_by_bow_keyframes(&kf1, &kf2, ORB, &map);
        assert_eq!(n, 1);
        assert_eq!(matches[1], None);
    }

    #[test]
    fn test_bow_keyframes_strict_threshold() {
        let map = Map::new();
        let kf1 = keyframe_with_points(&map, 0, &[(descriptor(1), 4)]);
        let kf2 = keyframe_with_points(&map, 1, &[(flip_bits(&descriptor(1), 50), 4)]);
        let (n, _) = Associater::default().search_by_bow_keyframes(&kf1, &kf2, ORB, &map);
        assert_eq!(n, 0);
    }
}
