//! Correspondence search between two keyframes for triangulating new
//! landmarks: unmatched keypoints sharing a vocabulary node, gated by the
//! epipolar constraint.

use nalgebra::Matrix3;
use tracing::debug;

use crate::features::{descriptor_distance, shared_nodes, FeatureType, KeyPoint, ScalePyramid};
use crate::geometry::epipolar_line_distance_sq;
use crate::map::KeyFrame;

use super::Associater;

/// Whether `kp2` lies close enough to the epipolar line of `kp1`.
///
/// The squared distance is compared against `chi2 * sigma²` of `kp2`'s octave.
pub fn check_dist_epipolar_line(
    kp1: &KeyPoint,
    kp2: &KeyPoint,
    f12: &Matrix3<f64>,
    pyramid: &ScalePyramid,
    chi2: f64,
) -> bool {
    match epipolar_line_distance_sq(f12, kp1.x as f64, kp1.y as f64, kp2.x as f64, kp2.y as f64) {
        Some(dsqr) => dsqr < chi2 * pyramid.level_sigma2(kp2.octave),
        None => false,
    }
}

impl Associater {
    /// Pair keypoints of `kf1` and `kf2` that have no landmark yet.
    ///
    /// Monocular pairs whose second keypoint lies near the epipole are
    /// rejected, since their depth would be ill-conditioned.
    ///
    /// # Arguments
    /// * `f12` - Fundamental matrix with `x1^T * f12 * x2 = 0`
    /// * `only_stereo` - Only consider keypoints with a right coordinate on
    ///   both sides
    ///
    /// # Returns
    /// `(idx1, idx2)` pairs ordered by `idx1`.
    pub fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        f12: &Matrix3<f64>,
        only_stereo: bool,
        channel: FeatureType,
    ) -> Vec<(usize, usize)> {
        let thresholds = *self.thresholds(channel);
        let mut rot_hist = self.rotation_histogram(channel);

        // Epipole: camera centre of kf1 seen from kf2.
        let c2 = kf2.pose_cw().transform_point(&kf1.camera_center());
        let epipole = kf2.camera.project(&c2);

        let features1 = kf1.features(channel);
        let features2 = kf2.features(channel);
        let slots1 = kf1.map_point_matches(channel);
        let slots2 = kf2.map_point_matches(channel);

        let mut matches12: Vec<Option<usize>> = vec![None; features1.len()];
        let mut matched2 = vec![false; features2.len()];

        for (_, indices1, indices2) in shared_nodes(&features1.feature_vector, &features2.feature_vector) {
            for &idx1 in indices1 {
                if slots1[idx1].is_some() {
                    continue;
                }
                let stereo1 = features1.is_stereo(idx1);
                if only_stereo && !stereo1 {
                    continue;
                }

                let kp1 = &features1.keypoints_un[idx1];
                let desc1 = features1.descriptors.row(idx1);
                let mut best_dist = thresholds.low;
                let mut best_idx2 = None;

                for &idx2 in indices2 {
                    if matched2[idx2] || slots2[idx2].is_some() {
                        continue;
                    }
                    let stereo2 = features2.is_stereo(idx2);
                    if only_stereo && !stereo2 {
                        continue;
                    }

                    let dist = descriptor_distance(desc1, features2.descriptors.row(idx2));
                    if dist > thresholds.low || dist > best_dist {
                        continue;
                    }

                    let kp2 = &features2.keypoints_un[idx2];
                    if !stereo1 && !stereo2 {
                        let dx = epipole.x - kp2.x as f64;
                        let dy = epipole.y - kp2.y as f64;
                        if dx * dx + dy * dy < 100.0 * kf2.pyramid.level_scale(kp2.octave) {
                            continue;
                        }
                    }

                    if check_dist_epipolar_line(kp1, kp2, f12, &kf2.pyramid, thresholds.chi2_epipolar) {
                        best_idx2 = Some(idx2);
                        best_dist = dist;
                    }
                }

                if let Some(idx2) = best_idx2 {
                    matches12[idx1] = Some(idx2);
                    matched2[idx2] = true;

                    if self.check_orientation() {
                        rot_hist.add(kp1.angle - features2.keypoints_un[idx2].angle, idx1);
                    }
                }
            }
        }

        if self.check_orientation() {
            for idx1 in rot_hist.inconsistent() {
                matches12[idx1] = None;
            }
        }

        let pairs: Vec<(usize, usize)> = matches12
            .into_iter()
            .enumerate()
            .filter_map(|(idx1, m)| m.map(|idx2| (idx1, idx2)))
            .collect();

        debug!(
            "[SearchForTriangulation] {} <-> {} on {}: {} pairs",
            kf1.id,
            kf2.id,
            channel,
            pairs.len()
        );
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fundamental_matrix;
    use crate::map::Map;
    use crate::test_support::{descriptor, feature, flip_bits, frame, pose_at, project};
    use nalgebra::Vector3;
    use std::sync::Arc;

    const ORB: FeatureType = FeatureType::Orb;

    fn f12(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
        fundamental_matrix(
            &kf1.pose_cw(),
            &kf1.camera.k_inverse(),
            &kf2.pose_cw(),
            &kf2.camera.k_inverse(),
        )
    }

    /// Two keyframes 0.5m apart observing `points`; kf2 also gets a decoy
    /// keypoint with the first point's descriptor far off its epipolar line.
    fn two_views(map: &Map, points: &[Vector3<f64>]) -> (Arc<KeyFrame>, Arc<KeyFrame>) {
        let pose1 = pose_at(0.0, 0.0, 0.0);
        let pose2 = pose_at(0.5, 0.0, 0.0);
        let specs1: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let (u, v) = project(&pose1, p);
                feature(u, v, descriptor(i as u64))
            })
            .collect();
        let mut specs2: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let (u, v) = project(&pose2, p);
                feature(u, v, flip_bits(&descriptor(i as u64), 8))
            })
            .collect();
        let (u, v) = project(&pose2, &points[0]);
        specs2.push(feature(u, v + 60.0, flip_bits(&descriptor(0), 2)));

        let kf1 = map.insert_keyframe(&frame(0, pose1, ORB, &specs1));
        let kf2 = map.insert_keyframe(&frame(1, pose2, ORB, &specs2));
        (kf1, kf2)
    }

    #[test]
    fn test_triangulation_pairs_follow_epipolar_geometry() {
        let map = Map::new();
        let points = [
            Vector3::new(-0.5, -0.3, 4.0),
            Vector3::new(0.8, 0.2, 6.0),
            Vector3::new(0.1, 0.4, 5.0),
        ];
        let (kf1, kf2) = two_views(&map, &points);

        let pairs = Associater::default().search_for_triangulation(&kf1, &kf2, &f12(&kf1, &kf2), false, ORB);
        assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_triangulation_skips_tracked_and_mono_in_stereo_mode() {
        let map = Map::new();
        let points = [Vector3::new(-0.5, -0.3, 4.0), Vector3::new(0.8, 0.2, 6.0)];
        let (kf1, kf2) = two_views(&map, &points);

        let mp = map.create_map_point(ORB, points[0], descriptor(0), &kf1);
        map.associate(kf1.id, ORB, 0, mp.id);

        let associater = Associater::default();
        let pairs = associater.search_for_triangulation(&kf1, &kf2, &f12(&kf1, &kf2), false, ORB);
        assert_eq!(pairs, vec![(1, 1)]);

        assert!(associater
            .search_for_triangulation(&kf1, &kf2, &f12(&kf1, &kf2), true, ORB)
            .is_empty());
    }

    #[test]
    fn test_triangulation_rejects_mono_pairs_near_epipole() {
        let map = Map::new();
        // Forward motion puts the epipole at the principal point.
        let pose1 = pose_at(0.0, 0.0, 0.0);
        let pose2 = pose_at(0.0, 0.0, 0.5);
        let points = [Vector3::new(0.01, 0.0, 5.0), Vector3::new(0.8, 0.2, 6.0)];
        let views = |stereo: bool| {
            let specs = |pose: &crate::geometry::SE3| -> Vec<_> {
                points
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let (u, v) = project(pose, p);
                        let f = feature(u, v, descriptor(i as u64));
                        if stereo {
                            f.stereo((p.z - pose.translation.z) as f32)
                        } else {
                            f
                        }
                    })
                    .collect()
            };
            let kf1 = map.insert_keyframe(&frame(0, pose1, ORB, &specs(&pose1)));
            let kf2 = map.insert_keyframe(&frame(1, pose2, ORB, &specs(&pose2)));
            (kf1, kf2)
        };
        let associater = Associater::default();

        let (kf1, kf2) = views(false);
        let epipole = kf2.camera.project(&kf2.pose_cw().transform_point(&kf1.camera_center()));
        assert!((epipole.x - 320.0).abs() < 1e-9 && (epipole.y - 240.0).abs() < 1e-9);
        let pairs = associater.search_for_triangulation(&kf1, &kf2, &f12(&kf1, &kf2), false, ORB);
        assert_eq!(pairs, vec![(1, 1)]);

        // Stereo keypoints carry their own depth, so the epipole gate is skipped.
        let (kf1, kf2) = views(true);
        let pairs = associater.search_for_triangulation(&kf1, &kf2, &f12(&kf1, &kf2), false, ORB);
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_epipolar_check_scales_with_octave() {
        let pyramid = ScalePyramid::new(1.2, 8);
        // Pure x-translation: epipolar lines are horizontal.
        let f = crate::geometry::skew_symmetric(&Vector3::new(1.0, 0.0, 0.0));
        let kp1 = KeyPoint::new(100.0, 50.0, 0.0, 0);
        let near = KeyPoint::new(300.0, 51.5, 0.0, 0);
        let near_coarse = KeyPoint::new(300.0, 51.5, 0.0, 3);
        assert!(check_dist_epipolar_line(&kp1, &near, &f, &pyramid, 3.84));
        let off = KeyPoint::new(300.0, 52.5, 0.0, 0);
        assert!(!check_dist_epipolar_line(&kp1, &off, &f, &pyramid, 3.84));
        assert!(check_dist_epipolar_line(&kp1, &near_coarse, &f, &pyramid, 3.84));
    }
}
