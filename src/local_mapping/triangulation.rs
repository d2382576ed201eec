//! Triangulation of new landmarks between a keyframe and its neighbours.
//!
//! For each covisible neighbour with enough baseline:
//! 1. Pair unmatched keypoints with SearchForTriangulation (per channel)
//! 2. Triangulate with linear DLT, or back-project a stereo depth when that
//!    offers more parallax than the two rays
//! 3. Validate depth, reprojection error in both views and scale consistency
//! 4. Create the landmark with one observation from each keyframe

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3};
use tracing::{debug, trace};

use crate::config::MatchThresholds;
use crate::features::FeatureType;
use crate::geometry::{fundamental_matrix, SE3};
use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::matching::Associater;

use super::LocalMappingConfig;

/// Result of triangulating against the neighbours of one keyframe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TriangulationResult {
    /// Neighbours with enough baseline to be searched.
    pub num_pairs_checked: usize,
    /// Keypoint pairs returned by the matcher.
    pub num_matches_found: usize,
    /// Pairs for which a 3D point was computed.
    pub num_triangulated: usize,
    /// Landmarks created, in creation order.
    pub new_points: Vec<MapPointId>,
}

/// Triangulate new landmarks between `current_kf_id` and its best covisible
/// keyframes.
///
/// The created landmarks are returned so the caller can track them for
/// [`cull_recent_map_points`](super::cull_recent_map_points).
pub fn create_new_map_points(
    map: &Map,
    associater: &Associater,
    current_kf_id: KeyFrameId,
    config: &LocalMappingConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();

    let Some(kf1) = map.keyframe(current_kf_id) else {
        return result;
    };
    let neighbor_ids = map.best_covisible_keyframes(current_kf_id, config.num_neighbors());
    if neighbor_ids.is_empty() {
        return result;
    }

    let pose1_cw = kf1.pose_cw();
    let center1 = kf1.camera_center();
    let ratio_factor = config.ratio_factor * kf1.pyramid.scale_factor();

    for neighbor_id in neighbor_ids {
        let Some(kf2) = map.keyframe(neighbor_id) else {
            continue;
        };

        let baseline = (kf2.camera_center() - center1).norm();
        if config.monocular {
            let Some(median_depth) = map.scene_median_depth(neighbor_id) else {
                continue;
            };
            if baseline / median_depth < config.min_baseline_depth_ratio {
                continue;
            }
        } else if baseline < kf1.camera.baseline {
            continue;
        }
        result.num_pairs_checked += 1;

        let f12 = fundamental_matrix(&pose1_cw, &kf1.camera.k_inverse(), &kf2.pose_cw(), &kf2.camera.k_inverse());

        for channel in FeatureType::ALL {
            if kf1.num_features(channel) == 0 || kf2.num_features(channel) == 0 {
                continue;
            }
            let thresholds = *associater.thresholds(channel);
            let pairs = associater.search_for_triangulation(&kf1, &kf2, &f12, false, channel);
            result.num_matches_found += pairs.len();

            for (idx1, idx2) in pairs {
                let Some(p_world) = triangulate_pair(&kf1, idx1, &kf2, idx2, channel, config.min_parallax_cos) else {
                    continue;
                };
                result.num_triangulated += 1;

                if !reprojects_within(&kf1, idx1, channel, &p_world, &thresholds)
                    || !reprojects_within(&kf2, idx2, channel, &p_world, &thresholds)
                {
                    trace!("[CreateNewMapPoints] reprojection rejected {}:{} <-> {}:{}", kf1.id, idx1, kf2.id, idx2);
                    continue;
                }

                if !scale_consistent(&kf1, idx1, &kf2, idx2, channel, &p_world, ratio_factor) {
                    continue;
                }

                let descriptor = kf1.features(channel).descriptors.row(idx1).to_vec();
                let mp = map.create_map_point(channel, p_world, descriptor, &kf1);
                // A slot taken since the search leaves the point without support.
                if !map.associate(kf1.id, channel, idx1, mp.id) || !map.associate(kf2.id, channel, idx2, mp.id) {
                    map.set_bad_map_point(mp.id);
                    continue;
                }
                map.compute_distinctive_descriptors(mp.id);
                map.update_normal_and_depth(mp.id);

                result.new_points.push(mp.id);
            }
        }
    }

    if !result.new_points.is_empty() {
        debug!(
            "[CreateNewMapPoints] kf={}: created {} new points (pairs={}, matches={}, triangulated={})",
            current_kf_id,
            result.new_points.len(),
            result.num_pairs_checked,
            result.num_matches_found,
            result.num_triangulated
        );
    }

    result
}

/// 3D point for a keypoint pair, or `None` when neither the rays nor the
/// stereo depths give enough parallax.
fn triangulate_pair(
    kf1: &KeyFrame,
    idx1: usize,
    kf2: &KeyFrame,
    idx2: usize,
    channel: FeatureType,
    min_parallax_cos: f64,
) -> Option<Vector3<f64>> {
    let features1 = kf1.features(channel);
    let features2 = kf2.features(channel);
    let kp1 = &features1.keypoints_un[idx1];
    let kp2 = &features2.keypoints_un[idx2];

    let xn1 = kf1.camera.k_inverse() * Vector3::new(kp1.x as f64, kp1.y as f64, 1.0);
    let xn2 = kf2.camera.k_inverse() * Vector3::new(kp2.x as f64, kp2.y as f64, 1.0);

    let pose1 = kf1.pose();
    let pose2 = kf2.pose();
    let ray1 = pose1.rotation * xn1;
    let ray2 = pose2.rotation * xn2;
    let cos_parallax_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

    let stereo1 = features1.is_stereo(idx1);
    let stereo2 = features2.is_stereo(idx2);

    // Above any cosine, so a missing stereo side never wins.
    let mut cos_parallax_stereo1 = cos_parallax_rays + 1.0;
    let mut cos_parallax_stereo2 = cos_parallax_rays + 1.0;
    if stereo1 {
        let depth = features1.depth[idx1] as f64;
        cos_parallax_stereo1 = (2.0 * (kf1.camera.baseline / 2.0).atan2(depth)).cos();
    }
    if stereo2 {
        let depth = features2.depth[idx2] as f64;
        cos_parallax_stereo2 = (2.0 * (kf2.camera.baseline / 2.0).atan2(depth)).cos();
    }
    let cos_parallax_stereo = cos_parallax_stereo1.min(cos_parallax_stereo2);

    if cos_parallax_rays < cos_parallax_stereo
        && cos_parallax_rays > 0.0
        && (stereo1 || stereo2 || cos_parallax_rays < min_parallax_cos)
    {
        triangulate_dlt(&xn1, &xn2, &pose1, &pose2)
    } else if stereo1 && cos_parallax_stereo1 < cos_parallax_stereo2 {
        kf1.unproject_stereo(channel, idx1)
    } else if stereo2 && cos_parallax_stereo2 < cos_parallax_stereo1 {
        kf2.unproject_stereo(channel, idx2)
    } else {
        None
    }
}

/// Triangulate a point from two normalized image coordinates using DLT.
///
/// `pose1` and `pose2` are camera-to-world poses.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1.inverse());
    let p2 = projection_matrix(&pose2.inverse());

    // Two equations per view: x * P[2] - P[0] and y * P[2] - P[1]
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    // Right singular vector of the smallest singular value
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let x3d_h = v_t.row(svd.singular_values.imin()).transpose();

    if x3d_h[3].abs() < 1e-10 {
        return None;
    }

    Some(Vector3::new(
        x3d_h[0] / x3d_h[3],
        x3d_h[1] / x3d_h[3],
        x3d_h[2] / x3d_h[3],
    ))
}

/// 3x4 projection matrix `[R | t]` of a world-to-camera pose.
fn projection_matrix(pose_cw: &SE3) -> SMatrix<f64, 3, 4> {
    let r: Matrix3<f64> = pose_cw.rotation_matrix();
    let t = &pose_cw.translation;

    SMatrix::<f64, 3, 4>::from_columns(&[r.column(0).into(), r.column(1).into(), r.column(2).into(), *t])
}

/// Positive depth and chi-square reprojection gate of `p_world` against
/// keypoint `idx`; stereo keypoints are also checked on the right image.
fn reprojects_within(
    kf: &KeyFrame,
    idx: usize,
    channel: FeatureType,
    p_world: &Vector3<f64>,
    thresholds: &MatchThresholds,
) -> bool {
    let p_cam = kf.pose_cw().transform_point(p_world);
    if p_cam.z <= 0.0 {
        return false;
    }

    let features = kf.features(channel);
    let kp = &features.keypoints_un[idx];
    let sigma2 = kf.pyramid.level_sigma2(kp.octave);
    let uv = kf.camera.project(&p_cam);
    let err_x = uv.x - kp.x as f64;
    let err_y = uv.y - kp.y as f64;

    if features.is_stereo(idx) {
        let u_right = kf.camera.project_right(uv.x, 1.0 / p_cam.z);
        let err_r = u_right - features.u_right[idx] as f64;
        err_x * err_x + err_y * err_y + err_r * err_r <= thresholds.chi2_stereo * sigma2
    } else {
        err_x * err_x + err_y * err_y <= thresholds.chi2_mono * sigma2
    }
}

/// The ratio of distances to both camera centres must agree with the ratio
/// of the keypoints' scales within `ratio_factor`.
fn scale_consistent(
    kf1: &KeyFrame,
    idx1: usize,
    kf2: &KeyFrame,
    idx2: usize,
    channel: FeatureType,
    p_world: &Vector3<f64>,
    ratio_factor: f64,
) -> bool {
    let dist1 = (p_world - kf1.camera_center()).norm();
    let dist2 = (p_world - kf2.camera_center()).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return false;
    }

    let octave1 = kf1.features(channel).keypoints_un[idx1].octave;
    let octave2 = kf2.features(channel).keypoints_un[idx2].octave;
    let ratio_dist = dist2 / dist1;
    let ratio_octave = kf1.pyramid.level_scale(octave1) / kf2.pyramid.level_scale(octave2);

    ratio_dist * ratio_factor >= ratio_octave && ratio_dist <= ratio_octave * ratio_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{descriptor, feature, flip_bits, frame, init_tracing, pose_at, project, FeatureSpec};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    const ORB: FeatureType = FeatureType::Orb;

    /// Keyframes at `pose1` and `pose2` observing `points`. Point 0 becomes a
    /// landmark seen by both so that they are covisible.
    fn scene(
        map: &Map,
        pose1: SE3,
        pose2: SE3,
        points: &[Vector3<f64>],
        stereo1: bool,
    ) -> (Arc<KeyFrame>, Arc<KeyFrame>) {
        let specs = |pose: &SE3, flip: usize, stereo: bool| -> Vec<FeatureSpec> {
            points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let (u, v) = project(pose, p);
                    let f = feature(u, v, flip_bits(&descriptor(i as u64), flip));
                    if stereo {
                        f.stereo(pose.inverse().transform_point(p).z as f32)
                    } else {
                        f
                    }
                })
                .collect()
        };

        let kf1 = map.insert_keyframe(&frame(0, pose1, ORB, &specs(&pose1, 0, stereo1)));
        let kf2 = map.insert_keyframe(&frame(1, pose2, ORB, &specs(&pose2, 8, false)));

        let anchor = map.create_map_point(ORB, points[0], descriptor(0), &kf1);
        map.associate(kf1.id, ORB, 0, anchor.id);
        map.associate(kf2.id, ORB, 0, anchor.id);
        (kf1, kf2)
    }

    #[test]
    fn test_triangulate_dlt_recovers_point() {
        let pose1 = pose_at(0.0, 0.0, 0.0);
        let pose2 = pose_at(0.5, 0.1, 0.0);
        let p = Vector3::new(0.3, -0.2, 4.0);

        let normalized = |pose: &SE3| {
            let pc = pose.inverse().transform_point(&p);
            Vector3::new(pc.x / pc.z, pc.y / pc.z, 1.0)
        };

        let x = triangulate_dlt(&normalized(&pose1), &normalized(&pose2), &pose1, &pose2).unwrap();
        assert_relative_eq!(x, p, epsilon = 1e-8);
    }

    #[test]
    fn test_create_new_map_points_from_parallax() {
        init_tracing();
        let map = Map::new();
        let points = [
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(-0.5, -0.3, 4.0),
            Vector3::new(0.8, 0.2, 6.0),
            Vector3::new(0.1, 0.4, 5.0),
        ];
        let (kf1, kf2) = scene(&map, pose_at(0.0, 0.0, 0.0), pose_at(0.5, 0.0, 0.0), &points, false);

        let result = create_new_map_points(&map, &Associater::default(), kf1.id, &LocalMappingConfig::default());
        assert_eq!(result.num_pairs_checked, 1);
        assert_eq!(result.new_points.len(), 3);

        for i in 1..4 {
            let mp = map.map_point(kf1.map_point(ORB, i).unwrap()).unwrap();
            assert_eq!(kf2.map_point(ORB, i), Some(mp.id));
            assert_eq!(mp.num_observations(), 2);
            assert_relative_eq!(mp.position(), points[i], epsilon = 1e-3);
        }
    }

    #[test]
    fn test_stereo_depth_used_without_ray_parallax() {
        let map = Map::new();
        // Forward motion: the rays to a distant point are nearly parallel.
        let points = [Vector3::new(0.0, 0.0, 5.0), Vector3::new(0.05, 0.0, 20.0)];
        let (kf1, _kf2) = scene(&map, pose_at(0.0, 0.0, 0.0), pose_at(0.0, 0.0, 0.3), &points, true);

        let result = create_new_map_points(&map, &Associater::default(), kf1.id, &LocalMappingConfig::default());
        assert_eq!(result.new_points.len(), 1);

        let mp = map.map_point(result.new_points[0]).unwrap();
        assert_relative_eq!(mp.position(), kf1.unproject_stereo(ORB, 1).unwrap(), epsilon = 1e-9);
        // Stereo observation from kf1 plus a monocular one from kf2.
        assert_eq!(mp.num_observations(), 3);
    }

    #[test]
    fn test_short_baseline_is_skipped() {
        let map = Map::new();
        let points = [Vector3::new(0.0, 0.0, 5.0), Vector3::new(-0.5, -0.3, 4.0)];
        let (kf1, _) = scene(&map, pose_at(0.0, 0.0, 0.0), pose_at(0.02, 0.0, 0.0), &points, false);

        // Below the stereo baseline.
        let result = create_new_map_points(&map, &Associater::default(), kf1.id, &LocalMappingConfig::default());
        assert_eq!(result.num_pairs_checked, 0);

        // 0.02 / 5 is below the monocular baseline-to-depth ratio.
        let config = LocalMappingConfig {
            min_baseline_depth_ratio: 0.01,
            ..LocalMappingConfig::monocular()
        };
        let result = create_new_map_points(&map, &Associater::default(), kf1.id, &config);
        assert_eq!(result.num_pairs_checked, 0);
        assert!(result.new_points.is_empty());
    }
}
