//! Landmark fusion: project landmarks into a keyframe and merge them with
//! the landmarks already observed there.

use std::collections::HashSet;

use nalgebra::Vector3;
use tracing::debug;

use crate::features::{descriptor_distance, FeatureType};
use crate::geometry::{Sim3, SE3};
use crate::map::{KeyFrame, Map, MapPoint, MapPointId};

use super::Associater;

/// Where a landmark lands in a keyframe.
struct FuseProjection {
    u: f64,
    v: f64,
    u_right: f64,
    level: i32,
    radius: f64,
}

/// Frustum test shared by both fusion variants: positive depth, inside the
/// image, inside the landmark's distance band and within 60° of its normal.
fn project_for_fusion(
    kf: &KeyFrame,
    pose_cw: &SE3,
    center: &Vector3<f64>,
    mp: &MapPoint,
    th: f64,
) -> Option<FuseProjection> {
    let p_world = mp.position();
    let p_cam = pose_cw.transform_point(&p_world);
    if p_cam.z < 0.0 {
        return None;
    }
    let inv_z = 1.0 / p_cam.z;
    let uv = kf.camera.project(&p_cam);
    if !kf.is_in_image(uv.x, uv.y) {
        return None;
    }

    let po = p_world - center;
    let dist = po.norm();
    if !mp.is_in_distance_band(dist) {
        return None;
    }
    if po.dot(&mp.normal()) < 0.5 * dist {
        return None;
    }

    let level = mp.predict_scale(dist, &kf.pyramid);
    Some(FuseProjection {
        u: uv.x,
        v: uv.y,
        u_right: kf.camera.project_right(uv.x, inv_z),
        level,
        radius: th * kf.pyramid.level_scale(level),
    })
}

impl Associater {
    /// Fuse `points` into `kf`.
    ///
    /// Each landmark is matched to the closest keypoint (by descriptor) whose
    /// reprojection error passes the chi-square gate. If that keypoint already
    /// carries a live landmark, the landmark with fewer observations is
    /// replaced by the other; otherwise the landmark gains the observation.
    ///
    /// # Returns
    /// Number of landmarks fused or associated.
    pub fn fuse(&self, kf: &KeyFrame, points: &[MapPointId], th: f64, channel: FeatureType, map: &Map) -> usize {
        let thresholds = *self.thresholds(channel);
        let pose_cw = kf.pose_cw();
        let center = kf.camera_center();
        let features = kf.features(channel);

        let mut num_fused = 0;

        for &mp_id in points {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel || mp.is_in_keyframe(kf.id) {
                continue;
            }
            let Some(proj) = project_for_fusion(kf, &pose_cw, &center, &mp, th) else {
                continue;
            };

            let candidates = features.features_in_area(
                proj.u,
                proj.v,
                proj.radius,
                Some(proj.level - 1),
                Some(proj.level),
            );

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidates {
                let kp = &features.keypoints_un[idx];
                let ex = proj.u - kp.x as f64;
                let ey = proj.v - kp.y as f64;
                let inv_sigma2 = kf.pyramid.inv_level_sigma2(kp.octave);

                if features.is_stereo(idx) {
                    let er = proj.u_right - features.u_right[idx] as f64;
                    let e2 = ex * ex + ey * ey + er * er;
                    if e2 * inv_sigma2 > thresholds.chi2_stereo {
                        continue;
                    }
                } else {
                    let e2 = ex * ex + ey * ey;
                    if e2 * inv_sigma2 > thresholds.chi2_mono {
                        continue;
                    }
                }

                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(best_idx) = best_idx else { continue };
            if best_dist > thresholds.low {
                continue;
            }

            match kf.map_point(channel, best_idx) {
                Some(existing_id) => {
                    if let Some(existing) = map.map_point(existing_id) {
                        if existing.num_observations() > mp.num_observations() {
                            map.replace_map_point(mp_id, existing_id);
                        } else {
                            map.replace_map_point(existing_id, mp_id);
                        }
                    }
                }
                None => {
                    map.associate(kf.id, channel, best_idx, mp_id);
                }
            }
            num_fused += 1;
        }

        debug!("[Fuse] {} on {}: {} fused", kf.id, channel, num_fused);
        num_fused
    }

    /// Fuse loop landmarks into `kf` under a corrected pose `scw`.
    ///
    /// Unlike [`Associater::fuse`] nothing is replaced: where a matched
    /// keypoint already carries a live landmark, that landmark is written to
    /// `replace[i]` (one entry per input point) for the caller to merge.
    /// Empty keypoints are associated directly.
    ///
    /// # Returns
    /// Number of landmarks associated or reported for replacement.
    #[allow(clippy::too_many_arguments)]
    pub fn fuse_sim3(
        &self,
        kf: &KeyFrame,
        scw: &Sim3,
        points: &[MapPointId],
        th: f64,
        channel: FeatureType,
        map: &Map,
        replace: &mut [Option<MapPointId>],
    ) -> usize {
        let thresholds = *self.thresholds(channel);
        let pose_cw = scw.unscaled_rigid();
        let center = scw.camera_center();
        let features = kf.features(channel);
        let already_found: HashSet<MapPointId> = kf.map_points(channel);

        let mut num_fused = 0;

        for (i, &mp_id) in points.iter().enumerate() {
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.channel != channel {
                continue;
            }
            let Some(proj) = project_for_fusion(kf, &pose_cw, &center, &mp, th) else {
                continue;
            };

            let candidates = features.features_in_area(
                proj.u,
                proj.v,
                proj.radius,
                Some(proj.level - 1),
                Some(proj.level),
            );

            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidates {
                let dist = descriptor_distance(&descriptor, features.descriptors.row(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(best_idx) = best_idx else { continue };
            if best_dist > thresholds.low {
                continue;
            }

            match kf.map_point(channel, best_idx) {
                Some(existing_id) => {
                    if map.map_point(existing_id).is_some() {
                        if let Some(entry) = replace.get_mut(i) {
                            *entry = Some(existing_id);
                        }
                    }
                }
                None => {
                    map.associate(kf.id, channel, best_idx, mp_id);
                }
            }
            num_fused += 1;
        }

        debug!("[Fuse] Sim3 into {} on {}: {} fused", kf.id, channel, num_fused);
        num_fused
    }
}
