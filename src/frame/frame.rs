//! Tracking `Frame`: per-channel features of one image plus the temporary
//! landmark associations tracking builds up for it.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::features::{ChannelSet, FeatureSet, FeatureType, ScalePyramid};
use crate::geometry::SE3;
use crate::map::{FrameId, MapPoint, MapPointId};

use super::camera::CameraModel;

/// Minimum cosine between the viewing ray and a landmark's mean normal for
/// the landmark to count as visible (60°).
pub const DEFAULT_VIEWING_COS_LIMIT: f64 = 0.5;

/// One channel of a frame.
#[derive(Debug, Clone)]
pub struct FrameChannel {
    pub features: Arc<FeatureSet>,
    /// map_points[i] = Some(mp) if keypoint i is associated with landmark mp.
    pub map_points: Vec<Option<MapPointId>>,
    /// Set by pose optimization; outliers are skipped when this frame is
    /// used as the source of a search.
    pub outliers: Vec<bool>,
}

impl FrameChannel {
    pub fn new(features: Arc<FeatureSet>) -> Self {
        let n = features.len();
        Self {
            features,
            map_points: vec![None; n],
            outliers: vec![false; n],
        }
    }

    pub fn len(&self) -> usize {
        self.map_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_points.is_empty()
    }

    /// Number of keypoints with an associated landmark.
    pub fn num_matched(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }

    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }
}

/// Where a landmark is expected to appear in a frame.
///
/// Produced by [`Frame::project_map_point`] and consumed by the local-map
/// projection and nearest-neighbour searches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedProjection {
    pub map_point: MapPointId,
    pub channel: FeatureType,
    pub u: f64,
    pub v: f64,
    /// Predicted right-image x coordinate (meaningless for monocular setups).
    pub u_right: f64,
    pub scale_level: i32,
    /// Cosine between the viewing ray and the landmark's mean normal.
    pub view_cos: f64,
}

/// A tracked frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp_ns: u64,
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
    /// Camera-to-world pose (T_wc).
    pose: SE3,
    /// Cached world-to-camera pose.
    pose_cw: SE3,
    channels: ChannelSet<FrameChannel>,
}

impl Frame {
    /// # Arguments
    /// * `features` - Extraction output per channel; disabled channels are
    ///   represented by an empty [`FeatureSet`]
    pub fn new(
        id: FrameId,
        timestamp_ns: u64,
        camera: CameraModel,
        pyramid: Arc<ScalePyramid>,
        features: ChannelSet<Arc<FeatureSet>>,
    ) -> Self {
        Self {
            id,
            timestamp_ns,
            camera,
            pyramid,
            pose: SE3::identity(),
            pose_cw: SE3::identity(),
            channels: features.map(|_, f| FrameChannel::new(f)),
        }
    }

    pub fn pose(&self) -> SE3 {
        self.pose
    }

    pub fn pose_cw(&self) -> SE3 {
        self.pose_cw
    }

    /// Set the camera-to-world pose.
    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
        self.pose_cw = pose.inverse();
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn channel(&self, channel: FeatureType) -> &FrameChannel {
        &self.channels[channel]
    }

    pub fn channel_mut(&mut self, channel: FeatureType) -> &mut FrameChannel {
        &mut self.channels[channel]
    }

    pub fn channels(&self) -> impl Iterator<Item = (FeatureType, &FrameChannel)> {
        self.channels.iter()
    }

    pub fn features(&self, channel: FeatureType) -> &Arc<FeatureSet> {
        &self.channels[channel].features
    }

    pub fn num_features(&self, channel: FeatureType) -> usize {
        self.channels[channel].len()
    }

    /// Total number of associated keypoints across channels.
    pub fn num_matched(&self) -> usize {
        self.channels.iter().map(|(_, c)| c.num_matched()).sum()
    }

    /// Candidate keypoints of `channel` within a square window around `(u, v)`.
    pub fn features_in_area(
        &self,
        channel: FeatureType,
        u: f64,
        v: f64,
        r: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        self.channels[channel]
            .features
            .features_in_area(u, v, r, min_level, max_level)
    }

    /// Frustum test: predict where `mp` appears in this frame.
    ///
    /// Rejects bad landmarks, points behind the camera or outside the image,
    /// points outside the landmark's distance band, and points whose viewing
    /// ray deviates from the mean normal by more than `acos(view_cos_limit)`.
    pub fn project_map_point(&self, mp: &MapPoint, view_cos_limit: f64) -> Option<TrackedProjection> {
        if mp.is_bad() {
            return None;
        }

        let p_world = mp.position();
        let p_cam = self.pose_cw.transform_point(&p_world);
        if p_cam.z < 0.0 {
            return None;
        }

        let inv_z = 1.0 / p_cam.z;
        let uv = self.camera.project(&p_cam);
        if !self.camera.is_in_image(uv.x, uv.y) {
            return None;
        }

        let po = p_world - self.camera_center();
        let dist = po.norm();
        if !mp.is_in_distance_band(dist) {
            return None;
        }

        let view_cos = po.dot(&mp.normal()) / dist;
        if view_cos < view_cos_limit {
            return None;
        }

        Some(TrackedProjection {
            map_point: mp.id,
            channel: mp.channel,
            u: uv.x,
            v: uv.y,
            u_right: self.camera.project_right(uv.x, inv_z),
            scale_level: mp.predict_scale(dist, &self.pyramid),
            view_cos,
        })
    }

    /// World position of keypoint `idx` from its stereo/RGB-D depth.
    pub fn unproject_stereo(&self, channel: FeatureType, idx: usize) -> Option<Vector3<f64>> {
        let features = &self.channels[channel].features;
        let z = *features.depth.get(idx)? as f64;
        if z <= 0.0 {
            return None;
        }
        let kp = &features.keypoints_un[idx];
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.pose.transform_point(&p_cam))
    }
}
