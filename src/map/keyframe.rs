//! KeyFrame - A frame promoted into the map.
//!
//! A KeyFrame shares its immutable per-channel features with the frame it was
//! promoted from and owns the landmark slots for them. Slots are guarded per
//! channel and the pose by its own lock, so a tracking thread reading the
//! pose never waits on local mapping editing associations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};

use crate::features::{ChannelSet, FeatureSet, FeatureType, ScalePyramid};
use crate::frame::{CameraModel, Frame};
use crate::geometry::SE3;

use super::types::{FrameId, KeyFrameId, MapPointId};

/// One channel of a keyframe.
#[derive(Debug)]
pub struct KeyFrameChannel {
    pub features: Arc<FeatureSet>,
    map_points: Mutex<Vec<Option<MapPointId>>>,
}

/// A KeyFrame in the map.
#[derive(Debug)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    pub frame_id: FrameId,
    pub timestamp_ns: u64,
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,

    /// Camera-to-world pose (T_wc).
    pose: RwLock<SE3>,

    channels: ChannelSet<KeyFrameChannel>,

    is_bad: AtomicBool,
}

impl KeyFrame {
    /// Promote `frame` to a keyframe, copying its pose and landmark slots.
    pub(crate) fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        let channels = ChannelSet::from_fn(|channel| {
            let fc = frame.channel(channel);
            KeyFrameChannel {
                features: Arc::clone(&fc.features),
                map_points: Mutex::new(fc.map_points.clone()),
            }
        });

        Self {
            id,
            frame_id: frame.id,
            timestamp_ns: frame.timestamp_ns,
            camera: frame.camera,
            pyramid: Arc::clone(&frame.pyramid),
            pose: RwLock::new(frame.pose()),
            channels,
            is_bad: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pose(&self) -> SE3 {
        *self.pose.read()
    }

    /// World-to-camera pose.
    pub fn pose_cw(&self) -> SE3 {
        self.pose.read().inverse()
    }

    pub fn set_pose(&self, pose: SE3) {
        *self.pose.write() = pose;
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.read().translation
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        self.camera.is_in_image(u, v)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────

    pub fn features(&self, channel: FeatureType) -> &Arc<FeatureSet> {
        &self.channels[channel].features
    }

    pub fn num_features(&self, channel: FeatureType) -> usize {
        self.channels[channel].features.len()
    }

    /// Candidate keypoints within a square window around `(u, v)`.
    pub fn features_in_area(&self, channel: FeatureType, u: f64, v: f64, r: f64) -> Vec<usize> {
        self.channels[channel]
            .features
            .features_in_area(u, v, r, None, None)
    }

    /// World position of keypoint `idx` from its stereo depth.
    pub fn unproject_stereo(&self, channel: FeatureType, idx: usize) -> Option<Vector3<f64>> {
        let features = &self.channels[channel].features;
        let z = *features.depth.get(idx)? as f64;
        if z <= 0.0 {
            return None;
        }
        let kp = &features.keypoints_un[idx];
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.pose().transform_point(&p_cam))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Slots
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy of the landmark slots of a channel.
    pub fn map_point_matches(&self, channel: FeatureType) -> Vec<Option<MapPointId>> {
        self.channels[channel].map_points.lock().clone()
    }

    pub fn map_point(&self, channel: FeatureType, idx: usize) -> Option<MapPointId> {
        self.channels[channel]
            .map_points
            .lock()
            .get(idx)
            .copied()
            .flatten()
    }

    /// Set of landmarks referenced by a channel's slots.
    pub fn map_points(&self, channel: FeatureType) -> HashSet<MapPointId> {
        self.channels[channel]
            .map_points
            .lock()
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// (channel, index, landmark) for every filled slot of every channel.
    pub fn all_map_point_slots(&self) -> Vec<(FeatureType, usize, MapPointId)> {
        let mut out = Vec::new();
        for (channel, c) in self.channels.iter() {
            let slots = c.map_points.lock();
            out.extend(
                slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, mp)| mp.map(|mp| (channel, i, mp))),
            );
        }
        out
    }

    pub(crate) fn set_map_point(&self, channel: FeatureType, idx: usize, mp: Option<MapPointId>) {
        if let Some(slot) = self.channels[channel].map_points.lock().get_mut(idx) {
            *slot = mp;
        }
    }

    /// Clear slot `idx` only if it still refers to `mp`.
    pub(crate) fn erase_map_point_match(&self, channel: FeatureType, idx: usize, mp: MapPointId) {
        if let Some(slot) = self.channels[channel].map_points.lock().get_mut(idx) {
            if *slot == Some(mp) {
                *slot = None;
            }
        }
    }

    /// Point slot `idx` at `to` if it still refers to `from`.
    pub(crate) fn replace_map_point_match(
        &self,
        channel: FeatureType,
        idx: usize,
        from: MapPointId,
        to: MapPointId,
    ) {
        if let Some(slot) = self.channels[channel].map_points.lock().get_mut(idx) {
            if *slot == Some(from) {
                *slot = Some(to);
            }
        }
    }

    /// Number of filled slots across channels.
    pub fn num_tracked(&self) -> usize {
        self.channels
            .iter()
            .map(|(_, c)| c.map_points.lock().iter().filter(|m| m.is_some()).count())
            .sum()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_bad(&self) -> bool {
        self.is_bad.load(Ordering::SeqCst)
    }

    pub(crate) fn set_bad(&self) {
        self.is_bad.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Map;
    use crate::test_support::{descriptor, feature, frame, pose_at};
    use approx::assert_relative_eq;

    const ORB: FeatureType = FeatureType::Orb;

    #[test]
    fn test_unproject_stereo_uses_keyframe_pose() {
        let map = Map::new();
        let kf = map.insert_keyframe(&frame(0, pose_at(1.0, 0.0, 0.0), ORB, &[
            feature(320.0, 240.0, descriptor(1)).stereo(4.0),
            feature(100.0, 100.0, descriptor(2)),
        ]));

        assert_relative_eq!(kf.unproject_stereo(ORB, 0).unwrap(), Vector3::new(1.0, 0.0, 4.0));
        assert!(kf.unproject_stereo(ORB, 1).is_none());
        assert!(kf.unproject_stereo(ORB, 7).is_none());
    }

    #[test]
    fn test_slot_edits_are_conditional() {
        let map = Map::new();
        let kf = map.insert_keyframe(&frame(0, pose_at(0.0, 0.0, 0.0), ORB, &[
            feature(100.0, 100.0, descriptor(1)),
            feature(200.0, 100.0, descriptor(2)),
        ]));
        let a = MapPointId::new(10);
        let b = MapPointId::new(11);

        kf.set_map_point(ORB, 0, Some(a));
        kf.replace_map_point_match(ORB, 0, b, a);
        assert_eq!(kf.map_point(ORB, 0), Some(a));
        kf.erase_map_point_match(ORB, 0, b);
        assert_eq!(kf.map_point(ORB, 0), Some(a));

        kf.replace_map_point_match(ORB, 0, a, b);
        assert_eq!(kf.map_point_matches(ORB), vec![Some(b), None]);
        assert_eq!(kf.all_map_point_slots(), vec![(ORB, 0, b)]);
        assert_eq!(kf.num_tracked(), 1);

        // Out-of-range slots are ignored.
        kf.set_map_point(ORB, 5, Some(a));
        assert_eq!(kf.num_tracked(), 1);
    }
}
