//! Synthetic scenes shared by unit tests.

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::features::{
    feature_vector_from_nodes, ChannelSet, DescriptorSet, FeatureSet, FeatureType, KeyPoint,
    ScalePyramid,
};
use crate::frame::{CameraModel, Frame};
use crate::geometry::SE3;
use crate::map::FrameId;

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn camera() -> CameraModel {
    CameraModel {
        fx: 500.0,
        fy: 500.0,
        cx: 320.0,
        cy: 240.0,
        baseline: 0.1,
        width: 640.0,
        height: 480.0,
    }
}

pub(crate) fn pyramid() -> Arc<ScalePyramid> {
    Arc::new(ScalePyramid::new(1.2, 8))
}

/// Deterministic pseudo-random 32-byte descriptor.
pub(crate) fn descriptor(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..32).map(|_| rng.gen()).collect()
}

/// Copy of `desc` with its first `n` bits flipped (distance exactly `n`).
pub(crate) fn flip_bits(desc: &[u8], n: usize) -> Vec<u8> {
    let mut out = desc.to_vec();
    for bit in 0..n {
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

pub(crate) fn pose_at(x: f64, y: f64, z: f64) -> SE3 {
    SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(x, y, z))
}

/// Pixel where world point `p` projects for a camera at `pose_wc`.
pub(crate) fn project(pose_wc: &SE3, p: &Vector3<f64>) -> (f32, f32) {
    let uv = camera().project(&pose_wc.inverse().transform_point(p));
    (uv.x as f32, uv.y as f32)
}

#[derive(Debug, Clone)]
pub(crate) struct FeatureSpec {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub octave: i32,
    pub descriptor: Vec<u8>,
    pub u_right: f32,
    pub depth: f32,
    pub node: u32,
}

pub(crate) fn feature(x: f32, y: f32, descriptor: Vec<u8>) -> FeatureSpec {
    FeatureSpec {
        x,
        y,
        angle: 0.0,
        octave: 0,
        descriptor,
        u_right: -1.0,
        depth: -1.0,
        node: 0,
    }
}

impl FeatureSpec {
    pub fn octave(mut self, octave: i32) -> Self {
        self.octave = octave;
        self
    }

    pub fn angle(mut self, angle: f32) -> Self {
        self.angle = angle;
        self
    }

    pub fn node(mut self, node: u32) -> Self {
        self.node = node;
        self
    }

    /// Stereo keypoint at `depth`, with the right coordinate consistent with
    /// the test camera.
    pub fn stereo(mut self, depth: f32) -> Self {
        self.depth = depth;
        self.u_right = self.x - (camera().bf() as f32) / depth;
        self
    }
}

pub(crate) fn feature_set(specs: &[FeatureSpec]) -> Arc<FeatureSet> {
    let keypoints: Vec<KeyPoint> = specs
        .iter()
        .map(|s| KeyPoint::new(s.x, s.y, s.angle, s.octave))
        .collect();
    let rows: Vec<Vec<u8>> = specs.iter().map(|s| s.descriptor.clone()).collect();
    let set = FeatureSet::new(
        keypoints.clone(),
        keypoints,
        DescriptorSet::from_rows(&rows).unwrap(),
        specs.iter().map(|s| s.u_right).collect(),
        specs.iter().map(|s| s.depth).collect(),
        camera().bounds(),
    )
    .unwrap()
    .with_feature_vector(feature_vector_from_nodes(specs.iter().map(|s| s.node)))
    .unwrap();
    Arc::new(set)
}

/// Frame with features on `channel` only; other channels are empty.
pub(crate) fn frame(id: u64, pose_wc: SE3, channel: FeatureType, specs: &[FeatureSpec]) -> Frame {
    let set = feature_set(specs);
    let features = ChannelSet::from_fn(|c| {
        if c == channel {
            Arc::clone(&set)
        } else {
            Arc::new(FeatureSet::empty(camera().bounds()))
        }
    });
    let mut frame = Frame::new(FrameId(id), id * 1_000_000, camera(), pyramid(), features);
    frame.set_pose(pose_wc);
    frame
}
