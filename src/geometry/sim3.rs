//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Loop-closure association works with two flavours of similarity: a
//! world-to-camera `S_cw` (projection of landmarks into a keyframe under a
//! corrected pose) and a relative `S_12` between two keyframes' camera frames.

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// Similarity `p' = s * R * p + t`.
///
/// Stereo and RGB-D maps are metric, so their similarities have `scale == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::from_se3(&SE3::identity())
    }
}

impl Sim3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Unit-scale similarity with the same rotation and translation.
    pub fn from_se3(se3: &SE3) -> Self {
        Self::new(se3.rotation, se3.translation, 1.0)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Self::new(rotation, -(rotation * self.translation) * scale, scale)
    }

    /// `self ∘ other`: apply `other` first.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.scale * (self.rotation * other.translation) + self.translation,
            self.scale * other.scale,
        )
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Rigid part `[R | t/s]` of a world-to-camera similarity.
    ///
    /// Maps world points into the camera frame at unit scale, so projections
    /// and depths come out as they would for the uncorrected keyframe.
    pub fn unscaled_rigid(&self) -> SE3 {
        SE3::new(self.rotation, self.translation / self.scale)
    }

    /// Camera centre in world coordinates of a world-to-camera similarity.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation) / self.scale
    }
}
