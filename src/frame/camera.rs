//! Pinhole camera model of the rectified (left) image.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::features::ImageBounds;

/// Pinhole intrinsics plus stereo baseline.
///
/// Monocular setups use `baseline = 0`, in which case `bf()` is zero and no
/// right-image projection is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters.
    #[serde(default)]
    pub baseline: f64,
    pub width: f64,
    pub height: f64,
}

impl CameraModel {
    /// Build from a 3x3 intrinsic matrix.
    pub fn from_k_and_baseline(k: Matrix3<f64>, baseline: f64, width: f64, height: f64) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            baseline,
            width,
            height,
        }
    }

    /// Baseline times focal length, the stereo disparity scale.
    #[inline]
    pub fn bf(&self) -> f64 {
        self.baseline * self.fx
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn k_inverse(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Project a camera-frame point. The caller checks the depth sign.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p_cam.z;
        Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        )
    }

    /// Right-image x coordinate of a point projected at `u` with inverse depth `inv_z`.
    #[inline]
    pub fn project_right(&self, u: f64, inv_z: f64) -> f64 {
        u - self.bf() * inv_z
    }

    /// Back-project pixel `(u, v)` at depth `z` into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    pub fn bounds(&self) -> ImageBounds {
        ImageBounds::new(self.width, self.height)
    }

    #[inline]
    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width && v >= 0.0 && v < self.height
    }
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            baseline: 0.110,
            width: 752.0,
            height: 480.0,
        }
    }
}
