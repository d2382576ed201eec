//! Two-view epipolar geometry.

use nalgebra::{Matrix3, Vector3};

use super::SE3;

/// Skew-symmetric matrix such that `skew_symmetric(v) * w == v.cross(&w)`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Fundamental matrix F12 between two views.
///
/// Satisfies `x1^T * F12 * x2 = 0` for corresponding pixels `x1` (view 1) and
/// `x2` (view 2), so `x1^T * F12` is the epipolar line of `x1` in view 2.
///
/// # Arguments
/// * `pose1_cw`, `pose2_cw` - World-to-camera poses of the two views
/// * `k1_inv`, `k2_inv` - Inverse intrinsic matrices
pub fn fundamental_matrix(
    pose1_cw: &SE3,
    k1_inv: &Matrix3<f64>,
    pose2_cw: &SE3,
    k2_inv: &Matrix3<f64>,
) -> Matrix3<f64> {
    let r1w = pose1_cw.rotation_matrix();
    let r2w = pose2_cw.rotation_matrix();

    let r12 = r1w * r2w.transpose();
    let t12 = -r12 * pose2_cw.translation + pose1_cw.translation;

    k1_inv.transpose() * skew_symmetric(&t12) * r12 * k2_inv
}

/// Squared distance from pixel `(x2, y2)` to the epipolar line of `(x1, y1)`.
///
/// Returns `None` when the line is degenerate.
pub fn epipolar_line_distance_sq(
    f12: &Matrix3<f64>,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
) -> Option<f64> {
    let a = x1 * f12[(0, 0)] + y1 * f12[(1, 0)] + f12[(2, 0)];
    let b = x1 * f12[(0, 1)] + y1 * f12[(1, 1)] + f12[(2, 1)];
    let c = x1 * f12[(0, 2)] + y1 * f12[(1, 2)] + f12[(2, 2)];

    let den = a * a + b * b;
    if den == 0.0 {
        return None;
    }

    let num = a * x2 + b * y2 + c;
    Some(num * num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn k_inv() -> Matrix3<f64> {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        k.try_inverse().unwrap()
    }

    fn project(pose_cw: &SE3, p: &Vector3<f64>) -> (f64, f64) {
        let pc = pose_cw.transform_point(p);
        (500.0 * pc.x / pc.z + 320.0, 500.0 * pc.y / pc.z + 240.0)
    }

    #[test]
    fn test_skew_symmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let s = skew_symmetric(&v);

        assert!((s * v).norm() < 1e-10);
        assert!((s + s.transpose()).norm() < 1e-10);

        let w = Vector3::new(-1.0, 0.5, 2.0);
        assert_relative_eq!(s * w, v.cross(&w), epsilon = 1e-12);
    }

    #[test]
    fn test_corresponding_points_lie_on_epipolar_line() {
        let pose1_wc = SE3::identity();
        let pose2_wc = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.5, 0.1, 0.0),
        );
        let pose1_cw = pose1_wc.inverse();
        let pose2_cw = pose2_wc.inverse();
        let f12 = fundamental_matrix(&pose1_cw, &k_inv(), &pose2_cw, &k_inv());

        for p in [
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(1.0, -0.5, 4.0),
            Vector3::new(-0.7, 0.3, 8.0),
        ] {
            let (x1, y1) = project(&pose1_cw, &p);
            let (x2, y2) = project(&pose2_cw, &p);
            let d = epipolar_line_distance_sq(&f12, x1, y1, x2, y2).unwrap();
            assert!(d < 1e-6, "distance {} too large", d);
        }

        // A point off the line is rejected by distance.
        let (x1, y1) = project(&pose1_cw, &Vector3::new(0.0, 0.0, 5.0));
        let (x2, y2) = project(&pose2_cw, &Vector3::new(0.0, 0.0, 5.0));
        let d = epipolar_line_distance_sq(&f12, x1, y1, x2, y2 + 10.0).unwrap();
        assert!(d > 1.0);
    }

    #[test]
    fn test_degenerate_line() {
        assert!(epipolar_line_distance_sq(&Matrix3::zeros(), 1.0, 2.0, 3.0, 4.0).is_none());
    }
}
