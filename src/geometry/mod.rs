//! Geometry utilities: rigid and similarity transforms, epipolar geometry.

pub mod epipolar;
pub mod se3;
pub mod sim3;

pub use epipolar::{epipolar_line_distance_sq, fundamental_matrix, skew_symmetric};
pub use se3::SE3;
pub use sim3::Sim3;
