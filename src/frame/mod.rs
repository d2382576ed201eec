//! Camera model and tracked frames.

pub mod camera;
#[allow(clippy::module_inception)]
pub mod frame;

pub use camera::CameraModel;
pub use frame::{Frame, FrameChannel, TrackedProjection, DEFAULT_VIEWING_COS_LIMIT};
