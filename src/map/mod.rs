//! Map data structures: KeyFrames, MapPoints and the Map registry.
//!
//! - [`types`]: Id newtypes used for all cross-references
//! - [`MapPoint`]: 3D landmark with observation tracking
//! - [`KeyFrame`]: promoted frame with per-channel landmark slots
//! - [`Map`]: registry owning keyframes and landmarks

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::{compute_normal_and_depth, select_distinctive_descriptor, MapPoint, MIN_OBSERVATION_WEIGHT};
pub use types::{FrameId, KeyFrameId, MapPointId};
