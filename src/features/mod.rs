//! Feature channels and their per-frame extraction output.
//!
//! Detection and description happen outside this crate. This module holds
//! what extraction produces for each channel:
//! - [`KeyPoint`] and [`DescriptorSet`]: the raw features
//! - [`FeatureGrid`]: spatial index over undistorted keypoints
//! - [`FeatureVector`]: vocabulary-node partition used by BoW matching
//! - [`ScalePyramid`]: per-level scale and variance tables
//! - [`FeatureSet`]: all of the above for one channel of one image

pub mod channel;
pub mod descriptor;
pub mod feature_set;
pub mod feature_vector;
pub mod grid;
pub mod keypoint;
pub mod pyramid;

pub use channel::{ChannelSet, FeatureType};
pub use descriptor::{descriptor_distance, DescriptorSet, REFERENCE_DESCRIPTOR_BYTES};
pub use feature_set::FeatureSet;
pub use feature_vector::{feature_vector_from_nodes, shared_nodes, FeatureVector, SharedNodes};
pub use grid::{FeatureGrid, ImageBounds};
pub use keypoint::KeyPoint;
pub use pyramid::ScalePyramid;

/// Errors raised while assembling a channel's features.
#[derive(Debug)]
pub enum FeatureError {
    /// A per-keypoint sequence does not have one entry per keypoint.
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Malformed descriptor buffer.
    Descriptor(String),
    /// A feature-vector entry refers to a keypoint that does not exist.
    IndexOutOfRange { index: usize, len: usize },
}

impl std::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureError::LengthMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "Feature length mismatch: {} has {} entries, expected {}",
                field, actual, expected
            ),
            FeatureError::Descriptor(msg) => write!(f, "Descriptor error: {}", msg),
            FeatureError::IndexOutOfRange { index, len } => {
                write!(f, "Feature index {} out of range for {} keypoints", index, len)
            }
        }
    }
}

impl std::error::Error for FeatureError {}
