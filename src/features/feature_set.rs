//! Per-channel extraction output of one image.

use super::{
    DescriptorSet, FeatureError, FeatureGrid, FeatureVector, ImageBounds, KeyPoint,
};

/// Immutable features of one channel of one frame.
///
/// All per-index sequences have the same length N. A frame and every keyframe
/// promoted from it share the same `FeatureSet` through an `Arc`; only the
/// landmark slots, which live next to it, are mutable.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    /// Keypoints as detected (distorted image coordinates).
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoints. Geometry and the spatial grid use these.
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: DescriptorSet,
    /// Right-image x coordinate per keypoint, negative when not stereo.
    pub u_right: Vec<f32>,
    /// Depth per keypoint, negative when unknown.
    pub depth: Vec<f32>,
    /// Vocabulary partition of the keypoints; empty when not computed.
    pub feature_vector: FeatureVector,
    grid: FeatureGrid,
}

impl FeatureSet {
    /// Validate and index the extraction output of one channel.
    ///
    /// `u_right` and `depth` may be empty for monocular input, in which case
    /// every keypoint is treated as monocular.
    pub fn new(
        keypoints: Vec<KeyPoint>,
        keypoints_un: Vec<KeyPoint>,
        descriptors: DescriptorSet,
        u_right: Vec<f32>,
        depth: Vec<f32>,
        bounds: ImageBounds,
    ) -> Result<Self, FeatureError> {
        let n = keypoints.len();
        let u_right = if u_right.is_empty() { vec![-1.0; n] } else { u_right };
        let depth = if depth.is_empty() { vec![-1.0; n] } else { depth };

        for (name, len) in [
            ("undistorted keypoints", keypoints_un.len()),
            ("descriptors", descriptors.len()),
            ("right coordinates", u_right.len()),
            ("depths", depth.len()),
        ] {
            if len != n {
                return Err(FeatureError::LengthMismatch {
                    field: name,
                    expected: n,
                    actual: len,
                });
            }
        }

        let grid = FeatureGrid::new(&keypoints_un, bounds);
        Ok(Self {
            keypoints,
            keypoints_un,
            descriptors,
            u_right,
            depth,
            feature_vector: FeatureVector::new(),
            grid,
        })
    }

    /// Monocular features with no distortion.
    pub fn monocular(
        keypoints: Vec<KeyPoint>,
        descriptors: DescriptorSet,
        bounds: ImageBounds,
    ) -> Result<Self, FeatureError> {
        let keypoints_un = keypoints.clone();
        Self::new(keypoints, keypoints_un, descriptors, Vec::new(), Vec::new(), bounds)
    }

    /// A channel with no features, for frames where a detector is disabled.
    pub fn empty(bounds: ImageBounds) -> Self {
        Self {
            keypoints: Vec::new(),
            keypoints_un: Vec::new(),
            descriptors: DescriptorSet::default(),
            u_right: Vec::new(),
            depth: Vec::new(),
            feature_vector: FeatureVector::new(),
            grid: FeatureGrid::new(&[], bounds),
        }
    }

    /// Attach the vocabulary partition computed by the extraction stage.
    ///
    /// Indices outside `0..N` are rejected.
    pub fn with_feature_vector(mut self, feature_vector: FeatureVector) -> Result<Self, FeatureError> {
        let n = self.len();
        if let Some(&bad) = feature_vector.values().flatten().find(|&&idx| idx >= n) {
            return Err(FeatureError::IndexOutOfRange { index: bad, len: n });
        }
        self.feature_vector = feature_vector;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Whether keypoint `idx` has a stereo correspondence.
    #[inline]
    pub fn is_stereo(&self, idx: usize) -> bool {
        self.u_right[idx] >= 0.0
    }

    pub fn bounds(&self) -> &ImageBounds {
        self.grid.bounds()
    }

    /// Keypoints within a square window of half-size `r`, see
    /// [`FeatureGrid::features_in_area`].
    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints_un, x, y, r, min_level, max_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> ImageBounds {
        ImageBounds::new(640.0, 480.0)
    }

    #[test]
    fn test_monocular_defaults() {
        let kps = vec![KeyPoint::new(10.0, 10.0, 0.0, 0); 3];
        let desc = DescriptorSet::new(32, vec![0; 96]).unwrap();
        let set = FeatureSet::monocular(kps, desc, bounds()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.is_stereo(0));
        assert_eq!(set.features_in_area(10.0, 10.0, 1.0, None, None).len(), 3);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let kps = vec![KeyPoint::new(10.0, 10.0, 0.0, 0); 3];
        let desc = DescriptorSet::new(32, vec![0; 64]).unwrap();
        let err = FeatureSet::monocular(kps, desc, bounds()).unwrap_err();
        assert!(matches!(
            err,
            FeatureError::LengthMismatch { field: "descriptors", expected: 3, actual: 2 }
        ));
    }

    #[test]
    fn test_feature_vector_indices_validated() {
        let kps = vec![KeyPoint::new(10.0, 10.0, 0.0, 0); 2];
        let desc = DescriptorSet::new(32, vec![0; 64]).unwrap();
        let set = FeatureSet::monocular(kps, desc, bounds()).unwrap();

        let mut fv = FeatureVector::new();
        fv.insert(5, vec![0, 2]);
        assert!(set.clone().with_feature_vector(fv).is_err());

        let mut fv = FeatureVector::new();
        fv.insert(5, vec![0, 1]);
        assert_eq!(set.with_feature_vector(fv).unwrap().feature_vector.len(), 1);
    }

    #[test]
    fn test_empty_channel() {
        let set = FeatureSet::empty(bounds());
        assert!(set.is_empty());
        assert!(set.features_in_area(10.0, 10.0, 50.0, None, None).is_empty());
    }
}
