//! Local mapping helpers.
//!
//! The pieces of the local-mapping loop that sit on top of the matcher:
//! - Triangulating new landmarks between a keyframe and its neighbours
//! - Fusing duplicate landmarks across covisible keyframes
//! - Culling freshly created landmarks that fail to be re-observed
//!
//! Scheduling (the keyframe queue, bundle adjustment, keyframe culling) is
//! left to the caller.

mod culling;
mod search_in_neighbors;
mod triangulation;

pub use culling::{cull_recent_map_points, CullingResult};
pub use search_in_neighbors::{search_in_neighbors, SearchInNeighborsResult};
pub use triangulation::{create_new_map_points, triangulate_dlt, TriangulationResult};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Local mapping tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingConfig {
    /// No stereo baseline; affects neighbour counts and culling thresholds.
    pub monocular: bool,
    /// Covisible neighbours used with stereo or RGB-D input.
    pub num_neighbors_stereo: usize,
    /// Covisible neighbours used with monocular input.
    pub num_neighbors_monocular: usize,
    /// Neighbours-of-neighbours taken per first-level neighbour when fusing.
    pub num_second_neighbors: usize,
    /// Search radius factor passed to Fuse.
    pub fuse_radius: f64,
    /// Rays whose parallax cosine is above this are not triangulated.
    pub min_parallax_cos: f64,
    /// Monocular pairs need baseline / median scene depth above this.
    pub min_baseline_depth_ratio: f64,
    /// Tolerance on the distance ratio vs. the octave ratio, in units of the
    /// pyramid scale factor.
    pub ratio_factor: f64,
    /// Recent landmarks found in fewer than this share of frames they were
    /// visible in are culled.
    pub min_found_ratio: f64,
    /// Keyframes after creation from which the observation threshold applies.
    pub cull_after_keyframes: u64,
    /// Keyframes after creation at which a landmark leaves the recent list.
    pub graduate_after_keyframes: u64,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            monocular: false,
            num_neighbors_stereo: 10,
            num_neighbors_monocular: 20,
            num_second_neighbors: 5,
            fuse_radius: 3.0,
            min_parallax_cos: 0.9998,
            min_baseline_depth_ratio: 0.01,
            ratio_factor: 1.5,
            min_found_ratio: 0.25,
            cull_after_keyframes: 2,
            graduate_after_keyframes: 3,
        }
    }
}

impl LocalMappingConfig {
    pub fn monocular() -> Self {
        Self {
            monocular: true,
            ..Self::default()
        }
    }

    /// Number of covisible neighbours searched for the current input type.
    pub fn num_neighbors(&self) -> usize {
        if self.monocular {
            self.num_neighbors_monocular
        } else {
            self.num_neighbors_stereo
        }
    }

    /// Recent landmarks with at most this many observations are culled once
    /// old enough.
    pub fn min_observations(&self) -> u32 {
        if self.monocular {
            2
        } else {
            3
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_found_ratio) {
            return Err(ConfigError::OutOfRange {
                field: "min_found_ratio",
                value: self.min_found_ratio,
            });
        }
        if !(self.min_parallax_cos > 0.0 && self.min_parallax_cos <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "min_parallax_cos",
                value: self.min_parallax_cos,
            });
        }
        if !(self.fuse_radius > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "fuse_radius",
                value: self.fuse_radius,
            });
        }
        if !(self.ratio_factor >= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "ratio_factor",
                value: self.ratio_factor,
            });
        }
        if self.min_baseline_depth_ratio < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "min_baseline_depth_ratio",
                value: self.min_baseline_depth_ratio,
            });
        }
        if self.graduate_after_keyframes < self.cull_after_keyframes {
            return Err(ConfigError::OutOfRange {
                field: "graduate_after_keyframes",
                value: self.graduate_after_keyframes as f64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LocalMappingConfig::default();
        assert_eq!(config.num_neighbors(), 10);
        assert_eq!(config.min_observations(), 3);
        assert!(config.validate().is_ok());

        let mono = LocalMappingConfig::monocular();
        assert_eq!(mono.num_neighbors(), 20);
        assert_eq!(mono.min_observations(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = LocalMappingConfig {
            min_found_ratio: 1.5,
            ..LocalMappingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "min_found_ratio",
                value: 1.5
            })
        );

        let config = LocalMappingConfig {
            graduate_after_keyframes: 1,
            ..LocalMappingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
