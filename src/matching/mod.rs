//! Associater - descriptor matching between landmarks and views.
//!
//! Every search works on one feature channel at a time (the local
//! nearest-neighbour search loops over channels itself) and never matches
//! across channels.
//!
//! | Search | Source | Target | Gate |
//! |---|---|---|---|
//! | [`Associater::search_by_projection_last_frame`] | previous frame landmarks | frame slots | TH_HIGH |
//! | [`Associater::search_by_projection_local`] | frustum-tested local landmarks | frame slots | TH_HIGH + ratio |
//! | [`Associater::search_by_projection_sim3`] | loop candidates under Sim3 | match table | TH_LOW |
//! | [`Associater::search_by_projection_keyframe`] | keyframe landmarks (relocalization) | frame slots | caller |
//! | [`Associater::search_by_bow_frame`] / [`Associater::search_by_bow_keyframes`] | shared vocabulary nodes | match table | TH_LOW + ratio |
//! | `search_by_nn_*` | brute force with cross-check | frame slots / table | TH_LOW / TH_HIGH |
//! | [`Associater::search_for_triangulation`] | unmatched keypoints of two keyframes | index pairs | TH_LOW + epipolar |
//! | [`Associater::search_by_sim3`] | both keyframes under S12 / S21 | match table | TH_HIGH, mutual |
//! | [`Associater::fuse`] / [`Associater::fuse_sim3`] | landmarks into a keyframe | map | TH_LOW + chi² |
//! | [`Associater::search_for_initialization`] | two frames, octave 0 | index table | TH_LOW + ratio |
//!
//! All searches report the number of matches; zero is the only failure mode.

mod bow;
mod fuse;
mod initialization;
mod nn;
mod projection;
pub mod rotation_histogram;
mod sim3;
mod triangulation;

pub use nn::{brute_force_cross_check, DescriptorMatch};
pub use rotation_histogram::{compute_three_maxima, RotationHistogram};
pub use triangulation::check_dist_epipolar_line;

use crate::config::{AssociaterConfig, MatchThresholds};
use crate::features::FeatureType;

/// Loose descriptor-distance threshold.
pub const TH_HIGH: u32 = 100;
/// Strict descriptor-distance threshold.
pub const TH_LOW: u32 = 50;
/// Default number of rotation-histogram bins.
pub const HISTO_LENGTH: usize = 30;

/// Search radius factor for a local landmark seen at `view_cos` from its
/// mean viewing direction.
pub fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Stateless matching engine; all state lives in the frames, keyframes and
/// map passed to each search.
#[derive(Debug, Clone, Default)]
pub struct Associater {
    config: AssociaterConfig,
}

impl Associater {
    /// # Arguments
    /// * `nn_ratio` - Best/second-best ratio for searches with a ratio test
    /// * `check_orientation` - Apply the rotation-consistency filter
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            config: AssociaterConfig {
                nn_ratio,
                check_orientation,
                ..AssociaterConfig::default()
            },
        }
    }

    pub fn from_config(config: AssociaterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssociaterConfig {
        &self.config
    }

    pub fn nn_ratio(&self) -> f64 {
        self.config.nn_ratio
    }

    pub fn check_orientation(&self) -> bool {
        self.config.check_orientation
    }

    pub fn thresholds(&self, channel: FeatureType) -> &MatchThresholds {
        self.config.thresholds(channel)
    }

    fn rotation_histogram(&self, channel: FeatureType) -> RotationHistogram {
        RotationHistogram::new(self.thresholds(channel).histogram_bins)
    }

    /// `best < nn_ratio * second`.
    fn passes_ratio(&self, best: u32, second: u32) -> bool {
        (best as f64) < self.config.nn_ratio * second as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_by_viewing_cos() {
        assert_eq!(radius_by_viewing_cos(1.0), 2.5);
        assert_eq!(radius_by_viewing_cos(0.999), 2.5);
        assert_eq!(radius_by_viewing_cos(0.998), 4.0);
        assert_eq!(radius_by_viewing_cos(0.5), 4.0);
    }

    #[test]
    fn test_defaults_match_constants() {
        let associater = Associater::new(0.75, false);
        let th = associater.thresholds(FeatureType::Orb);
        assert_eq!(th.high, TH_HIGH);
        assert_eq!(th.low, TH_LOW);
        assert_eq!(th.histogram_bins, HISTO_LENGTH);
        assert!(!associater.check_orientation());
        assert!(associater.passes_ratio(70, 100));
        assert!(!associater.passes_ratio(75, 100));
        // No second candidate: any accepted best passes.
        assert!(associater.passes_ratio(100, u32::MAX));
    }
}
