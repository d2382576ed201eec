//! Two-frame matching for monocular map initialization.

use nalgebra::Vector2;
use tracing::debug;

use crate::features::{descriptor_distance, FeatureType};
use crate::frame::Frame;

use super::Associater;

impl Associater {
    /// Match octave-0 keypoints of `f1` to `f2` inside a window around their
    /// previously matched positions.
    ///
    /// A target keypoint keeps only its best source: a later source with a
    /// smaller distance steals it and the earlier match is undone. On return
    /// `prev_matched[i]` holds the position of the keypoint `i` matched in
    /// `f2`; unmatched entries are left as they were.
    ///
    /// # Arguments
    /// * `prev_matched` - One position per keypoint of `f1`, searched around
    /// * `window` - Half-size of the search window in pixels
    ///
    /// # Returns
    /// The match count and, per keypoint of `f1`, the index it matched in `f2`.
    pub fn search_for_initialization(
        &self,
        channel: FeatureType,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [Vector2<f64>],
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let thresholds = *self.thresholds(channel);
        let mut rot_hist = self.rotation_histogram(channel);

        let features1 = f1.features(channel);
        let features2 = f2.features(channel);

        let mut matches12: Vec<Option<usize>> = vec![None; features1.len()];
        let mut matches21: Vec<Option<usize>> = vec![None; features2.len()];
        let mut matched_distance = vec![u32::MAX; features2.len()];
        let mut num_matches = 0;

        for (i1, kp1) in features1.keypoints_un.iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let Some(center) = prev_matched.get(i1) else {
                continue;
            };

            let candidates = features2.features_in_area(center.x, center.y, window, Some(kp1.octave), Some(kp1.octave));
            if candidates.is_empty() {
                continue;
            }

            let desc1 = features1.descriptors.row(i1);
            let mut best_dist = u32::MAX;
            let mut best_dist2 = u32::MAX;
            let mut best_idx2 = None;

            for i2 in candidates {
                let dist = descriptor_distance(desc1, features2.descriptors.row(i2));
                if matched_distance[i2] <= dist {
                    continue;
                }
                if dist < best_dist {
                    best_dist2 = best_dist;
                    best_dist = dist;
                    best_idx2 = Some(i2);
                } else if dist < best_dist2 {
                    best_dist2 = dist;
                }
            }

            let Some(i2) = best_idx2 else { continue };
            if best_dist > thresholds.low || !self.passes_ratio(best_dist, best_dist2) {
                continue;
            }

            if let Some(previous) = matches21[i2] {
                matches12[previous] = None;
                num_matches -= 1;
            }
            matches12[i1] = Some(i2);
            matches21[i2] = Some(i1);
            matched_distance[i2] = best_dist;
            num_matches += 1;

            if self.check_orientation() {
                rot_hist.add(kp1.angle - features2.keypoints_un[i2].angle, i1);
            }
        }

        if self.check_orientation() {
            for i1 in rot_hist.inconsistent() {
                if matches12[i1].take().is_some() {
                    num_matches -= 1;
                }
            }
        }

        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = *m {
                let kp2 = &features2.keypoints_un[i2];
                prev_matched[i1] = Vector2::new(kp2.x as f64, kp2.y as f64);
            }
        }

        debug!(
            "[SearchForInitialization] {} -> {} on {}: {} matches",
            f1.id, f2.id, channel, num_matches
        );
        (num_matches, matches12)
    }
}
