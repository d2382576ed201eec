//! Brute-force nearest-neighbour search with cross-check.
//!
//! Used when no pose prior or vocabulary partition is available. A single
//! distance threshold is applied; there is no ratio test and no orientation
//! filter.

use std::sync::Arc;

use tracing::debug;

use crate::features::{descriptor_distance, FeatureType};
use crate::frame::{Frame, TrackedProjection};
use crate::map::{KeyFrame, Map, MapPoint, MapPointId};

use super::projection::holds_observed_landmark;
use super::Associater;

/// A mutual nearest-neighbour pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Pairs `(q, t)` where `t` is the nearest train descriptor of `q` and `q` is
/// the nearest query descriptor of `t`. Ties go to the lower index.
pub fn brute_force_cross_check<Q, T>(query: &[Q], train: &[T]) -> Vec<DescriptorMatch>
where
    Q: AsRef<[u8]>,
    T: AsRef<[u8]>,
{
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }

    let mut best_train = vec![(u32::MAX, 0usize); query.len()];
    let mut best_query = vec![(u32::MAX, 0usize); train.len()];

    for (q, qd) in query.iter().enumerate() {
        for (t, td) in train.iter().enumerate() {
            let dist = descriptor_distance(qd.as_ref(), td.as_ref());
            if dist < best_train[q].0 {
                best_train[q] = (dist, t);
            }
            if dist < best_query[t].0 {
                best_query[t] = (dist, q);
            }
        }
    }

    best_train
        .into_iter()
        .enumerate()
        .filter(|&(q, (_, t))| best_query[t].1 == q)
        .map(|(q, (distance, t))| DescriptorMatch {
            query_idx: q,
            train_idx: t,
            distance,
        })
        .collect()
}

impl Associater {
    /// Match the previous frame's keypoints to the current frame's and carry
    /// over their landmarks.
    ///
    /// Pairs beyond the strict threshold, previous slots without a live
    /// landmark and previous outliers are dropped.
    pub fn search_by_nn_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        channel: FeatureType,
        map: &Map,
    ) -> usize {
        let thresholds = *self.thresholds(channel);
        let last_channel = last.channel(channel);
        let query: Vec<&[u8]> = last_channel.features.descriptors.rows().collect();
        let features = Arc::clone(current.features(channel));
        let train: Vec<&[u8]> = features.descriptors.rows().collect();

        let mut num_matches = 0;
        for m in brute_force_cross_check(&query, &train) {
            if m.distance > thresholds.low {
                continue;
            }
            let Some(mp_id) = last_channel.map_points[m.query_idx] else {
                continue;
            };
            if !map.map_point(mp_id).is_some_and(|mp| mp.channel == channel) {
                continue;
            }
            if last_channel.outliers[m.query_idx] {
                continue;
            }
            current.channel_mut(channel).map_points[m.train_idx] = Some(mp_id);
            num_matches += 1;
        }

        debug!(
            "[SearchByNN] last frame {} -> {} on {}: {} matches",
            last.id, current.id, channel, num_matches
        );
        num_matches
    }

    /// Match a keyframe's keypoints to a frame's and report the keyframe
    /// landmarks per frame keypoint.
    pub fn search_by_nn_keyframe(
        &self,
        kf: &KeyFrame,
        frame: &Frame,
        channel: FeatureType,
        map: &Map,
    ) -> (usize, Vec<Option<MapPointId>>) {
        let thresholds = *self.thresholds(channel);
        let kf_slots = kf.map_point_matches(channel);
        let query: Vec<&[u8]> = kf.features(channel).descriptors.rows().collect();
        let train: Vec<&[u8]> = frame.features(channel).descriptors.rows().collect();

        let mut matches: Vec<Option<MapPointId>> = vec![None; frame.num_features(channel)];
        let mut num_matches = 0;
        for m in brute_force_cross_check(&query, &train) {
            if m.distance > thresholds.high {
                continue;
            }
            let Some(mp_id) = kf_slots[m.query_idx] else {
                continue;
            };
            if !map.map_point(mp_id).is_some_and(|mp| mp.channel == channel) {
                continue;
            }
            matches[m.train_idx] = Some(mp_id);
            num_matches += 1;
        }

        debug!(
            "[SearchByNN] {} -> {} on {}: {} matches",
            kf.id, frame.id, channel, num_matches
        );
        (num_matches, matches)
    }

    /// Match frustum-tested local landmarks to a frame, channel by channel,
    /// using their representative descriptors.
    ///
    /// Frame slots already holding an observed landmark are left alone.
    pub fn search_by_nn_local(&self, frame: &mut Frame, projections: &[TrackedProjection], map: &Map) -> usize {
        let mut num_matches = 0;

        for channel in FeatureType::ALL {
            let points: Vec<Arc<MapPoint>> = projections
                .iter()
                .filter(|p| p.channel == channel)
                .filter_map(|p| map.map_point(p.map_point))
                .filter(|mp| mp.channel == channel)
                .collect();
            if points.is_empty() {
                continue;
            }

            let thresholds = *self.thresholds(channel);
            let query: Vec<Vec<u8>> = points.iter().map(|mp| mp.descriptor()).collect();
            let features = Arc::clone(frame.features(channel));
            let train: Vec<&[u8]> = features.descriptors.rows().collect();

            for m in brute_force_cross_check(&query, &train) {
                if m.distance > thresholds.high {
                    continue;
                }
                if holds_observed_landmark(map, frame.channel(channel).map_points[m.train_idx]) {
                    continue;
                }
                frame.channel_mut(channel).map_points[m.train_idx] = Some(points[m.query_idx].id);
                num_matches += 1;
            }
        }

        debug!(
            "[SearchByNN] local map -> {}: {} matches",
            frame.id, num_matches
        );
        num_matches
    }
}
