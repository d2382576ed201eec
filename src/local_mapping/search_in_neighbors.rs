//! SearchInNeighbors - Landmark fusion between covisible keyframes.
//!
//! Duplicates appear when tracking and triangulation create a landmark for a
//! point the map already holds. After a keyframe is processed:
//! 1. Collect its covisible neighbours and their best neighbours
//! 2. Fuse the keyframe's landmarks into every neighbour
//! 3. Fuse the neighbours' landmarks into the keyframe
//! 4. Refresh descriptors and normals of the keyframe's landmarks
//!
//! Every step runs per channel; landmarks never cross channels.

use std::collections::HashSet;

use tracing::debug;

use crate::features::FeatureType;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matching::Associater;

use super::LocalMappingConfig;

/// Result of a SearchInNeighbors pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchInNeighborsResult {
    /// Keyframes fused with the current one.
    pub num_targets: usize,
    /// Current landmarks fused into or associated with neighbours.
    pub num_fused_into_neighbors: usize,
    /// Neighbour landmarks fused into or associated with the current keyframe.
    pub num_fused_into_current: usize,
    /// Landmarks whose representative descriptor changed.
    pub num_descriptors_updated: usize,
}

/// Fuse duplicate landmarks between `current_kf_id` and its neighbourhood.
pub fn search_in_neighbors(
    map: &Map,
    associater: &Associater,
    current_kf_id: KeyFrameId,
    config: &LocalMappingConfig,
) -> SearchInNeighborsResult {
    let mut result = SearchInNeighborsResult::default();

    let Some(current_kf) = map.keyframe(current_kf_id) else {
        return result;
    };
    let targets: Vec<_> = collect_neighbors(map, current_kf_id, config)
        .into_iter()
        .filter_map(|id| map.keyframe(id))
        .collect();
    if targets.is_empty() {
        return result;
    }
    result.num_targets = targets.len();

    for channel in FeatureType::ALL {
        if current_kf.num_features(channel) == 0 {
            continue;
        }

        // Current landmarks into the neighbours
        let current_points: Vec<MapPointId> = current_kf.map_point_matches(channel).into_iter().flatten().collect();
        if !current_points.is_empty() {
            for target in &targets {
                result.num_fused_into_neighbors +=
                    associater.fuse(target, &current_points, config.fuse_radius, channel, map);
            }
        }

        // Neighbour landmarks into the current keyframe
        let mut seen: HashSet<MapPointId> = HashSet::new();
        let mut candidates: Vec<MapPointId> = Vec::new();
        for target in &targets {
            for mp_id in target.map_point_matches(channel).into_iter().flatten() {
                if !seen.insert(mp_id) {
                    continue;
                }
                let Some(mp) = map.map_point(mp_id) else {
                    continue;
                };
                if mp.is_in_keyframe(current_kf_id) {
                    continue;
                }
                candidates.push(mp_id);
            }
        }
        if !candidates.is_empty() {
            result.num_fused_into_current += associater.fuse(&current_kf, &candidates, config.fuse_radius, channel, map);
        }
    }

    for (_, _, mp_id) in current_kf.all_map_point_slots() {
        if map.compute_distinctive_descriptors(mp_id) {
            result.num_descriptors_updated += 1;
        }
        map.update_normal_and_depth(mp_id);
    }

    debug!(
        "[SearchInNeighbors] kf={}: targets={} fused_out={} fused_in={} desc_updated={}",
        current_kf_id,
        result.num_targets,
        result.num_fused_into_neighbors,
        result.num_fused_into_current,
        result.num_descriptors_updated
    );

    result
}

/// Best covisible keyframes of `current_kf_id`, followed by the best
/// covisibles of each of them. No keyframe appears twice and the current
/// keyframe is never included.
fn collect_neighbors(map: &Map, current_kf_id: KeyFrameId, config: &LocalMappingConfig) -> Vec<KeyFrameId> {
    let first_neighbors = map.best_covisible_keyframes(current_kf_id, config.num_neighbors());

    let mut seen: HashSet<KeyFrameId> = first_neighbors.iter().copied().collect();
    seen.insert(current_kf_id);

    let mut neighbors = first_neighbors.clone();
    for &neighbor_id in &first_neighbors {
        for second_id in map.best_covisible_keyframes(neighbor_id, config.num_second_neighbors) {
            if seen.insert(second_id) {
                neighbors.push(second_id);
            }
        }
    }

    neighbors
}
