//! Culling of recently created landmarks.
//!
//! A landmark stays on the recent list for a few keyframes after creation.
//! During that time it must be found in enough of the frames it was visible
//! in and gain observations from later keyframes, or it is set bad.

use tracing::debug;

use crate::map::{KeyFrameId, Map, MapPointId};

use super::LocalMappingConfig;

/// Outcome of one culling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CullingResult {
    /// Landmarks set bad by this pass.
    pub num_culled: usize,
    /// Landmarks old enough to leave the recent list.
    pub num_graduated: usize,
    /// Landmarks dropped from the list because they were already gone.
    pub num_already_bad: usize,
}

/// Check every landmark in `recent` against the current keyframe.
///
/// Landmarks are removed from `recent` when they are already bad, culled, or
/// graduated; the others stay for the next pass.
pub fn cull_recent_map_points(
    map: &Map,
    recent: &mut Vec<MapPointId>,
    current_kf_id: KeyFrameId,
    config: &LocalMappingConfig,
) -> CullingResult {
    let min_observations = config.min_observations();
    let mut result = CullingResult::default();

    recent.retain(|&mp_id| {
        let Some(mp) = map.map_point(mp_id) else {
            result.num_already_bad += 1;
            return false;
        };

        let age = mp
            .first_keyframe()
            .map_or(0, |first| current_kf_id.0.saturating_sub(first.0));

        if mp.found_ratio() < config.min_found_ratio {
            map.set_bad_map_point(mp_id);
            result.num_culled += 1;
            false
        } else if age >= config.cull_after_keyframes && mp.num_observations() <= min_observations {
            map.set_bad_map_point(mp_id);
            result.num_culled += 1;
            false
        } else if age >= config.graduate_after_keyframes {
            result.num_graduated += 1;
            false
        } else {
            true
        }
    });

    if result.num_culled > 0 {
        debug!(
            "[MapCulling] kf={}: culled={} graduated={} (recent remaining: {})",
            current_kf_id,
            result.num_culled,
            result.num_graduated,
            recent.len()
        );
    }
    result
}
