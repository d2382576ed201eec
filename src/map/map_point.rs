//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! A MapPoint belongs to exactly one feature channel. Its state is split into
//! two lock domains so that tracking can read geometry while local mapping
//! edits observations:
//! - geometry: position, mean viewing direction, scale-invariance distances
//! - track: observations, representative descriptor, counters, bad flag
//!
//! Accessors copy values out; no reference into either lock escapes. When both
//! domains are needed, `track` is locked before `geometry`.
//!
//! Lifecycle transitions that touch keyframes (SetBadFlag, Replace) are driven
//! by the [`Map`](super::Map), which owns every entity and resolves ids.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};

use crate::features::{descriptor_distance, FeatureType, ScalePyramid};

use super::types::{FrameId, KeyFrameId, MapPointId};

/// Observations weigh more when the keypoint has a stereo correspondence.
const STEREO_OBSERVATION_WEIGHT: u32 = 2;
const MONO_OBSERVATION_WEIGHT: u32 = 1;

/// A landmark left with this weight or less after an erase is discarded.
pub const MIN_OBSERVATION_WEIGHT: u32 = 2;

#[derive(Debug, Clone)]
struct PointGeometry {
    position: Vector3<f64>,
    /// Mean viewing direction (world frame).
    normal: Vector3<f64>,
    min_distance: f64,
    max_distance: f64,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    index: usize,
    stereo: bool,
}

#[derive(Debug, Clone)]
struct PointTrack {
    observations: BTreeMap<KeyFrameId, Observation>,
    /// Weighted observation count (stereo observations count twice).
    num_obs: u32,
    reference_kf: Option<KeyFrameId>,
    /// Keyframe that created the point, or the first to observe a point
    /// created by a frame.
    first_kf: Option<KeyFrameId>,
    descriptor: Vec<u8>,
    visible: u32,
    found: u32,
    is_bad: bool,
    replaced_by: Option<MapPointId>,
}

/// Observations handed over when a MapPoint is retired.
#[derive(Debug, Clone, Default)]
pub(crate) struct RetiredObservations {
    /// (keyframe, feature index, stereo)
    pub observations: Vec<(KeyFrameId, usize, bool)>,
    pub visible: u32,
    pub found: u32,
}

/// A 3D map point (landmark).
pub struct MapPoint {
    pub id: MapPointId,
    /// Channel of the features this landmark is matched against.
    pub channel: FeatureType,
    pub first_frame_id: FrameId,
    geometry: RwLock<PointGeometry>,
    track: Mutex<PointTrack>,
}

impl MapPoint {
    /// Create a landmark with no observations.
    ///
    /// Normal and distance bounds start empty; callers fill them with
    /// [`Map::update_normal_and_depth`](super::Map::update_normal_and_depth)
    /// once observations exist, or use [`Map::create_map_point_from_frame`](super::Map::create_map_point_from_frame).
    pub(crate) fn new(
        id: MapPointId,
        channel: FeatureType,
        position: Vector3<f64>,
        descriptor: Vec<u8>,
        reference_kf: Option<KeyFrameId>,
        first_frame_id: FrameId,
    ) -> Self {
        Self {
            id,
            channel,
            first_frame_id,
            geometry: RwLock::new(PointGeometry {
                position,
                normal: Vector3::zeros(),
                min_distance: 0.0,
                max_distance: 0.0,
            }),
            track: Mutex::new(PointTrack {
                observations: BTreeMap::new(),
                num_obs: 0,
                reference_kf,
                first_kf: reference_kf,
                descriptor,
                visible: 1,
                found: 1,
                is_bad: false,
                replaced_by: None,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Geometry
    // ─────────────────────────────────────────────────────────────────────────

    pub fn position(&self) -> Vector3<f64> {
        self.geometry.read().position
    }

    pub fn set_position(&self, position: Vector3<f64>) {
        self.geometry.write().position = position;
    }

    /// Mean viewing direction. Not renormalized, so its length shrinks as
    /// observation directions spread.
    pub fn normal(&self) -> Vector3<f64> {
        self.geometry.read().normal
    }

    /// Raw (min, max) scale-invariance distances.
    pub fn distance_bounds(&self) -> (f64, f64) {
        let g = self.geometry.read();
        (g.min_distance, g.max_distance)
    }

    /// Lower edge of the distance band used for matching (0.8 × min).
    pub fn min_distance_invariance(&self) -> f64 {
        0.8 * self.geometry.read().min_distance
    }

    /// Upper edge of the distance band used for matching (1.2 × max).
    pub fn max_distance_invariance(&self) -> f64 {
        1.2 * self.geometry.read().max_distance
    }

    /// Whether `distance` lies inside the matching band.
    pub fn is_in_distance_band(&self, distance: f64) -> bool {
        let g = self.geometry.read();
        distance >= 0.8 * g.min_distance && distance <= 1.2 * g.max_distance
    }

    /// Pyramid level this landmark is expected at when seen from `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> i32 {
        let max_distance = self.geometry.read().max_distance;
        pyramid.predict_level(max_distance, distance)
    }

    pub(crate) fn set_normal_and_depth(&self, normal: Vector3<f64>, min_distance: f64, max_distance: f64) {
        let mut g = self.geometry.write();
        g.normal = normal;
        g.min_distance = min_distance;
        g.max_distance = max_distance;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that keyframe `kf_id` sees this point at feature `index`.
    ///
    /// Idempotent per keyframe: returns false and changes nothing if the
    /// keyframe already observes the point, or if the point is bad.
    pub fn add_observation(&self, kf_id: KeyFrameId, index: usize, stereo: bool) -> bool {
        let mut t = self.track.lock();
        if t.is_bad || t.observations.contains_key(&kf_id) {
            return false;
        }
        t.observations.insert(kf_id, Observation { index, stereo });
        t.num_obs += if stereo {
            STEREO_OBSERVATION_WEIGHT
        } else {
            MONO_OBSERVATION_WEIGHT
        };
        if t.reference_kf.is_none() {
            t.reference_kf = Some(kf_id);
        }
        if t.first_kf.is_none() {
            t.first_kf = Some(kf_id);
        }
        true
    }

    /// Remove the observation from `kf_id`.
    ///
    /// Hands the reference role to the first remaining observer when the
    /// reference keyframe is removed. Returns true when the remaining weight
    /// fell to [`MIN_OBSERVATION_WEIGHT`] or below and the point must be
    /// discarded by the caller.
    pub(crate) fn erase_observation(&self, kf_id: KeyFrameId) -> bool {
        let mut t = self.track.lock();
        let Some(obs) = t.observations.remove(&kf_id) else {
            return false;
        };

        let weight = if obs.stereo {
            STEREO_OBSERVATION_WEIGHT
        } else {
            MONO_OBSERVATION_WEIGHT
        };
        t.num_obs = t.num_obs.saturating_sub(weight);

        if t.reference_kf == Some(kf_id) {
            t.reference_kf = t.observations.keys().next().copied();
        }

        !t.is_bad && t.num_obs <= MIN_OBSERVATION_WEIGHT
    }

    /// Observing keyframes and the feature index in each.
    pub fn observations(&self) -> BTreeMap<KeyFrameId, usize> {
        self.track
            .lock()
            .observations
            .iter()
            .map(|(&kf, obs)| (kf, obs.index))
            .collect()
    }

    /// Weighted observation count.
    pub fn num_observations(&self) -> u32 {
        self.track.lock().num_obs
    }

    pub fn is_in_keyframe(&self, kf_id: KeyFrameId) -> bool {
        self.track.lock().observations.contains_key(&kf_id)
    }

    pub fn index_in_keyframe(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.track.lock().observations.get(&kf_id).map(|o| o.index)
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.track.lock().reference_kf
    }

    /// Keyframe the point's age is counted from. Points created by a frame get
    /// one when the first keyframe observes them.
    pub fn first_keyframe(&self) -> Option<KeyFrameId> {
        self.track.lock().first_kf
    }

    /// Reference keyframe, its observation index and a snapshot of the
    /// observer list, read atomically.
    pub(crate) fn observation_snapshot(&self) -> Option<(KeyFrameId, usize, Vec<KeyFrameId>)> {
        let t = self.track.lock();
        if t.is_bad {
            return None;
        }
        let reference = t.reference_kf?;
        let ref_index = t.observations.get(&reference)?.index;
        Some((reference, ref_index, t.observations.keys().copied().collect()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_bad(&self) -> bool {
        self.track.lock().is_bad
    }

    /// The landmark this one was fused into, if any.
    pub fn replaced_by(&self) -> Option<MapPointId> {
        self.track.lock().replaced_by
    }

    /// Mark bad and hand back every observation. Returns `None` if the point
    /// was already bad.
    pub(crate) fn retire(&self, replaced_by: Option<MapPointId>) -> Option<RetiredObservations> {
        let mut t = self.track.lock();
        if t.is_bad {
            return None;
        }
        t.is_bad = true;
        t.replaced_by = replaced_by;
        t.num_obs = 0;
        t.reference_kf = None;

        let observations = std::mem::take(&mut t.observations)
            .into_iter()
            .map(|(kf, obs)| (kf, obs.index, obs.stereo))
            .collect();

        Some(RetiredObservations {
            observations,
            visible: t.visible,
            found: t.found,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Descriptor & Tracking Statistics
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy of the representative descriptor.
    pub fn descriptor(&self) -> Vec<u8> {
        self.track.lock().descriptor.clone()
    }

    pub(crate) fn set_descriptor(&self, descriptor: Vec<u8>) {
        self.track.lock().descriptor = descriptor;
    }

    /// The point was inside the frustum of `n` frames.
    pub fn increase_visible(&self, n: u32) {
        self.track.lock().visible += n;
    }

    /// The point was matched in `n` frames.
    pub fn increase_found(&self, n: u32) {
        self.track.lock().found += n;
    }

    pub fn visible(&self) -> u32 {
        self.track.lock().visible
    }

    pub fn found(&self) -> u32 {
        self.track.lock().found
    }

    /// found / visible.
    pub fn found_ratio(&self) -> f64 {
        let t = self.track.lock();
        if t.visible == 0 {
            1.0
        } else {
            t.found as f64 / t.visible as f64
        }
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.track.lock();
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("first_kf", &t.first_kf)
            .field("observations", &t.observations.len())
            .field("num_obs", &t.num_obs)
            .field("visible", &t.visible)
            .field("found", &t.found)
            .field("is_bad", &t.is_bad)
            .finish()
    }
}

/// Pick the descriptor with the least median distance to all the others.
///
/// The median of each row of the pairwise distance table is taken at index
/// `(N - 1) / 2` of the sorted row. Ties keep the first candidate. Returns
/// `None` for an empty input.
pub fn select_distinctive_descriptor(descriptors: &[Vec<u8>]) -> Option<usize> {
    let n = descriptors.len();
    if n == 0 {
        return None;
    }

    let mut distances = vec![vec![0u32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = descriptor_distance(&descriptors[i], &descriptors[j]);
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let mut best_median = u32::MAX;
    let mut best_idx = 0;
    for (i, row) in distances.iter_mut().enumerate() {
        row.sort_unstable();
        let median = row[(n - 1) / 2];
        if median < best_median {
            best_median = median;
            best_idx = i;
        }
    }

    Some(best_idx)
}

/// Mean viewing direction and scale-invariance distances of a landmark.
///
/// # Arguments
/// * `position` - Landmark position
/// * `observer_centers` - Camera centres of all observing keyframes
/// * `reference_center` - Camera centre of the reference keyframe
/// * `reference_level_scale` - Scale factor of the reference observation's octave
/// * `max_level_scale` - Scale factor of the coarsest pyramid level
///
/// Returns `(normal, min_distance, max_distance)`, or `None` without observers.
pub fn compute_normal_and_depth(
    position: &Vector3<f64>,
    observer_centers: &[Vector3<f64>],
    reference_center: &Vector3<f64>,
    reference_level_scale: f64,
    max_level_scale: f64,
) -> Option<(Vector3<f64>, f64, f64)> {
    if observer_centers.is_empty() {
        return None;
    }

    let mut normal = Vector3::zeros();
    for center in observer_centers {
        let dir = position - center;
        let norm = dir.norm();
        if norm > 0.0 {
            normal += dir / norm;
        }
    }
    normal /= observer_centers.len() as f64;

    let dist = (position - reference_center).norm();
    let max_distance = dist * reference_level_scale;
    let min_distance = max_distance / max_level_scale;

    Some((normal, min_distance, max_distance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            FeatureType::Orb,
            Vector3::new(1.0, 2.0, 3.0),
            vec![0u8; 32],
            None,
            FrameId(0),
        )
    }

    #[test]
    fn test_observation_weights() {
        let mp = create_test_mappoint();

        assert!(mp.add_observation(KeyFrameId::new(1), 5, false));
        assert!(mp.add_observation(KeyFrameId::new(2), 10, true));
        assert_eq!(mp.num_observations(), 3);
        assert_eq!(mp.observations().len(), 2);
        assert_eq!(mp.index_in_keyframe(KeyFrameId::new(2)), Some(10));

        // Idempotent per keyframe.
        assert!(!mp.add_observation(KeyFrameId::new(1), 7, true));
        assert_eq!(mp.num_observations(), 3);
        assert_eq!(mp.index_in_keyframe(KeyFrameId::new(1)), Some(5));
    }

    #[test]
    fn test_erase_reports_discard_threshold() {
        let mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 0, false);
        mp.add_observation(KeyFrameId::new(2), 0, false);
        mp.add_observation(KeyFrameId::new(3), 0, false);
        mp.add_observation(KeyFrameId::new(4), 0, false);

        assert!(!mp.erase_observation(KeyFrameId::new(4)));
        assert_eq!(mp.num_observations(), 3);
        assert!(mp.erase_observation(KeyFrameId::new(3)));
        assert_eq!(mp.num_observations(), 2);

        // Unknown keyframe: nothing to do.
        assert!(!mp.erase_observation(KeyFrameId::new(99)));
    }

    #[test]
    fn test_reference_handover() {
        let mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(5), 0, true);
        mp.add_observation(KeyFrameId::new(3), 1, true);
        mp.add_observation(KeyFrameId::new(8), 2, true);
        assert_eq!(mp.reference_keyframe(), Some(KeyFrameId::new(5)));

        mp.erase_observation(KeyFrameId::new(5));
        assert_eq!(mp.reference_keyframe(), Some(KeyFrameId::new(3)));
        // The first observer keeps dating the point after it leaves.
        assert_eq!(mp.first_keyframe(), Some(KeyFrameId::new(5)));
    }

    #[test]
    fn test_retire_clears_observations() {
        let mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 4, true);
        mp.increase_visible(3);
        mp.increase_found(2);

        let retired = mp.retire(Some(MapPointId::new(9))).unwrap();
        assert_eq!(retired.observations, vec![(KeyFrameId::new(1), 4, true)]);
        assert_eq!(retired.visible, 4);
        assert_eq!(retired.found, 3);

        assert!(mp.is_bad());
        assert_eq!(mp.replaced_by(), Some(MapPointId::new(9)));
        assert!(mp.observations().is_empty());
        assert_eq!(mp.num_observations(), 0);
        assert!(mp.retire(None).is_none());
        assert!(!mp.add_observation(KeyFrameId::new(2), 0, false));
    }

    #[test]
    fn test_found_ratio_counters_start_at_one() {
        let mp = create_test_mappoint();
        assert_eq!(mp.visible(), 1);
        assert_eq!(mp.found(), 1);
        assert_eq!(mp.found_ratio(), 1.0);

        mp.increase_visible(3);
        assert_relative_eq!(mp.found_ratio(), 0.25);
    }

    #[test]
    fn test_select_distinctive_descriptor() {
        // Two descriptors close together and one outlier: a member of the
        // close pair wins.
        let a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        b[0] = 0b0000_0011;
        let c = vec![0xFFu8; 32];

        let best = select_distinctive_descriptor(&[c.clone(), a.clone(), b.clone()]).unwrap();
        assert_eq!(best, 1);

        assert_eq!(select_distinctive_descriptor(&[a]), Some(0));
        assert_eq!(select_distinctive_descriptor(&[]), None);
    }

    #[test]
    fn test_compute_normal_and_depth() {
        let position = Vector3::new(0.0, 0.0, 10.0);
        let centers = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 5.0)];

        let (normal, min, max) =
            compute_normal_and_depth(&position, &centers, &centers[0], 1.44, 1.2f64.powi(7))
                .unwrap();

        assert_relative_eq!(normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(max, 14.4, epsilon = 1e-12);
        assert_relative_eq!(min, 14.4 / 1.2f64.powi(7), epsilon = 1e-12);

        assert!(compute_normal_and_depth(&position, &[], &centers[0], 1.0, 1.0).is_none());
    }

    #[test]
    fn test_distance_band() {
        let mp = create_test_mappoint();
        mp.set_normal_and_depth(Vector3::z(), 1.0, 10.0);

        assert_relative_eq!(mp.min_distance_invariance(), 0.8);
        assert_relative_eq!(mp.max_distance_invariance(), 12.0);
        assert!(mp.is_in_distance_band(0.9));
        assert!(mp.is_in_distance_band(11.5));
        assert!(!mp.is_in_distance_band(0.7));
        assert!(!mp.is_in_distance_band(12.5));
    }
}
