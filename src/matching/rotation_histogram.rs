//! Rotation-consistency filter.
//!
//! A rigid camera motion rotates every keypoint by roughly the same angle, so
//! true matches pile up in a few bins of the orientation-difference histogram.
//! Matches outside the three dominant bins are undone after acceptance.

/// Orientation-difference histogram over accepted matches.
#[derive(Debug, Clone)]
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    pub fn new(num_bins: usize) -> Self {
        Self {
            bins: vec![Vec::new(); num_bins.max(1)],
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    /// Bin of an orientation difference in degrees, wrapped into [0, 360).
    pub fn bin(&self, angle_diff: f32) -> usize {
        let n = self.bins.len();
        let rot = angle_diff.rem_euclid(360.0);
        (rot * n as f32 / 360.0).round() as usize % n
    }

    /// Record match `key` (the index the caller will undo) with the given
    /// orientation difference.
    pub fn add(&mut self, angle_diff: f32, key: usize) {
        let bin = self.bin(angle_diff);
        self.bins[bin].push(key);
    }

    /// Keys of every match outside the dominant bins.
    pub fn inconsistent(&self) -> Vec<usize> {
        let counts: Vec<usize> = self.bins.iter().map(Vec::len).collect();
        let (ind1, ind2, ind3) = compute_three_maxima(&counts);
        self.bins
            .iter()
            .enumerate()
            .filter(|&(i, _)| Some(i) != ind1 && Some(i) != ind2 && Some(i) != ind3)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect()
    }
}

/// Indices of the three most populated bins.
///
/// Ties keep the lower index. The second and third are dropped when they hold
/// fewer than 10% of the first; if the second is dropped, so is the third.
pub fn compute_three_maxima(counts: &[usize]) -> (Option<usize>, Option<usize>, Option<usize>) {
    let (mut max1, mut max2, mut max3) = (0usize, 0usize, 0usize);
    let (mut ind1, mut ind2, mut ind3) = (None, None, None);

    for (i, &s) in counts.iter().enumerate() {
        if s > max1 {
            max3 = max2;
            max2 = max1;
            max1 = s;
            ind3 = ind2;
            ind2 = ind1;
            ind1 = Some(i);
        } else if s > max2 {
            max3 = max2;
            max2 = s;
            ind3 = ind2;
            ind2 = Some(i);
        } else if s > max3 {
            max3 = s;
            ind3 = Some(i);
        }
    }

    let floor = 0.1 * max1 as f64;
    if (max2 as f64) < floor {
        ind2 = None;
        ind3 = None;
    } else if (max3 as f64) < floor {
        ind3 = None;
    }
    (ind1, ind2, ind3)
}
