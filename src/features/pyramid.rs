//! Scale pyramid parameters shared by a channel's detector.

/// Per-level scale factors and measurement variances of an image pyramid.
///
/// Level `n` is downsampled by `scale_factor^n`; the keypoint measurement
/// variance grows with the square of that factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    scale_factor: f64,
    log_scale_factor: f64,
    scale_factors: Vec<f64>,
    inv_scale_factors: Vec<f64>,
    level_sigma2: Vec<f64>,
    inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    /// # Arguments
    /// * `scale_factor` - Ratio between consecutive levels (typically 1.2)
    /// * `num_levels` - Number of levels (at least 1)
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        let num_levels = num_levels.max(1);
        let scale_factors: Vec<f64> = (0..num_levels)
            .map(|level| scale_factor.powi(level as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();

        Self {
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s| 1.0 / s).collect(),
            scale_factors,
            level_sigma2,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.scale_factors.len()
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn log_scale_factor(&self) -> f64 {
        self.log_scale_factor
    }

    #[inline]
    fn clamp(&self, level: i32) -> usize {
        (level.max(0) as usize).min(self.scale_factors.len() - 1)
    }

    /// Scale of `level` relative to level 0. Out-of-range levels are clamped.
    #[inline]
    pub fn level_scale(&self, level: i32) -> f64 {
        self.scale_factors[self.clamp(level)]
    }

    #[inline]
    pub fn inv_level_scale(&self, level: i32) -> f64 {
        self.inv_scale_factors[self.clamp(level)]
    }

    #[inline]
    pub fn level_sigma2(&self, level: i32) -> f64 {
        self.level_sigma2[self.clamp(level)]
    }

    #[inline]
    pub fn inv_level_sigma2(&self, level: i32) -> f64 {
        self.inv_level_sigma2[self.clamp(level)]
    }

    /// Scale of the coarsest level.
    pub fn max_level_scale(&self) -> f64 {
        self.scale_factors[self.scale_factors.len() - 1]
    }

    /// Predict the level a landmark would be detected at from `distance`.
    ///
    /// `max_distance` is the landmark's upper scale-invariance distance, at
    /// which it would appear at level 0 of the coarsest observation.
    pub fn predict_level(&self, max_distance: f64, distance: f64) -> i32 {
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.log_scale_factor).ceil();
        if !level.is_finite() {
            return if level > 0.0 { self.num_levels() as i32 - 1 } else { 0 };
        }
        (level as i32).clamp(0, self.num_levels() as i32 - 1)
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}
