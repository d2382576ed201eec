//! Runtime configuration.
//!
//! Everything has a default matching the classic ORB-SLAM tuning, so a YAML
//! file only needs the fields it changes:
//!
//! ```yaml
//! camera: { fx: 458.654, fy: 457.296, cx: 367.215, cy: 248.375, baseline: 0.11, width: 752, height: 480 }
//! pyramid: { scale_factor: 1.2, levels: 8 }
//! associater:
//!   nn_ratio: 0.75
//!   channel_overrides:
//!     brisk: { high: 120, low: 70 }
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::features::{FeatureType, ScalePyramid};
use crate::frame::CameraModel;
use crate::local_mapping::LocalMappingConfig;

/// Errors raised by [`SlamConfig::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A numeric field outside its admissible range.
    OutOfRange { field: &'static str, value: f64 },
    /// `low` must not exceed `high`.
    ThresholdOrder {
        channel: Option<FeatureType>,
        low: u32,
        high: u32,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::OutOfRange { field, value } => {
                write!(f, "Config value out of range: {} = {}", field, value)
            }
            ConfigError::ThresholdOrder { channel, low, high } => match channel {
                Some(c) => write!(f, "Threshold low ({}) exceeds high ({}) for channel {}", low, high, c),
                None => write!(f, "Threshold low ({}) exceeds high ({})", low, high),
            },
        }
    }
}

impl std::error::Error for ConfigError {}

/// Descriptor-distance and geometric gates used by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    /// Loose acceptance threshold (tracking searches, Sim3 search).
    pub high: u32,
    /// Strict acceptance threshold (BoW, triangulation, fusion).
    pub low: u32,
    /// Number of orientation-difference bins of the rotation filter.
    pub histogram_bins: usize,
    /// Squared epipolar distance gate, 1 DoF at 95%.
    pub chi2_epipolar: f64,
    /// Monocular reprojection gate, 2 DoF at 95%.
    pub chi2_mono: f64,
    /// Stereo reprojection gate, 3 DoF at 95%.
    pub chi2_stereo: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            high: 100,
            low: 50,
            histogram_bins: 30,
            chi2_epipolar: 3.84,
            chi2_mono: 5.99,
            chi2_stereo: 7.8,
        }
    }
}

impl MatchThresholds {
    fn validate(&self, channel: Option<FeatureType>) -> Result<(), ConfigError> {
        if self.low > self.high {
            return Err(ConfigError::ThresholdOrder {
                channel,
                low: self.low,
                high: self.high,
            });
        }
        if self.histogram_bins == 0 {
            return Err(ConfigError::OutOfRange {
                field: "histogram_bins",
                value: 0.0,
            });
        }
        for (field, value) in [
            ("chi2_epipolar", self.chi2_epipolar),
            ("chi2_mono", self.chi2_mono),
            ("chi2_stereo", self.chi2_stereo),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        Ok(())
    }
}

/// Matcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociaterConfig {
    /// Best/second-best ratio; a match is kept when best < ratio * second.
    pub nn_ratio: f64,
    /// Apply the rotation-consistency filter.
    pub check_orientation: bool,
    pub thresholds: MatchThresholds,
    /// Per-channel replacements of `thresholds`.
    pub channel_overrides: HashMap<FeatureType, MatchThresholds>,
}

impl Default for AssociaterConfig {
    fn default() -> Self {
        Self {
            nn_ratio: 0.6,
            check_orientation: true,
            thresholds: MatchThresholds::default(),
            channel_overrides: HashMap::new(),
        }
    }
}

impl AssociaterConfig {
    /// Thresholds in effect for `channel`.
    pub fn thresholds(&self, channel: FeatureType) -> &MatchThresholds {
        self.channel_overrides
            .get(&channel)
            .unwrap_or(&self.thresholds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.nn_ratio > 0.0 && self.nn_ratio <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "nn_ratio",
                value: self.nn_ratio,
            });
        }
        self.thresholds.validate(None)?;
        for (&channel, thresholds) in &self.channel_overrides {
            thresholds.validate(Some(channel))?;
        }
        Ok(())
    }
}

/// Image pyramid of the feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub scale_factor: f64,
    pub levels: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            levels: 8,
        }
    }
}

impl PyramidConfig {
    pub fn to_pyramid(&self) -> ScalePyramid {
        ScalePyramid::new(self.scale_factor, self.levels)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub camera: CameraModel,
    pub pyramid: PyramidConfig,
    pub associater: AssociaterConfig,
    pub local_mapping: LocalMappingConfig,
}

impl SlamConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SlamConfig = serde_yaml::from_str(yaml).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;
        for (field, value) in [
            ("camera.fx", cam.fx),
            ("camera.fy", cam.fy),
            ("camera.width", cam.width),
            ("camera.height", cam.height),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if cam.baseline < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "camera.baseline",
                value: cam.baseline,
            });
        }
        if !(self.pyramid.scale_factor > 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "pyramid.scale_factor",
                value: self.pyramid.scale_factor,
            });
        }
        if self.pyramid.levels == 0 {
            return Err(ConfigError::OutOfRange {
                field: "pyramid.levels",
                value: 0.0,
            });
        }
        self.associater.validate()?;
        self.local_mapping.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = SlamConfig::default();
        assert!(config.validate().is_ok());
        let th = config.associater.thresholds(FeatureType::Orb);
        assert_eq!((th.high, th.low, th.histogram_bins), (100, 50, 30));
        assert_relative_eq!(config.associater.nn_ratio, 0.6);
    }

    #[test]
    fn test_partial_yaml_with_channel_override() {
        let yaml = r#"
camera: { fx: 400, fy: 400, cx: 320, cy: 240, width: 640, height: 480 }
associater:
  nn_ratio: 0.75
  channel_overrides:
    brisk: { high: 120, low: 70 }
local_mapping:
  monocular: true
"#;
        let config = SlamConfig::from_yaml_str(yaml).unwrap();
        assert_relative_eq!(config.camera.fx, 400.0);
        assert_relative_eq!(config.camera.baseline, 0.0);
        assert_relative_eq!(config.associater.nn_ratio, 0.75);
        assert!(config.local_mapping.monocular);

        let brisk = config.associater.thresholds(FeatureType::Brisk);
        assert_eq!((brisk.high, brisk.low), (120, 70));
        // Unset override fields fall back to their defaults.
        assert_eq!(brisk.histogram_bins, 30);
        assert_eq!(config.associater.thresholds(FeatureType::Orb).high, 100);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let yaml = "associater:\n  channel_overrides:\n    akaze: { high: 40, low: 50 }\n";
        let err = SlamConfig::from_yaml_str(yaml).unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert_eq!(
            *config_err,
            ConfigError::ThresholdOrder {
                channel: Some(FeatureType::Akaze),
                low: 50,
                high: 40
            }
        );
    }

    #[test]
    fn test_rejects_bad_pyramid() {
        let mut config = SlamConfig::default();
        config.pyramid.scale_factor = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "pyramid.scale_factor", .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SlamConfig::load("/nonexistent/mc-vslam.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_pyramid_config() {
        let pyramid = PyramidConfig { scale_factor: 2.0, levels: 3 }.to_pyramid();
        assert_eq!(pyramid.num_levels(), 3);
        assert_relative_eq!(pyramid.level_scale(2), 4.0);
    }
}
