//! Session-level settings for tracking and solving.

use pintrack_core::{ChannelMask, Result, TrackError};
use serde::{Deserialize, Serialize};

/// Region-alignment settings shared by every marker of a tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Largest accepted `1 - correlation`.
    pub max_error: f64,
    pub max_iterations: u32,
    /// Run an exhaustive integer-translation search before refining.
    pub brute_force_pre_track: bool,
    pub normalized_intensities: bool,
    /// Gaussian sigma applied to both frames before alignment.
    pub pre_blur_sigma: f64,
    pub channels: ChannelMask,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_error: 0.2,
            max_iterations: 50,
            brute_force_pre_track: true,
            normalized_intensities: false,
            pre_blur_sigma: 0.9,
            channels: ChannelMask::ALL,
        }
    }
}

impl TrackerSettings {
    /// Minimum correlation a tracked result must reach.
    pub fn minimum_correlation(&self) -> f64 {
        1.0 - self.max_error
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_error) {
            return Err(TrackError::InvalidParameter(format!(
                "max_error must lie in [0, 1], got {}",
                self.max_error
            )));
        }
        if self.max_iterations == 0 {
            return Err(TrackError::InvalidParameter(
                "max_iterations must be positive".into(),
            ));
        }
        if self.pre_blur_sigma.is_nan() || self.pre_blur_sigma < 0.0 {
            return Err(TrackError::InvalidParameter(format!(
                "pre_blur_sigma must be non-negative, got {}",
                self.pre_blur_sigma
            )));
        }
        if self.channels.is_empty() {
            return Err(TrackError::InvalidParameter(
                "at least one channel must be enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Robust estimator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProsacConfig {
    pub max_iterations: u32,
    /// Probability that at least one all-inlier sample was drawn.
    pub confidence: f64,
    /// Residual, in pixels, under which a correspondence counts as inlier.
    pub inlier_threshold: f64,
    /// Outlier ratio used to derive the proportion-based iteration limit.
    pub max_outlier_proportion: f64,
    pub seed: u64,
}

impl Default for ProsacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4096,
            confidence: 0.99,
            inlier_threshold: 2.0,
            max_outlier_proportion: 0.8,
            seed: 12345,
        }
    }
}

impl ProsacConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(TrackError::InvalidParameter(
                "prosac max_iterations must be positive".into(),
            ));
        }
        if self.confidence.is_nan() || self.confidence <= 0.0 || self.confidence >= 1.0 {
            return Err(TrackError::InvalidParameter(format!(
                "prosac confidence must lie in (0, 1), got {}",
                self.confidence
            )));
        }
        if self.inlier_threshold.is_nan() || self.inlier_threshold <= 0.0 {
            return Err(TrackError::InvalidParameter(
                "prosac inlier_threshold must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.max_outlier_proportion) {
            return Err(TrackError::InvalidParameter(format!(
                "prosac max_outlier_proportion must lie in [0, 1), got {}",
                self.max_outlier_proportion
            )));
        }
        Ok(())
    }
}

/// Curve-solving settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Smoothing windows for translation, rotation and scale.
    pub smooth_transform: [i32; 3],
    pub smooth_corner_pin: i32,
    pub prosac: ProsacConfig,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            smooth_transform: [0, 0, 0],
            smooth_corner_pin: 0,
            prosac: ProsacConfig::default(),
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.smooth_transform.iter().any(|w| *w < 0) || self.smooth_corner_pin < 0 {
            return Err(TrackError::InvalidParameter(
                "smoothing windows must be non-negative".into(),
            ));
        }
        self.prosac.validate()
    }
}

/// Complete configuration for a tracker instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PintrackConfig {
    pub tracker: TrackerSettings,
    pub solver: SolverSettings,
}

impl PintrackConfig {
    /// Parse a configuration and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TrackError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TrackError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.solver.validate()
    }
}
