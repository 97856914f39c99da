//! Observer configuration.
//!
//! All tunable constants of the pipeline live in [`ObserverConfig`], which
//! can be loaded from a JSON file or built from its defaults. Durations are
//! given in physical units (seconds / minutes); the observer converts them
//! into frame counts once the frame rate is known.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON or has the wrong shape.
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is outside its permitted range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunable settings for an observing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Lag, in frames, between the two frames compared by the motion detector.
    pub stack_comparison_interval: usize,
    /// Pre-roll captured before the first detection of an event (seconds).
    pub trigger_prefix_time: f64,
    /// Post-roll captured after the last detection of an event (seconds).
    pub trigger_suffix_time: f64,
    /// Hard cap on the duration of a single event (seconds).
    pub trigger_max_duration: f64,
    /// Maximum clip frames flushed to disk per observer iteration.
    pub trigger_framegroup: usize,
    /// Rolling window for event-rate throttling (minutes).
    pub trigger_throttle_period: f64,
    /// Maximum confirmed events per throttle window.
    pub trigger_throttle_maxevt: usize,
    /// Integration time of each time-lapse exposure (seconds).
    pub timelapse_exposure: f64,
    /// Period between time-lapse exposure starts (seconds).
    pub timelapse_interval: f64,
    /// Target mean pixel value for gain-normalised time-lapse output (0-255).
    pub stack_target_brightness: i32,
    /// Frames accumulated into the background histogram per reduction cycle.
    pub background_map_frames: usize,
    /// Number of past background maps kept.
    pub background_map_samples: usize,
    /// Chunks across which one background reduction is spread.
    pub background_map_reduction_cycles: usize,
    /// Length of the ring video buffer (seconds).
    pub video_buffer_len: f64,
    /// Work on the luminance plane only (1 channel) instead of colour (3).
    pub greyscale_imaging: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            stack_comparison_interval: 2,
            trigger_prefix_time: 2.0,
            trigger_suffix_time: 3.0,
            trigger_max_duration: 30.0,
            trigger_framegroup: 10,
            trigger_throttle_period: 30.0,
            trigger_throttle_maxevt: 10,
            timelapse_exposure: 30.0,
            timelapse_interval: 60.0,
            stack_target_brightness: 32,
            background_map_frames: 3600,
            background_map_samples: 3,
            background_map_reduction_cycles: 32,
            video_buffer_len: 4.0,
            greyscale_imaging: true,
        }
    }
}

impl ObserverConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing keys fall back to their defaults, so a config file only needs
    /// to mention the settings it changes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read,
    /// `ConfigError::Json` if it is not valid JSON, or
    /// `ConfigError::Invalid` if a value is out of range.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Channel count implied by the imaging mode.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.greyscale_imaging {
            1
        } else {
            3
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stack_comparison_interval == 0 {
            return Err(ConfigError::Invalid(
                "stack_comparison_interval must be at least 1".into(),
            ));
        }
        if self.video_buffer_len <= 0.0 {
            return Err(ConfigError::Invalid(
                "video_buffer_len must be positive".into(),
            ));
        }
        if self.background_map_frames == 0 || self.background_map_reduction_cycles == 0 {
            return Err(ConfigError::Invalid(
                "background map windows must be positive".into(),
            ));
        }
        if self.background_map_samples == 0 {
            return Err(ConfigError::Invalid(
                "background_map_samples must be at least 1".into(),
            ));
        }
        if !(0..=255).contains(&self.stack_target_brightness) {
            return Err(ConfigError::Invalid(
                "stack_target_brightness must be in 0..=255".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ObserverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_count(), 1);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"timelapse_exposure": 4.0, "greyscale_imaging": false}"#)
            .unwrap();

        let config = ObserverConfig::from_json_file(&path).unwrap();
        assert_eq!(config.timelapse_exposure, 4.0);
        assert_eq!(config.channel_count(), 3);
        assert_eq!(
            config.trigger_framegroup,
            ObserverConfig::default().trigger_framegroup
        );
    }

    #[test]
    fn test_invalid_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{"stack_comparison_interval": 0}"#).unwrap();

        let result = ObserverConfig::from_json_file(&path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ObserverConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ObserverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.background_map_frames, config.background_map_frames);
        assert_eq!(back.video_buffer_len, config.video_buffer_len);
    }
}
