//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::reid::SimilarityMetric;

/// Configuration for the fusion engine and its re-identification gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Distance gate in scene units (metres) for spatial association.
    pub tracking_radius: f64,
    /// Seconds an object may go without a supporting detection before it ends.
    pub silence_interval: f64,
    /// Minimum similarity for a re-identification result to be accepted.
    pub reid_acceptance_threshold: f64,
    pub reid_k_neighbors: usize,
    pub reid_query_timeout_ms: u64,
    /// Re-ID is switched off when the rolling average query time exceeds this.
    pub reid_max_average_query_ms: u64,
    pub reid_set_name: String,
    pub reid_dimensions: usize,
    pub reid_metric: SimilarityMetric,
    /// Only every n-th embedding of an ending object is written to the store.
    pub reid_history_stride: usize,
    /// Cap on the distance at which a camera is considered able to see the ground.
    pub max_view_distance: f64,
    /// Consecutive invariant violations after which a warning is surfaced.
    pub invariant_violation_limit: u32,
    /// Minimum seconds between two region/tripwire events of the same region.
    pub event_debounce: f64,
    /// Objects must have been seen in more frames than this to raise region events.
    pub min_frames_for_events: u32,
    pub location_history: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tracking_radius: 2.0,
            silence_interval: 1.0,
            reid_acceptance_threshold: 0.7,
            reid_k_neighbors: 1,
            reid_query_timeout_ms: 250,
            reid_max_average_query_ms: 4000,
            reid_set_name: "reid_vector".to_string(),
            reid_dimensions: 256,
            reid_metric: SimilarityMetric::Cosine,
            reid_history_stride: 10,
            max_view_distance: 100.0,
            invariant_violation_limit: 3,
            event_debounce: 0.5,
            min_frames_for_events: 3,
            location_history: 20,
        }
    }
}

impl FusionConfig {
    /// Parse and validate a JSON configuration. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("tracking_radius", self.tracking_radius),
            ("silence_interval", self.silence_interval),
            ("max_view_distance", self.max_view_distance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(FusionError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.reid_acceptance_threshold) {
            return Err(FusionError::InvalidConfig(format!(
                "reid_acceptance_threshold must be within [0, 1], got {}",
                self.reid_acceptance_threshold
            )));
        }
        if self.reid_k_neighbors == 0 {
            return Err(FusionError::InvalidConfig(
                "reid_k_neighbors must be at least 1".to_string(),
            ));
        }
        if self.reid_query_timeout_ms == 0 {
            return Err(FusionError::InvalidConfig(
                "reid_query_timeout_ms must be positive".to_string(),
            ));
        }
        if self.reid_dimensions == 0 {
            return Err(FusionError::InvalidConfig(
                "reid_dimensions must be positive".to_string(),
            ));
        }
        if self.reid_history_stride == 0 {
            return Err(FusionError::InvalidConfig(
                "reid_history_stride must be at least 1".to_string(),
            ));
        }
        if self.event_debounce < 0.0 {
            return Err(FusionError::InvalidConfig(
                "event_debounce must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reid_query_timeout(&self) -> Duration {
        Duration::from_millis(self.reid_query_timeout_ms)
    }

    pub fn reid_max_average_query(&self) -> Duration {
        Duration::from_millis(self.reid_max_average_query_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FusionConfig::from_json_str(r#"{"tracking_radius": 3.5}"#).unwrap();
        assert_eq!(config.tracking_radius, 3.5);
        assert_eq!(config.silence_interval, 1.0);
        assert_eq!(config.reid_metric, SimilarityMetric::Cosine);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = FusionConfig::from_json_str(r#"{"reid_acceptance_threshold": 1.5}"#);
        assert!(matches!(err, Err(FusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_radius() {
        let config = FusionConfig {
            tracking_radius: 0.0,
            ..FusionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"silence_interval": 2.5, "reid_metric": "l2"}}"#).unwrap();
        let config = FusionConfig::from_path(file.path()).unwrap();
        assert_eq!(config.silence_interval, 2.5);
        assert_eq!(config.reid_metric, SimilarityMetric::L2);
    }
}
