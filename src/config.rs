// src/config.rs
//
// Startup configuration. Loaded once from YAML, immutable for the
// process lifetime. Validation is per feature: one bad section disables
// only the features that depend on it.

use crate::error::{AnalyticsError, Result as CoreResult};
use crate::types::Config;
use anyhow::Result;
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate_calibration(&self) -> CoreResult<()> {
        let c = &self.calibration;
        if c.reference_points.len() != 4 {
            return Err(AnalyticsError::Configuration {
                feature: "calibration",
                reason: format!("expected 4 reference points, got {}", c.reference_points.len()),
            });
        }
        if c.reference_distances_m.iter().any(|&d| d <= 0.0) {
            return Err(AnalyticsError::Configuration {
                feature: "calibration",
                reason: "reference distances must be positive".into(),
            });
        }
        if c.default_lane_length_m <= 0.0 {
            return Err(AnalyticsError::Configuration {
                feature: "calibration",
                reason: "default lane length must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn validate_incidents(&self) -> CoreResult<()> {
        let i = &self.incidents;
        let positive = [
            ("stop_speed_kmh", i.stop_speed_kmh),
            ("stop_duration_secs", i.stop_duration_secs),
            ("idle_timeout_secs", i.idle_timeout_secs),
            ("max_incident_age_secs", i.max_incident_age_secs),
            ("maintenance_tick_secs", i.maintenance_tick_secs),
        ];
        for (name, value) in positive {
            if value <= 0.0 {
                return Err(AnalyticsError::Configuration {
                    feature: "incidents",
                    reason: format!("{} must be positive", name),
                });
            }
        }
        // The fallback chain must escalate in order.
        if !(i.stop_duration_secs < i.tailgate_fallback_secs
            && i.tailgate_fallback_secs < i.accident_fallback_secs)
        {
            return Err(AnalyticsError::Configuration {
                feature: "incidents",
                reason: "fallback thresholds must increase: stop < tailgate < accident".into(),
            });
        }
        Ok(())
    }

    pub fn validate_windows(&self) -> CoreResult<()> {
        if self.windows.interval_minutes == 0 {
            return Err(AnalyticsError::Configuration {
                feature: "stats_windows",
                reason: "interval_minutes must be at least 1".into(),
            });
        }
        if self.windows.queue_sample_secs <= 0.0 {
            return Err(AnalyticsError::Configuration {
                feature: "queue_windows",
                reason: "queue_sample_secs must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
camera:
  camera_id: cam-07
  frame_width: 1920
  frame_height: 1080
  image_dir: captures
calibration:
  reference_points: [[100, 900], [300, 400], [1600, 400], [1800, 900]]
  reference_distances_m: [30.0, 4.0]
  default_lane_length_m: 150.0
regions:
  lanes:
    1: [[0, 200], [100, 200], [100, 600], [0, 600]]
  stop_line: [[0, 200], [100, 200]]
  intersection: [[0, 0], [100, 0], [100, 300], [0, 300]]
incidents:
  stop_speed_kmh: 5.0
  stop_duration_secs: 10.0
  tailgate_fallback_secs: 30.0
  accident_fallback_secs: 300.0
  idle_timeout_secs: 60.0
  max_incident_age_secs: 3600.0
  maintenance_tick_secs: 10.0
  reverse:
    near_stop_line_px: 60.0
    min_speed_kmh: 3.0
    start_threshold_px: 10.0
    min_duration_secs: 2.0
    min_distance_px: 20.0
windows:
  interval_minutes: 5
  queue_sample_secs: 1.0
logging:
  level: info
"#;

    #[test]
    fn test_sample_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.camera.camera_id, "cam-07");
        assert_eq!(config.regions.lanes.len(), 1);
        assert!(config.regions.turn_left.is_empty()); // defaulted

        config.validate_calibration().unwrap();
        config.validate_incidents().unwrap();
        config.validate_windows().unwrap();
    }

    #[test]
    fn test_out_of_order_fallbacks_are_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.incidents.tailgate_fallback_secs = 500.0;
        assert!(config.validate_incidents().is_err());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.windows.interval_minutes = 0;
        assert!(config.validate_windows().is_err());
    }

    #[test]
    fn test_wrong_reference_point_count_is_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.calibration.reference_points.pop();
        let err = config.validate_calibration().unwrap_err();
        assert!(err.to_string().contains("calibration"));
    }
}
