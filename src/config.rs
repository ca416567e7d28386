// src/config.rs

use crate::types::Config;
use anyhow::{ensure, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation. A config that passes here never produces a
    /// panic inside the tick loop.
    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        ensure!(
            t.min_green_secs > 0.0 && t.max_green_secs > 0.0,
            "green times must be positive (min={}, max={})",
            t.min_green_secs,
            t.max_green_secs
        );
        ensure!(
            t.min_green_secs <= t.max_green_secs,
            "min_green_secs ({}) exceeds max_green_secs ({})",
            t.min_green_secs,
            t.max_green_secs
        );
        ensure!(
            t.base_green_secs > 0.0,
            "base_green_secs must be positive, got {}",
            t.base_green_secs
        );
        ensure!(
            t.secs_per_vehicle >= 0.0,
            "secs_per_vehicle must be non-negative, got {}",
            t.secs_per_vehicle
        );
        ensure!(
            t.yellow_secs > 0.0,
            "yellow_secs must be positive, got {}",
            t.yellow_secs
        );
        ensure!(
            t.emergency_secs > 0.0,
            "emergency_secs must be positive, got {}",
            t.emergency_secs
        );

        let v = &self.verifier;
        ensure!(v.min_area > 0.0, "verifier.min_area must be positive");
        ensure!(
            v.aspect_ratio_min > 0.0 && v.aspect_ratio_min <= v.aspect_ratio_max,
            "verifier aspect ratio range [{}, {}] is empty",
            v.aspect_ratio_min,
            v.aspect_ratio_max
        );
        for (name, ratio) in [
            ("alert_pixel_ratio", v.alert_pixel_ratio),
            ("lenient_alert_ratio", v.lenient_alert_ratio),
            ("light_pixel_ratio", v.light_pixel_ratio),
            ("fallback_confidence", v.fallback_confidence),
        ] {
            ensure!(
                (0.0..=1.0).contains(&ratio),
                "verifier.{} must be within [0, 1], got {}",
                name,
                ratio
            );
        }

        ensure!(
            self.lanes.count >= 2,
            "an intersection needs at least 2 lanes, got {}",
            self.lanes.count
        );
        ensure!(
            !self.lanes.vehicle_classes.is_empty(),
            "lanes.vehicle_classes must not be empty"
        );
        ensure!(
            self.worker.deadline_ms > 0,
            "worker.deadline_ms must be positive"
        );
        ensure!(self.worker.tick_hz > 0, "worker.tick_hz must be positive");

        Ok(())
    }
}

/// Baseline config shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    use crate::types::*;

    Config {
        timing: TimingConfig {
            min_green_secs: 10.0,
            max_green_secs: 60.0,
            base_green_secs: 15.0,
            secs_per_vehicle: 0.5,
            yellow_secs: 3.0,
            emergency_secs: 30.0,
        },
        verifier: VerifierConfig {
            mode: VerifierMode::Strict,
            min_area: 1500.0,
            aspect_ratio_min: 1.5,
            aspect_ratio_max: 3.0,
            alert_pixel_ratio: 0.4,
            lenient_alert_ratio: 0.2,
            light_pixel_ratio: 0.08,
            cross_min_segments: 2,
            fallback_confidence: 0.8,
        },
        lanes: LanesConfig {
            count: 4,
            vehicle_classes: vec![
                "car".into(),
                "motorcycle".into(),
                "bus".into(),
                "truck".into(),
                "bicycle".into(),
            ],
            emergency_candidates: vec!["truck".into(), "bus".into()],
        },
        worker: WorkerConfig {
            deadline_ms: 200,
            max_stale_ticks: 5,
            tick_hz: 30,
        },
        logging: LoggingConfig {
            level: "info".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::test_config;

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_min_green_above_max_rejected() {
        let mut config = test_config();
        config.timing.min_green_secs = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut config = test_config();
        config.timing.yellow_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_lane_rejected() {
        let mut config = test_config();
        config.lanes.count = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_aspect_range_rejected() {
        let mut config = test_config();
        config.verifier.aspect_ratio_min = 4.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_ratio_rejected() {
        let mut config = test_config();
        config.verifier.alert_pixel_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
