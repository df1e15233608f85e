//! Paired-sample calibration math.
//!
//! Turns device/reference observation pairs into a speed scale and a
//! direction offset, each with a confidence derived from sample spread.

use crate::types::{CalibrationResult, CalibrationSample, WindObservation};

/// Speeds at or below this (knots) are too close to still air for a ratio.
pub const SPEED_NOISE_FLOOR_KNOTS: f64 = 0.1;

/// Direction spread (degrees) that halves direction confidence.
pub const DIRECTION_CONFIDENCE_SCALE_DEG: f64 = 10.0;

/// Confidence reported when only one value contributed.
const SINGLE_SAMPLE_CONFIDENCE: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub speed_noise_floor_knots: f64,
    /// Empirical tuning value for the Davis/Tempest pair
    pub direction_confidence_scale_deg: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            speed_noise_floor_knots: SPEED_NOISE_FLOOR_KNOTS,
            direction_confidence_scale_deg: DIRECTION_CONFIDENCE_SCALE_DEG,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CalibrationEngine {
    config: EngineConfig,
}

impl CalibrationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Compute a calibration from equal-length device/reference slices.
    ///
    /// Returns `None` for empty or mismatched input, or when no pair had both
    /// speeds above the noise floor.
    pub fn calculate(
        &self,
        device: &[WindObservation],
        reference: &[WindObservation],
    ) -> Option<CalibrationResult> {
        if device.is_empty() || device.len() != reference.len() {
            return None;
        }

        let floor = self.config.speed_noise_floor_knots;
        let mut speed_ratios = Vec::with_capacity(device.len());
        let mut direction_diffs = Vec::with_capacity(device.len());

        for (dev, reference) in device.iter().zip(reference) {
            if dev.speed_knots > floor && reference.speed_knots > floor {
                speed_ratios.push(reference.speed_knots / dev.speed_knots);
            }
            direction_diffs.push(wrap_signed_degrees(
                reference.direction_deg - dev.direction_deg,
            ));
        }

        if speed_ratios.is_empty() {
            return None;
        }

        let speed_factor = mean(&speed_ratios);
        let direction_offset_deg = mean(&direction_diffs);

        let speed_confidence = if speed_ratios.len() > 1 {
            1.0 / (1.0 + std_dev(&speed_ratios, speed_factor))
        } else {
            SINGLE_SAMPLE_CONFIDENCE
        };

        let direction_confidence = if direction_diffs.len() > 1 {
            let spread = std_dev(&direction_diffs, direction_offset_deg);
            1.0 / (1.0 + spread / self.config.direction_confidence_scale_deg)
        } else {
            SINGLE_SAMPLE_CONFIDENCE
        };

        Some(CalibrationResult {
            speed_factor,
            direction_offset_deg,
            speed_confidence,
            direction_confidence,
            sample_count: speed_ratios.len(),
            speed_ratios,
            direction_diffs,
        })
    }

    pub fn calculate_samples(&self, samples: &[CalibrationSample]) -> Option<CalibrationResult> {
        let device: Vec<WindObservation> = samples.iter().map(|s| s.device).collect();
        let reference: Vec<WindObservation> =
            samples.iter().map(|s| s.reference.observation()).collect();
        self.calculate(&device, &reference)
    }
}

/// Compute a calibration with the default engine configuration.
pub fn calculate(
    device: &[WindObservation],
    reference: &[WindObservation],
) -> Option<CalibrationResult> {
    CalibrationEngine::default().calculate(device, reference)
}

/// Shortest signed angular distance, in [-180, 180].
pub fn wrap_signed_degrees(diff: f64) -> f64 {
    if diff > 180.0 {
        diff - 360.0
    } else if diff < -180.0 {
        diff + 360.0
    } else {
        diff
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation around a precomputed mean.
fn std_dev(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn obs(speed: f64, dir: f64) -> WindObservation {
        WindObservation::new(speed, dir)
    }

    #[test]
    fn test_identical_pairs_full_confidence() {
        let device = vec![obs(10.0, 100.0); 5];
        let reference = vec![obs(12.0, 105.0); 5];

        let result = calculate(&device, &reference).unwrap();
        assert_abs_diff_eq!(result.speed_factor, 1.2, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_offset_deg, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.speed_confidence, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_confidence, 1.0, epsilon = 1e-9);
        assert_eq!(result.sample_count, 5);
    }

    #[test]
    fn test_low_speed_pair_excluded_from_ratio_only() {
        let device = vec![obs(10.0, 100.0), obs(0.05, 90.0), obs(10.0, 100.0)];
        let reference = vec![obs(12.0, 105.0), obs(3.0, 120.0), obs(12.0, 105.0)];

        let result = calculate(&device, &reference).unwrap();
        assert_eq!(result.speed_ratios.len(), 2);
        assert_eq!(result.direction_diffs.len(), 3);
        assert_abs_diff_eq!(result.speed_factor, 1.2, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_offset_deg, (5.0 + 30.0 + 5.0) / 3.0, epsilon = 1e-9);
        assert_eq!(result.sample_count, 2);
    }

    #[test]
    fn test_reference_below_floor_excluded() {
        let device = vec![obs(5.0, 0.0), obs(5.0, 0.0)];
        let reference = vec![obs(0.1, 0.0), obs(6.0, 0.0)];
        let result = calculate(&device, &reference).unwrap();
        assert_eq!(result.speed_ratios, vec![1.2]);
    }

    #[test]
    fn test_direction_difference_wraps() {
        let device = vec![obs(10.0, 350.0), obs(10.0, 10.0)];
        let reference = vec![obs(10.0, 10.0), obs(10.0, 350.0)];
        let result = calculate(&device, &reference).unwrap();
        assert_abs_diff_eq!(result.direction_diffs[0], 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_diffs[1], -20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_offset_deg, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_still_air_returns_none() {
        let device = vec![obs(0.0, 100.0); 4];
        let reference = vec![obs(0.0, 120.0); 4];
        assert!(calculate(&device, &reference).is_none());
    }

    #[test]
    fn test_rejects_empty_and_mismatched_input() {
        assert!(calculate(&[], &[]).is_none());
        assert!(calculate(&[obs(5.0, 0.0)], &[]).is_none());
    }

    #[test]
    fn test_single_sample_half_confidence() {
        let result = calculate(&[obs(5.0, 10.0)], &[obs(6.0, 15.0)]).unwrap();
        assert_eq!(result.speed_confidence, 0.5);
        assert_eq!(result.direction_confidence, 0.5);
    }

    #[test]
    fn test_spread_lowers_confidence() {
        let device = vec![obs(10.0, 100.0), obs(10.0, 100.0)];
        let reference = vec![obs(10.0, 90.0), obs(14.0, 110.0)];
        let result = calculate(&device, &reference).unwrap();
        // ratios 1.0/1.4 -> std 0.2; diffs -10/10 -> std 10
        assert_abs_diff_eq!(result.speed_confidence, 1.0 / 1.2, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_confidence, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_direction_scale_is_configurable() {
        let engine = CalibrationEngine::new(EngineConfig {
            direction_confidence_scale_deg: 20.0,
            ..EngineConfig::default()
        });
        let device = vec![obs(10.0, 100.0), obs(10.0, 100.0)];
        let reference = vec![obs(10.0, 90.0), obs(10.0, 110.0)];
        let result = engine.calculate(&device, &reference).unwrap();
        assert_abs_diff_eq!(result.direction_confidence, 1.0 / 1.5, epsilon = 1e-9);
    }
}
