//! Operator-driven calibration: pairs posted by hand, solved on request.
//!
//! Independent of the continuous loop. The result is only suggested as
//! startup flags, never applied to the live parameters.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::calibration::engine::{CalibrationEngine, EngineConfig};
use crate::types::{CalibrationResult, CalibrationSample, ReferenceReading, WindObservation};

pub const MIN_MANUAL_PAIRS: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum ManualCalibrationError {
    #[error("Need at least {needed} readings for calibration")]
    TooFewReadings { have: usize, needed: usize },
    #[error("Could not calculate calibration factors")]
    NoResult,
}

#[derive(Clone, Default)]
pub struct ManualCalibration {
    pairs: Arc<Mutex<Vec<CalibrationSample>>>,
    engine: CalibrationEngine,
}

impl ManualCalibration {
    pub fn new(engine: EngineConfig) -> Self {
        ManualCalibration {
            pairs: Arc::default(),
            engine: CalibrationEngine::new(engine),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CalibrationSample>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store one pair and return the new total.
    pub fn add(&self, device: WindObservation, reference: ReferenceReading) -> usize {
        let mut pairs = self.lock();
        pairs.push(CalibrationSample {
            device,
            reference,
            taken_at: Utc::now(),
        });
        pairs.len()
    }

    pub fn pairs(&self) -> Vec<CalibrationSample> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every stored pair. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut pairs = self.lock();
        let removed = pairs.len();
        pairs.clear();
        removed
    }

    pub fn calculate(&self) -> Result<CalibrationResult, ManualCalibrationError> {
        let pairs = self.lock();
        if pairs.len() < MIN_MANUAL_PAIRS {
            return Err(ManualCalibrationError::TooFewReadings {
                have: pairs.len(),
                needed: MIN_MANUAL_PAIRS,
            });
        }
        self.engine
            .calculate_samples(&pairs)
            .ok_or(ManualCalibrationError::NoResult)
    }
}

/// Startup flags that reproduce a calibration result.
pub fn suggested_command(result: &CalibrationResult) -> String {
    format!(
        "wind_fusion --calibration-factor {:.4} --direction-offset {:.2}",
        result.speed_factor, result.direction_offset_deg
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReferenceSource;
    use approx::assert_abs_diff_eq;

    fn reference(speed_knots: f64, direction_deg: f64) -> ReferenceReading {
        ReferenceReading {
            speed_knots,
            direction_deg,
            timestamp: 1700000000,
            source: ReferenceSource::RapidWind,
        }
    }

    #[test]
    fn test_needs_two_pairs() {
        let manual = ManualCalibration::default();
        assert_eq!(
            manual.calculate(),
            Err(ManualCalibrationError::TooFewReadings { have: 0, needed: 2 })
        );

        assert_eq!(manual.add(WindObservation::new(10.0, 100.0), reference(12.0, 105.0)), 1);
        assert!(matches!(
            manual.calculate(),
            Err(ManualCalibrationError::TooFewReadings { have: 1, .. })
        ));
    }

    #[test]
    fn test_calculate_and_suggest() {
        let manual = ManualCalibration::new(EngineConfig::default());
        manual.add(WindObservation::new(10.0, 100.0), reference(12.0, 105.0));
        manual.add(WindObservation::new(5.0, 350.0), reference(6.0, 355.0));

        let result = manual.calculate().unwrap();
        assert_abs_diff_eq!(result.speed_factor, 1.2, epsilon = 1e-9);
        assert_abs_diff_eq!(result.direction_offset_deg, 5.0, epsilon = 1e-9);
        assert_eq!(
            suggested_command(&result),
            "wind_fusion --calibration-factor 1.2000 --direction-offset 5.00"
        );
    }

    #[test]
    fn test_still_air_pairs_give_no_result() {
        let manual = ManualCalibration::default();
        manual.add(WindObservation::new(0.0, 0.0), reference(0.0, 0.0));
        manual.add(WindObservation::new(0.05, 0.0), reference(0.0, 0.0));
        assert_eq!(manual.calculate(), Err(ManualCalibrationError::NoResult));
    }

    #[test]
    fn test_clear_shared_between_clones() {
        let manual = ManualCalibration::default();
        let handle = manual.clone();
        handle.add(WindObservation::new(1.0, 1.0), reference(1.0, 1.0));
        handle.add(WindObservation::new(1.0, 1.0), reference(1.0, 1.0));

        assert_eq!(manual.len(), 2);
        assert_eq!(manual.clear(), 2);
        assert!(handle.is_empty());
    }
}
