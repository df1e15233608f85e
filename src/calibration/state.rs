use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::calibration::engine::wrap_signed_degrees;
use crate::types::CalibrationResult;

/// Snapshot of the live calibration parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub speed_factor: f64,
    pub direction_offset_deg: f64,
    /// Operator-supplied, never touched by the calibration loop
    pub direction_scale: f64,
    pub bootstrapped: bool,
}

impl CalibrationParams {
    pub fn new(speed_factor: f64, direction_offset_deg: f64, direction_scale: f64) -> Self {
        Self {
            speed_factor,
            direction_offset_deg,
            direction_scale,
            bootstrapped: false,
        }
    }
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self::new(1.0, 0.0, 1.0)
    }
}

/// Shared handle to the live calibration parameters.
///
/// Single writer: only the continuous calibrator calls [`CalibrationState::apply`].
/// The device pipeline takes a [`CalibrationState::snapshot`] for every parsed line.
#[derive(Clone, Debug)]
pub struct CalibrationState {
    inner: Arc<Mutex<CalibrationParams>>,
}

impl CalibrationState {
    pub fn new(defaults: CalibrationParams) -> Self {
        CalibrationState {
            inner: Arc::new(Mutex::new(defaults)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CalibrationParams> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CalibrationParams {
        *self.lock()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.lock().bootstrapped
    }

    /// Blend a computed result into the live values and mark the state bootstrapped.
    ///
    /// `new = old * (1 - rate) + computed * rate`. The direction blend walks the
    /// shorter arc so offsets either side of +/-180 do not average to zero.
    pub fn apply(&self, result: &CalibrationResult, rate: f64) -> CalibrationParams {
        let rate = rate.clamp(0.0, 1.0);
        let mut params = self.lock();

        params.speed_factor = params.speed_factor * (1.0 - rate) + result.speed_factor * rate;

        let delta = wrap_signed_degrees(result.direction_offset_deg - params.direction_offset_deg);
        params.direction_offset_deg =
            wrap_signed_degrees(params.direction_offset_deg + delta * rate);

        params.bootstrapped = true;
        *params
    }
}
