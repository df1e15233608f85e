use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One calibrated reading from the serial anemometer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindReading {
    /// Iteration counter reported by the device firmware
    pub sequence_counter: u64,
    pub speed_mps: f64,
    pub speed_knots: f64,
    /// Always in [0, 360)
    pub direction_deg: f64,
    /// Potentiometer counts, 0-1023 on a healthy sensor
    pub raw_pot_value: u16,
    pub rpm_debounced: u32,
    pub rpm_raw: u32,
}

impl WindReading {
    pub fn rotations_per_second(&self) -> f64 {
        if self.rpm_debounced > 0 {
            self.rpm_debounced as f64 / 60.0
        } else {
            0.0
        }
    }
}

/// Speed/direction pair fed to the calibration engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindObservation {
    pub speed_knots: f64,
    pub direction_deg: f64,
}

impl WindObservation {
    pub fn new(speed_knots: f64, direction_deg: f64) -> Self {
        Self {
            speed_knots,
            direction_deg,
        }
    }
}

/// Which reference message type produced a reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    /// Instantaneous feed, lowest latency
    RapidWind,
    /// Periodic average feed
    ObsSt,
}

impl ReferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceSource::RapidWind => "rapid_wind",
            ReferenceSource::ObsSt => "obs_st",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceReading {
    pub speed_knots: f64,
    pub direction_deg: f64,
    /// Station epoch seconds
    pub timestamp: i64,
    pub source: ReferenceSource,
}

impl ReferenceReading {
    pub fn observation(&self) -> WindObservation {
        WindObservation::new(self.speed_knots, self.direction_deg)
    }
}

/// Device/reference pair captured at the same moment. The device side is
/// always expressed in uncalibrated sensor terms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub device: WindObservation,
    pub reference: ReferenceReading,
    pub taken_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub speed_factor: f64,
    pub direction_offset_deg: f64,
    pub speed_confidence: f64,
    pub direction_confidence: f64,
    /// Number of pairs that contributed a speed ratio
    pub sample_count: usize,
    pub speed_ratios: Vec<f64>,
    pub direction_diffs: Vec<f64>,
}
