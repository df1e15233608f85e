pub mod continuous;
pub mod engine;
pub mod manual;
pub mod state;

pub use continuous::{CalibratorConfig, ContinuousCalibrator, CycleOutcome, CycleReport, Phase};
pub use engine::{CalibrationEngine, EngineConfig};
pub use manual::{ManualCalibration, ManualCalibrationError};
pub use state::{CalibrationParams, CalibrationState};
