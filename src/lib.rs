//! Davis anemometer / Tempest reference fusion with continuous calibration.

pub mod aggregator;
pub mod calibration;
pub mod dashboard;
pub mod device;
pub mod direction_history;
pub mod error;
pub mod firewall;
pub mod live_status;
pub mod publish;
pub mod reconnect;
pub mod shutdown;
pub mod tempest;
pub mod types;

pub use error::{FusionError, Result};
