use log::{debug, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::aggregator::WindowSummary;
use crate::calibration::continuous::{CycleReport, Phase};
use crate::calibration::manual::ManualCalibration;
use crate::calibration::state::{CalibrationParams, CalibrationState};
use crate::direction_history::DirectionHistory;
use crate::error::{FusionError, Result};
use crate::firewall::FirewallSetup;
use crate::shutdown::Shutdown;
use crate::tempest::{IngestStats, ReferenceCache};
use crate::types::{ReferenceReading, WindReading};

pub const STATUS_FILE_NAME: &str = "live_status.json";
pub const STATUS_WRITE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Serialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    // Calibration
    pub phase: Phase,
    pub calibration: CalibrationParams,
    pub last_cycle: Option<CycleReport>,
    pub manual_pairs: usize,
    // Sensors
    pub latest_reading: Option<WindReading>,
    pub reference_wind: Option<ReferenceReading>,
    pub last_window: Option<WindowSummary>,
    pub reference_stats: IngestStats,
    pub direction_history_buckets: usize,
}

impl LiveStatus {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| FusionError::Persist {
            path: path.display().to_string(),
            source,
        })
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Read-side handles onto every worker, cheap to clone into the dashboard.
#[derive(Clone)]
pub struct StatusSources {
    pub started: Instant,
    pub state: CalibrationState,
    pub reference: ReferenceCache,
    pub readings: watch::Receiver<Option<WindReading>>,
    pub windows: watch::Receiver<Option<WindowSummary>>,
    pub cycles: watch::Receiver<Option<CycleReport>>,
    pub history: Arc<Mutex<DirectionHistory>>,
    pub manual: ManualCalibration,
    pub firewall: FirewallSetup,
}

impl StatusSources {
    pub fn snapshot(&self) -> LiveStatus {
        LiveStatus {
            timestamp: current_timestamp(),
            uptime_seconds: self.started.elapsed().as_secs(),
            phase: Phase::of(&self.state),
            calibration: self.state.snapshot(),
            last_cycle: self.cycles.borrow().clone(),
            manual_pairs: self.manual.len(),
            latest_reading: self.readings.borrow().clone(),
            reference_wind: self.reference.current_wind(),
            last_window: self.windows.borrow().clone(),
            reference_stats: self.reference.stats(),
            direction_history_buckets: self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .bucket_count(),
        }
    }
}

/// Rewrite `<output_dir>/live_status.json` every `interval`, plus once more
/// on shutdown.
pub async fn run_status_writer(
    sources: StatusSources,
    output_dir: PathBuf,
    interval: Duration,
    shutdown: Shutdown,
) {
    let path = output_dir.join(STATUS_FILE_NAME);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sources.snapshot().save(&path) {
                    warn!("Failed to write live status: {}", e);
                }
            }
        }
    }

    match sources.snapshot().save(&path) {
        Ok(()) => debug!("Final live status written to {}", path.display()),
        Err(e) => warn!("Failed to write final live status: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use tempfile::tempdir;

    fn sources() -> StatusSources {
        let (_, readings) = watch::channel(None);
        let (_, windows) = watch::channel(None);
        let (_, cycles) = watch::channel(None);
        StatusSources {
            started: Instant::now(),
            state: CalibrationState::new(CalibrationParams::new(1.1, -4.0, 1.0)),
            reference: ReferenceCache::new(),
            readings,
            windows,
            cycles,
            history: Arc::new(Mutex::new(DirectionHistory::new())),
            manual: ManualCalibration::default(),
            firewall: FirewallSetup {
                port: 50222,
                rule_added: false,
            },
        }
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let sources = sources();
        sources
            .reference
            .ingest_datagram(br#"{"type":"rapid_wind","ob":[1700000000,2.0,270.0]}"#);

        let status = sources.snapshot();
        assert_eq!(status.phase, Phase::Bootstrap);
        assert_eq!(status.calibration.speed_factor, 1.1);
        assert_eq!(status.reference_wind.unwrap().direction_deg, 270.0);
        assert!(status.latest_reading.is_none());
        assert_eq!(status.reference_stats.datagrams, 1);
        assert_eq!(status.manual_pairs, 0);
    }

    #[tokio::test]
    async fn test_writer_saves_final_snapshot_on_shutdown() {
        let dir = tempdir().unwrap();
        let (trigger, shutdown) = shutdown::channel();

        let writer = tokio::spawn(run_status_writer(
            sources(),
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        writer.await.unwrap();

        let content = fs::read_to_string(dir.path().join(STATUS_FILE_NAME)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["phase"], "bootstrap");
        assert_eq!(json["calibration"]["direction_offset_deg"], -4.0);
        assert!(json["last_cycle"].is_null());
    }
}
