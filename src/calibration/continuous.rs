//! Bootstrap/steady calibration control loop.
//!
//! Each cycle collects paired device/reference samples, runs the engine, and
//! folds an accepted result into the live [`CalibrationState`]. The first
//! accepted result is applied whole; later ones are smoothed in.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::calibration::engine::{CalibrationEngine, EngineConfig};
use crate::calibration::state::{CalibrationParams, CalibrationState};
use crate::device::uncalibrated_observation;
use crate::shutdown::Shutdown;
use crate::tempest::ReferenceCache;
use crate::types::{CalibrationResult, CalibrationSample, WindReading};

#[derive(Clone, Debug)]
pub struct CalibratorConfig {
    pub samples_per_cycle: usize,
    pub sample_spacing: Duration,
    /// Collection gives up after `samples_per_cycle * sample_spacing * slack`
    pub collection_slack: f64,
    pub bootstrap_interval: Duration,
    pub steady_interval: Duration,
    pub bootstrap_speed_threshold: f64,
    pub bootstrap_direction_threshold: f64,
    pub steady_speed_threshold: f64,
    pub steady_direction_threshold: f64,
    /// Smoothing rate for steady-phase updates
    pub adjustment_rate: f64,
    pub min_samples: usize,
    pub engine: EngineConfig,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            samples_per_cycle: 10,
            sample_spacing: Duration::from_secs(2),
            collection_slack: 2.0,
            bootstrap_interval: Duration::from_secs(180),
            steady_interval: Duration::from_secs(900),
            bootstrap_speed_threshold: 0.3,
            bootstrap_direction_threshold: 0.0,
            steady_speed_threshold: 0.5,
            steady_direction_threshold: 0.0,
            adjustment_rate: 0.3,
            min_samples: 3,
            engine: EngineConfig::default(),
        }
    }
}

impl CalibratorConfig {
    fn collection_budget(&self) -> Duration {
        self.sample_spacing
            .mul_f64(self.samples_per_cycle as f64 * self.collection_slack.max(1.0))
    }

    /// (speed, direction) confidence minimums for a phase.
    pub fn thresholds(&self, phase: Phase) -> (f64, f64) {
        match phase {
            Phase::Bootstrap => (
                self.bootstrap_speed_threshold,
                self.bootstrap_direction_threshold,
            ),
            Phase::Steady => (self.steady_speed_threshold, self.steady_direction_threshold),
        }
    }

    pub fn interval(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Bootstrap => self.bootstrap_interval,
            Phase::Steady => self.steady_interval,
        }
    }

    pub fn rate(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Bootstrap => 1.0,
            Phase::Steady => self.adjustment_rate,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No calibration accepted yet
    Bootstrap,
    Steady,
}

impl Phase {
    pub fn of(state: &CalibrationState) -> Self {
        if state.is_bootstrapped() {
            Phase::Steady
        } else {
            Phase::Bootstrap
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    InsufficientSamples {
        collected: usize,
    },
    /// Enough pairs, but no usable speed ratio (still air)
    NoResult {
        collected: usize,
    },
    Rejected {
        result: CalibrationResult,
        speed_threshold: f64,
        direction_threshold: f64,
    },
    Applied {
        result: CalibrationResult,
        rate: f64,
        params: CalibrationParams,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub finished_at: DateTime<Utc>,
    /// Phase the cycle was evaluated in
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

pub struct ContinuousCalibrator {
    config: CalibratorConfig,
    engine: CalibrationEngine,
    state: CalibrationState,
    reference: ReferenceCache,
    device: watch::Receiver<Option<WindReading>>,
    shutdown: Shutdown,
    report_tx: watch::Sender<Option<CycleReport>>,
}

impl ContinuousCalibrator {
    pub fn new(
        config: CalibratorConfig,
        state: CalibrationState,
        reference: ReferenceCache,
        device: watch::Receiver<Option<WindReading>>,
        shutdown: Shutdown,
    ) -> Self {
        let (report_tx, _) = watch::channel(None);
        ContinuousCalibrator {
            engine: CalibrationEngine::new(config.engine.clone()),
            config,
            state,
            reference,
            device,
            shutdown,
            report_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::of(&self.state)
    }

    /// Outcome of the most recent finished cycle.
    pub fn subscribe_reports(&self) -> watch::Receiver<Option<CycleReport>> {
        self.report_tx.subscribe()
    }

    /// Collect up to `samples_per_cycle` pairs, one per spacing slot.
    ///
    /// A slot with no fresh device reading or no reference is skipped. Returns
    /// whatever was gathered when the overall budget runs out, or `None` if
    /// shutdown interrupted collection.
    pub async fn collect_samples(&mut self) -> Option<Vec<CalibrationSample>> {
        let shutdown = self.shutdown.clone();
        let spacing = self.config.sample_spacing;
        let deadline = Instant::now() + self.config.collection_budget();
        let direction_scale = self.state.snapshot().direction_scale;

        let mut samples = Vec::with_capacity(self.config.samples_per_cycle);
        while samples.len() < self.config.samples_per_cycle {
            let now = Instant::now();
            if now >= deadline {
                info!(
                    "Sample collection timed out with {}/{} samples",
                    samples.len(),
                    self.config.samples_per_cycle
                );
                break;
            }
            let slot_end = (now + spacing).min(deadline);

            let fresh = tokio::select! {
                _ = shutdown.cancelled() => return None,
                changed = tokio::time::timeout_at(slot_end, self.device.changed()) => {
                    matches!(changed, Ok(Ok(())))
                }
            };

            if fresh {
                let reading = self.device.borrow_and_update().clone();
                match (reading, self.reference.current_wind()) {
                    (Some(reading), Some(reference)) => {
                        let device = uncalibrated_observation(&reading, direction_scale);
                        debug!(
                            "Sample {}: device {:.2} kt {:.1}°, reference {:.2} kt {:.1}° ({})",
                            samples.len() + 1,
                            device.speed_knots,
                            device.direction_deg,
                            reference.speed_knots,
                            reference.direction_deg,
                            reference.source.as_str()
                        );
                        samples.push(CalibrationSample {
                            device,
                            reference,
                            taken_at: Utc::now(),
                        });
                    }
                    (_, None) => debug!("No reference wind available, skipping sample"),
                    (None, _) => debug!("No device reading yet, skipping sample"),
                }
            } else {
                debug!("No fresh device reading within sample slot");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep_until(slot_end) => {}
            }
        }

        Some(samples)
    }

    /// Judge a collected sample set and apply it when accepted.
    pub fn evaluate(&self, samples: &[CalibrationSample]) -> CycleOutcome {
        if samples.len() < self.config.min_samples {
            return CycleOutcome::InsufficientSamples {
                collected: samples.len(),
            };
        }

        let Some(result) = self.engine.calculate_samples(samples) else {
            return CycleOutcome::NoResult {
                collected: samples.len(),
            };
        };

        let phase = self.phase();
        let (speed_threshold, direction_threshold) = self.config.thresholds(phase);
        if result.speed_confidence < speed_threshold
            || result.direction_confidence < direction_threshold
        {
            return CycleOutcome::Rejected {
                result,
                speed_threshold,
                direction_threshold,
            };
        }

        let rate = self.config.rate(phase);
        let params = self.state.apply(&result, rate);
        CycleOutcome::Applied {
            result,
            rate,
            params,
        }
    }

    /// One collect/evaluate pass. `None` when shutdown interrupted collection;
    /// a partial sample set is discarded.
    pub async fn run_cycle(&mut self) -> Option<CycleOutcome> {
        let phase = self.phase();
        info!(
            "Starting {:?} calibration cycle ({} samples, {:.0}s apart)",
            phase,
            self.config.samples_per_cycle,
            self.config.sample_spacing.as_secs_f64()
        );

        let samples = self.collect_samples().await?;
        let outcome = self.evaluate(&samples);

        match &outcome {
            CycleOutcome::InsufficientSamples { collected } => warn!(
                "Only {} calibration samples collected (need {}), keeping current calibration",
                collected, self.config.min_samples
            ),
            CycleOutcome::NoResult { collected } => info!(
                "No usable wind in {} samples, keeping current calibration",
                collected
            ),
            CycleOutcome::Rejected {
                result,
                speed_threshold,
                direction_threshold,
            } => info!(
                "Calibration rejected: speed confidence {:.2} (min {:.2}), direction confidence {:.2} (min {:.2})",
                result.speed_confidence,
                speed_threshold,
                result.direction_confidence,
                direction_threshold
            ),
            CycleOutcome::Applied {
                result,
                rate,
                params,
            } => info!(
                "Calibration applied at rate {:.2}: speed factor {:.4} (computed {:.4}), direction offset {:.2}° (computed {:.2}°) from {} samples",
                rate,
                params.speed_factor,
                result.speed_factor,
                params.direction_offset_deg,
                result.direction_offset_deg,
                result.sample_count
            ),
        }

        self.report_tx.send_replace(Some(CycleReport {
            finished_at: Utc::now(),
            phase,
            outcome: outcome.clone(),
        }));
        Some(outcome)
    }

    /// Run cycles until shutdown. Bootstrap retries on the short interval,
    /// steady on the long one.
    pub async fn run(mut self) {
        info!(
            "Continuous calibration started (bootstrap every {:.0}s, steady every {:.0}s)",
            self.config.bootstrap_interval.as_secs_f64(),
            self.config.steady_interval.as_secs_f64()
        );

        while !self.shutdown.is_triggered() {
            if self.run_cycle().await.is_none() {
                break;
            }
            let wait = self.config.interval(self.phase());
            debug!("Next calibration cycle in {:.0}s", wait.as_secs_f64());
            if !self.shutdown.sleep(wait).await {
                break;
            }
        }

        info!("Continuous calibration stopped");
    }
}
