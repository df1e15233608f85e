use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::device::normalize_direction;
use crate::types::WindReading;

/// Reduced view of one reporting window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub sample_count: usize,
    pub interval_secs: f64,
    pub mean_speed_mps: f64,
    pub mean_speed_knots: f64,
    pub min_speed_knots: f64,
    pub max_speed_knots: f64,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
    pub mean_direction_deg: f64,
    /// Resultant vector length of the directions: 1.0 steady, near 0 variable
    pub consistency: f64,
}

/// Accumulates readings over a reporting interval.
pub struct WindowAggregator {
    interval: Duration,
    started: Instant,
    speeds_mps: Vec<f64>,
    speeds_knots: Vec<f64>,
    directions_deg: Vec<f64>,
    min_speed_knots: f64,
    max_speed_knots: f64,
    min_speed_mps: f64,
    max_speed_mps: f64,
}

impl WindowAggregator {
    pub fn new(interval: Duration) -> Self {
        WindowAggregator {
            interval,
            started: Instant::now(),
            speeds_mps: Vec::new(),
            speeds_knots: Vec::new(),
            directions_deg: Vec::new(),
            min_speed_knots: f64::INFINITY,
            max_speed_knots: 0.0,
            min_speed_mps: f64::INFINITY,
            max_speed_mps: 0.0,
        }
    }

    pub fn add(&mut self, reading: &WindReading) {
        self.speeds_mps.push(reading.speed_mps);
        self.speeds_knots.push(reading.speed_knots);
        self.directions_deg.push(reading.direction_deg);

        self.min_speed_knots = self.min_speed_knots.min(reading.speed_knots);
        self.max_speed_knots = self.max_speed_knots.max(reading.speed_knots);
        self.min_speed_mps = self.min_speed_mps.min(reading.speed_mps);
        self.max_speed_mps = self.max_speed_mps.max(reading.speed_mps);
    }

    pub fn len(&self) -> usize {
        self.speeds_knots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speeds_knots.is_empty()
    }

    pub fn should_report(&self) -> bool {
        self.started.elapsed() >= self.interval && !self.is_empty()
    }

    /// Reduce the window and start a new one.
    pub fn reduce(&mut self) -> WindowSummary {
        let (mean_direction_deg, consistency) =
            circular_mean(&self.directions_deg).unwrap_or((0.0, 0.0));

        let summary = WindowSummary {
            sample_count: self.len(),
            interval_secs: self.interval.as_secs_f64(),
            mean_speed_mps: mean_or_zero(&self.speeds_mps),
            mean_speed_knots: mean_or_zero(&self.speeds_knots),
            min_speed_knots: finite_or_zero(self.min_speed_knots),
            max_speed_knots: self.max_speed_knots,
            min_speed_mps: finite_or_zero(self.min_speed_mps),
            max_speed_mps: self.max_speed_mps,
            mean_direction_deg,
            consistency,
        };

        *self = WindowAggregator::new(self.interval);
        summary
    }
}

/// Vector mean of compass directions.
///
/// Returns `(mean_deg, magnitude)` with the mean in [0, 360) and the
/// resultant magnitude in [0, 1], or `None` for an empty slice.
pub fn circular_mean(directions_deg: &[f64]) -> Option<(f64, f64)> {
    if directions_deg.is_empty() {
        return None;
    }

    let n = directions_deg.len() as f64;
    let (sum_cos, sum_sin) = directions_deg.iter().fold((0.0, 0.0), |(c, s), deg| {
        let rad = deg.to_radians();
        (c + rad.cos(), s + rad.sin())
    });

    let mean_cos = sum_cos / n;
    let mean_sin = sum_sin / n;
    let mean_deg = normalize_direction(mean_sin.atan2(mean_cos).to_degrees());
    let magnitude = (mean_cos * mean_cos + mean_sin * mean_sin).sqrt().min(1.0);

    Some((mean_deg, magnitude))
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
