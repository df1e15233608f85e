//! Telemetry publishing seam.
//!
//! The core produces [`Metric`]s; a [`MetricSink`] decides where they go.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::aggregator::WindowSummary;
use crate::error::{FusionError, Result};
use crate::types::WindReading;

#[derive(Clone, Debug, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: f64,
    pub units: &'static str,
    pub description: &'static str,
    pub timestamp: DateTime<Utc>,
    pub meta: BTreeMap<&'static str, String>,
}

impl Metric {
    fn new(
        name: &'static str,
        value: f64,
        units: &'static str,
        description: &'static str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Metric {
            name,
            value,
            units,
            description,
            timestamp,
            meta: BTreeMap::new(),
        }
    }

    fn tagged(mut self, sample_count: usize, interval_secs: f64) -> Self {
        self.meta.insert("sample_count", sample_count.to_string());
        self.meta.insert("interval_secs", format!("{}", interval_secs));
        self
    }
}

pub trait MetricSink: Send {
    fn publish(&mut self, metric: &Metric) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Immediate per-reading metrics. Tagged as a single sample with no interval.
pub fn reading_metrics(reading: &WindReading, at: DateTime<Utc>) -> Vec<Metric> {
    let fields = [
        ("env.wind.speed", reading.speed_knots, "knots", "Wind speed in knots"),
        ("env.wind.direction", reading.direction_deg, "degrees", "Wind direction in degrees"),
        (
            "env.wind.speed.mps",
            reading.speed_mps,
            "m/s",
            "Wind speed in meters per second",
        ),
        (
            "davis.wind.rps",
            reading.rotations_per_second(),
            "rps",
            "Wind sensor rotations per second",
        ),
        (
            "davis.wind.rpm.tops",
            reading.rpm_debounced as f64,
            "rpm",
            "Debounced RPM count",
        ),
        ("davis.wind.rpm.raw", reading.rpm_raw as f64, "rpm", "Raw RPM count"),
        (
            "davis.wind.pot.value",
            reading.raw_pot_value as f64,
            "counts",
            "Raw potentiometer value for direction",
        ),
        (
            "davis.wind.iteration",
            reading.sequence_counter as f64,
            "count",
            "Device iteration counter",
        ),
    ];

    fields
        .into_iter()
        .map(|(name, value, units, description)| Metric::new(name, value, units, description, at))
        .chain(std::iter::once(sensor_status_metric(true, at)))
        .map(|m| m.tagged(1, 0.0))
        .collect()
}

pub fn window_metrics(summary: &WindowSummary, at: DateTime<Utc>) -> Vec<Metric> {
    let fields = [
        (
            "env.wind.speed.avg",
            summary.mean_speed_knots,
            "knots",
            "Mean wind speed over the interval",
        ),
        (
            "env.wind.speed.avg.mps",
            summary.mean_speed_mps,
            "m/s",
            "Mean wind speed over the interval",
        ),
        (
            "env.wind.speed.min",
            summary.min_speed_knots,
            "knots",
            "Minimum wind speed over the interval",
        ),
        (
            "env.wind.speed.max",
            summary.max_speed_knots,
            "knots",
            "Maximum wind speed over the interval",
        ),
        (
            "env.wind.direction.avg",
            summary.mean_direction_deg,
            "degrees",
            "Circular mean wind direction",
        ),
        (
            "env.wind.direction.consistency",
            summary.consistency,
            "ratio",
            "Resultant length of wind directions (1 = steady)",
        ),
    ];

    fields
        .into_iter()
        .map(|(name, value, units, description)| Metric::new(name, value, units, description, at))
        .map(|m| m.tagged(summary.sample_count, summary.interval_secs))
        .collect()
}

pub fn sensor_status_metric(ok: bool, at: DateTime<Utc>) -> Metric {
    Metric::new(
        "davis.wind.sensor_status",
        if ok { 1.0 } else { 0.0 },
        "",
        "Davis wind sensor status (0=error, 1=ok)",
        at,
    )
}

/// Writes metrics to the log. Window averages at info, the rest at debug.
#[derive(Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn publish(&mut self, metric: &Metric) -> Result<()> {
        if metric.name.ends_with(".avg") || metric.name.ends_with(".consistency") {
            info!("{} = {:.3} {} {:?}", metric.name, metric.value, metric.units, metric.meta);
        } else {
            debug!("{} = {:.3} {}", metric.name, metric.value, metric.units);
        }
        Ok(())
    }
}

/// Appends one JSON object per metric to a file.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(FusionError::Publish)?;
        Ok(JsonLinesSink {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricSink for JsonLinesSink {
    fn publish(&mut self, metric: &Metric) -> Result<()> {
        serde_json::to_writer(&mut self.writer, metric)?;
        self.writer.write_all(b"\n").map_err(FusionError::Publish)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(FusionError::Publish)
    }
}

/// Fans metrics out to several sinks.
#[derive(Default)]
pub struct Publisher {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn publish_all(&mut self, metrics: &[Metric]) {
        for sink in self.sinks.iter_mut() {
            for metric in metrics {
                if let Err(e) = sink.publish(metric) {
                    log::warn!("Failed to publish {}: {}", metric.name, e);
                    break;
                }
            }
            if let Err(e) = sink.flush() {
                log::warn!("Failed to flush metric sink: {}", e);
            }
        }
    }
}
