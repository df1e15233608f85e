//! Empirical map from reference compass direction to raw device potentiometer
//! counts, kept in 10 degree buckets. Groundwork for a non-linear direction
//! correction; the linear calibration does not read it.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use crate::device::normalize_direction;
use crate::error::{FusionError, Result};

pub const BUCKET_WIDTH_DEG: f64 = 10.0;
pub const MAX_SAMPLES_PER_BUCKET: usize = 100;
pub const MIN_SAMPLES_FOR_ESTIMATE: usize = 5;

/// Bucket table keyed by the bucket's starting degree (0, 10, ... 350).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectionHistory {
    buckets: BTreeMap<i32, VecDeque<u16>>,
}

pub fn bucket_key(direction_deg: f64) -> i32 {
    let normalized = normalize_direction(direction_deg);
    ((normalized / BUCKET_WIDTH_DEG).floor() * BUCKET_WIDTH_DEG) as i32
}

impl DirectionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reference_direction_deg: f64, raw_pot_value: u16) {
        let samples = self
            .buckets
            .entry(bucket_key(reference_direction_deg))
            .or_default();
        samples.push_back(raw_pot_value);
        while samples.len() > MAX_SAMPLES_PER_BUCKET {
            samples.pop_front();
        }
    }

    /// Median pot value for the bucket holding `reference_direction_deg`,
    /// once it has enough samples.
    pub fn expected_pot_value(&self, reference_direction_deg: f64) -> Option<f64> {
        let samples = self.buckets.get(&bucket_key(reference_direction_deg))?;
        if samples.len() < MIN_SAMPLES_FOR_ESTIMATE {
            return None;
        }

        let mut sorted: Vec<u16> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
        } else {
            sorted[mid] as f64
        };
        Some(median)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn samples_in_bucket(&self, reference_direction_deg: f64) -> usize {
        self.buckets
            .get(&bucket_key(reference_direction_deg))
            .map_or(0, VecDeque::len)
    }

    /// Load the table, starting empty when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                info!("No direction history at {} ({}), starting empty", path.display(), e);
                return Self::new();
            }
        };

        match serde_json::from_str::<DirectionHistory>(&content) {
            Ok(mut history) => {
                for samples in history.buckets.values_mut() {
                    while samples.len() > MAX_SAMPLES_PER_BUCKET {
                        samples.pop_front();
                    }
                }
                info!(
                    "Loaded direction history: {} buckets from {}",
                    history.bucket_count(),
                    path.display()
                );
                history
            }
            Err(e) => {
                warn!("Corrupt direction history {}: {}, starting empty", path.display(), e);
                Self::new()
            }
        }
    }

    /// Write the table via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let persist_err = |source| FusionError::Persist {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(persist_err)?;
        fs::rename(&tmp, path).map_err(persist_err)?;
        Ok(())
    }
}
