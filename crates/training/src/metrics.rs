use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use crate::{loss::LossTermMap, TrainingError};

/// Key under which the epoch wall time (minutes) is reported.
pub const TIME_KEY: &str = "time";

/// Running value, sum, count and average of one observed quantity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1);
    }

    pub fn update_weighted(&mut self, value: f64, weight: u64) {
        self.val = value;
        self.sum += value * weight as f64;
        self.count += weight;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn update_duration(&mut self, elapsed: Duration) {
        self.update(elapsed.as_secs_f64());
    }
}

/// One meter per configured loss term, in configuration order.
#[derive(Debug, Clone)]
pub struct LossMeters {
    meters: Vec<(String, AverageMeter)>,
}

impl LossMeters {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meters: keys
                .into_iter()
                .map(|key| (key.into(), AverageMeter::new()))
                .collect(),
        }
    }

    /// Updates every configured term that is active in `terms`, weighted by
    /// `batch_size`. Returns the indices of the meters that were updated.
    ///
    /// Every configured key must be present; only `Inactive` terms are skipped.
    pub fn observe(
        &mut self,
        terms: &LossTermMap,
        batch_size: usize,
    ) -> Result<Vec<usize>, TrainingError> {
        let mut updated = Vec::new();
        for (index, (key, meter)) in self.meters.iter_mut().enumerate() {
            let term = terms.get(key).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "loss module did not report configured term '{}'",
                    key
                ))
            })?;
            if let Some(value) = term.scalar()? {
                meter.update_weighted(value, batch_size as u64);
                updated.push(index);
            }
        }
        Ok(updated)
    }

    pub fn get(&self, key: &str) -> Option<&AverageMeter> {
        self.meters
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, meter)| meter)
    }

    pub fn entry(&self, index: usize) -> Option<(&str, &AverageMeter)> {
        self.meters
            .get(index)
            .map(|(name, meter)| (name.as_str(), meter))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AverageMeter)> {
        self.meters.iter().map(|(name, meter)| (name.as_str(), meter))
    }

    /// Final averages plus the elapsed epoch time.
    pub fn finalize(&self, elapsed: Duration) -> EpochMetrics {
        let mut values: BTreeMap<String, f64> = self
            .meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.avg))
            .collect();
        values.insert(TIME_KEY.to_string(), elapsed.as_secs_f64() / 60.0);
        EpochMetrics { values }
    }
}

/// Metric name to epoch average, including [`TIME_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    values: BTreeMap<String, f64>,
}

impl EpochMetrics {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Epoch wall time in minutes.
    pub fn time(&self) -> f64 {
        self.values.get(TIME_KEY).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Loss averages without the time entry.
    pub fn losses(&self) -> impl Iterator<Item = (&str, f64)> {
        self.iter().filter(|(name, _)| *name != TIME_KEY)
    }

    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.values
    }
}
