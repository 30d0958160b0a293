//! Sample statistics with an associative merge

use crate::types::ValueRange;
use serde::{Deserialize, Serialize};

/// Running statistics over sample values.
///
/// `merge` is commutative; it is exactly associative for counts and extrema,
/// and sums are reduced in plan order by the coordinator so the final result
/// does not depend on chunk completion order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: u64,
    pub non_finite: u64,
    pub sum: f64,
    pub sum_squares: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for SampleStats {
    fn default() -> Self {
        Self {
            count: 0,
            non_finite: 0,
            sum: 0.0,
            sum_squares: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl SampleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            self.non_finite += 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for v in values {
            self.push(v);
        }
    }

    /// Combine two partial results
    pub fn merge(self, other: SampleStats) -> SampleStats {
        SampleStats {
            count: self.count + other.count,
            non_finite: self.non_finite + other.non_finite,
            sum: self.sum + other.sum,
            sum_squares: self.sum_squares + other.sum_squares,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population standard deviation
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = (self.sum_squares / self.count as f64 - mean * mean).max(0.0);
        Some(variance.sqrt())
    }

    pub fn rms(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.sum_squares / self.count as f64).sqrt())
    }

    pub fn value_range(&self) -> Option<ValueRange> {
        (self.count > 0).then(|| ValueRange::new(self.min, self.max))
    }

    /// Persistable summary
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            count: self.count,
            non_finite: self.non_finite,
            min: self.value_range().map(|r| r.min),
            max: self.value_range().map(|r| r.max),
            mean: self.mean(),
            std: self.std(),
            rms: self.rms(),
        }
    }
}

/// Statistics as written to the store descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub count: u64,
    pub non_finite: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub rms: Option<f64>,
}
