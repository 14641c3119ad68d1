//! Four-factor worker scoring.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::strategy::TaskDescriptor;
use crate::{config::BalancerConfig, workers::Worker, Error, Result};

/// Weights of the four sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub capacity: f64,
    pub performance: f64,
    pub affinity: f64,
    pub reliability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capacity: 0.4,
            performance: 0.3,
            affinity: 0.2,
            reliability: 0.1,
        }
    }
}

impl ScoringWeights {
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.capacity + self.performance + self.affinity + self.reliability
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.capacity, self.performance, self.affinity, self.reliability];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::invalid_config(
                "balancer.weights must be finite and non-negative",
            ));
        }
        if self.sum() <= 0.0 {
            return Err(Error::invalid_config("balancer.weights must not all be zero"));
        }
        Ok(())
    }
}

/// Sub-scores in `[0, 1]` and their weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub capacity: f64,
    pub performance: f64,
    pub affinity: f64,
    pub reliability: f64,
    pub total: f64,
}

/// Score `worker` for `task`.
#[must_use]
pub fn score(worker: &Worker, task: &TaskDescriptor, config: &BalancerConfig) -> ScoreBreakdown {
    let capacity = if worker.max_concurrency == 0 {
        0.0
    } else {
        f64::from(worker.available_capacity()) / f64::from(worker.max_concurrency)
    };
    let performance = worker.metrics.success_rate();
    let affinity = if task.affinity.iter().any(|id| *id == worker.id) {
        1.0
    } else {
        config.affinity_baseline
    };
    let normalized = worker.metrics.average_task_duration_ms.max(0.0) / config.reference_task_duration_ms as f64;
    let reliability = 1.0 / (1.0 + normalized);

    let w = &config.weights;
    ScoreBreakdown {
        capacity,
        performance,
        affinity,
        reliability,
        total: w.capacity * capacity + w.performance * performance + w.affinity * affinity + w.reliability * reliability,
    }
}

/// `|required ∩ offered| / |required ∪ offered|`; `1.0` when both are empty.
#[must_use]
pub fn jaccard(required: &[String], offered: &BTreeSet<String>) -> f64 {
    let required: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let offered: BTreeSet<&str> = offered.iter().map(String::as_str).collect();
    let union = required.union(&offered).count();
    if union == 0 {
        return 1.0;
    }
    required.intersection(&offered).count() as f64 / union as f64
}
