//! Selection strategies, task descriptors and adaptive weighting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::scoring::ScoreBreakdown;
use crate::workers::Worker;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Rotate through eligible workers, ignoring scores.
    RoundRobin,
    /// Most free capacity first.
    LeastLoaded,
    /// Closest capability match (Jaccard overlap).
    CapabilityBased,
    /// Success rate and speed only.
    PerformanceBased,
    /// Weighted sum of all four sub-scores.
    WeightedScore,
    /// Vote across the other strategies, weighted by their track record.
    Adaptive,
}

impl StrategyKind {
    /// Strategies that vote under `Adaptive`.
    pub const VOTERS: [Self; 5] = [
        Self::RoundRobin,
        Self::LeastLoaded,
        Self::CapabilityBased,
        Self::PerformanceBased,
        Self::WeightedScore,
    ];
}

/// A unit of work to place, as handed over by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub id: String,
    pub capabilities: Vec<String>,
    /// Slots the task occupies on its worker.
    pub complexity: u32,
    pub priority: i32,
    /// Preferred workers. A bonus, never a requirement.
    #[serde(default)]
    pub affinity: Vec<String>,
    /// Workers that must not run this task.
    #[serde(default)]
    pub anti_affinity: Vec<String>,
}

impl TaskDescriptor {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            complexity: 1,
            priority: 0,
            affinity: Vec::new(),
            anti_affinity: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_affinity<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affinity = workers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_anti_affinity<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.anti_affinity = workers.into_iter().map(Into::into).collect();
        self
    }
}

/// The chosen worker and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub worker: Worker,
    pub strategy: StrategyKind,
    /// The value the deciding strategy ranked by.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Strategies whose pick was this worker.
    pub voters: Vec<StrategyKind>,
}

/// Success counts per voting strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptiveWeights {
    successes: BTreeMap<StrategyKind, u64>,
    failures: BTreeMap<StrategyKind, u64>,
}

impl AdaptiveWeights {
    pub fn record(&mut self, strategy: StrategyKind, success: bool) {
        if strategy == StrategyKind::Adaptive {
            return;
        }
        let bucket = if success {
            &mut self.successes
        } else {
            &mut self.failures
        };
        let count = bucket.entry(strategy).or_insert(0);
        *count = count.saturating_add(1);
    }

    #[must_use]
    pub fn successes(&self, strategy: StrategyKind) -> u64 {
        self.successes.get(&strategy).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn failures(&self, strategy: StrategyKind) -> u64 {
        self.failures.get(&strategy).copied().unwrap_or(0)
    }

    /// `successes_i / Σ successes`, uniform before any success. Sums to 1.
    #[must_use]
    pub fn weights(&self) -> Vec<(StrategyKind, f64)> {
        let total: u64 = StrategyKind::VOTERS.iter().map(|s| self.successes(*s)).sum();
        StrategyKind::VOTERS
            .iter()
            .map(|s| {
                let weight = if total == 0 {
                    1.0 / StrategyKind::VOTERS.len() as f64
                } else {
                    self.successes(*s) as f64 / total as f64
                };
                (*s, weight)
            })
            .collect()
    }
}
