//! Overload detection and advisory migrations.

use serde::{Deserialize, Serialize};

use crate::{config::BalancerConfig, workers::Worker};

/// A worker outside the healthy load band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFlag {
    pub worker_id: String,
    pub load_ratio: f64,
    /// Distance from the threshold that flagged it.
    pub deviation: f64,
}

/// Suggested move of work from an overloaded to an underutilized worker.
///
/// Advisory only: nothing is moved by the balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecommendation {
    pub from_worker_id: String,
    pub to_worker_id: String,
    pub tasks_to_move: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverloadReport {
    /// Most overloaded first.
    pub overloaded: Vec<LoadFlag>,
    /// Most idle first.
    pub underutilized: Vec<LoadFlag>,
    pub recommendations: Vec<MigrationRecommendation>,
}

impl OverloadReport {
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty()
    }
}

/// Flag workers above `overload_threshold` and below `underutilized_threshold`,
/// then pair each overloaded worker with the most idle compatible one.
///
/// A target is compatible when it offers every capability the source offers,
/// and it is used for at most one recommendation.
#[must_use]
pub fn detect(workers: &[Worker], config: &BalancerConfig) -> OverloadReport {
    let mut overloaded: Vec<(&Worker, LoadFlag)> = workers
        .iter()
        .filter(|w| w.load_ratio() > config.overload_threshold)
        .map(|w| (w, flag(w, w.load_ratio() - config.overload_threshold)))
        .collect();
    let mut underutilized: Vec<(&Worker, LoadFlag)> = workers
        .iter()
        .filter(|w| w.load_ratio() < config.underutilized_threshold)
        .map(|w| (w, flag(w, config.underutilized_threshold - w.load_ratio())))
        .collect();

    overloaded.sort_by(|a, b| b.1.deviation.total_cmp(&a.1.deviation).then_with(|| a.1.worker_id.cmp(&b.1.worker_id)));
    underutilized.sort_by(|a, b| b.1.deviation.total_cmp(&a.1.deviation).then_with(|| a.1.worker_id.cmp(&b.1.worker_id)));

    let mut used = vec![false; underutilized.len()];
    let mut recommendations = Vec::new();
    for (source, _) in &overloaded {
        let target = underutilized
            .iter()
            .enumerate()
            .find(|(i, (candidate, _))| !used[*i] && source.capabilities.is_subset(&candidate.capabilities));
        if let Some((i, (target, _))) = target {
            used[i] = true;
            recommendations.push(MigrationRecommendation {
                from_worker_id: source.id.clone(),
                to_worker_id: target.id.clone(),
                tasks_to_move: tasks_to_move(source, target, config.overload_threshold),
            });
        }
    }

    OverloadReport {
        overloaded: overloaded.into_iter().map(|(_, f)| f).collect(),
        underutilized: underutilized.into_iter().map(|(_, f)| f).collect(),
        recommendations,
    }
}

fn flag(worker: &Worker, deviation: f64) -> LoadFlag {
    LoadFlag {
        worker_id: worker.id.clone(),
        load_ratio: worker.load_ratio(),
        deviation,
    }
}

/// Enough tasks to bring `source` back to the threshold without pushing
/// `target` over it; at least one.
fn tasks_to_move(source: &Worker, target: &Worker, threshold: f64) -> u32 {
    let excess = source.current_load.saturating_sub(slots_at(source.max_concurrency, threshold));
    let room = slots_at(target.max_concurrency, threshold).saturating_sub(target.current_load);
    excess.min(room).max(1)
}

/// Whole task slots at `ratio` of `max`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn slots_at(max: u32, ratio: f64) -> u32 {
    (f64::from(max) * ratio).floor().clamp(0.0, f64::from(max)) as u32
}
