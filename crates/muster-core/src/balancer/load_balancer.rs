//! Capacity-aware worker selection.

use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use itertools::Itertools;

use super::{
    overload::{self, OverloadReport},
    scoring::{jaccard, score, ScoreBreakdown},
    strategy::{AdaptiveWeights, Selection, StrategyKind, TaskDescriptor},
};
use crate::{config::BalancerConfig, workers::Worker, Error, Result};

/// One slot of a planned queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAssignment {
    pub task: TaskDescriptor,
    /// `None` when no worker could take the task at that point of the plan.
    pub worker_id: Option<String>,
    pub score: Option<f64>,
}

/// Picks workers for tasks.
///
/// Round-robin position and adaptive statistics are shared between clones.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    config: BalancerConfig,
    next: Arc<AtomicUsize>,
    adaptive: Arc<Mutex<AdaptiveWeights>>,
}

type Scored<'a> = (&'a Worker, ScoreBreakdown);

impl LoadBalancer {
    /// # Errors
    ///
    /// `InvalidConfig` if `config` does not validate.
    pub fn new(config: BalancerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            next: Arc::new(AtomicUsize::new(0)),
            adaptive: Arc::new(Mutex::new(AdaptiveWeights::default())),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Select with the configured strategy.
    ///
    /// # Errors
    ///
    /// - `NoCapableWorker` if no allowed worker offers the task's capabilities.
    /// - `CapacityExceeded` if capable workers exist but none has room.
    pub fn select_worker(&self, task: &TaskDescriptor, workers: &[Worker]) -> Result<Selection> {
        self.select_with(self.config.strategy, task, workers)
    }

    /// Select with an explicit strategy.
    ///
    /// # Errors
    ///
    /// As [`select_worker`](Self::select_worker).
    pub fn select_with(&self, strategy: StrategyKind, task: &TaskDescriptor, workers: &[Worker]) -> Result<Selection> {
        let candidates = self.eligible(task, workers)?;
        let scored: Vec<Scored<'_>> = candidates
            .into_iter()
            .map(|w| (w, score(w, task, &self.config)))
            .collect();

        let selection = if strategy == StrategyKind::Adaptive {
            self.vote(task, &scored)
        } else {
            let i = self.pick(strategy, task, &scored);
            let (worker, breakdown) = scored[i];
            Selection {
                worker: worker.clone(),
                strategy,
                score: metric(strategy, task, worker, &breakdown),
                breakdown,
                voters: vec![strategy],
            }
        };

        tracing::debug!(
            task_id = %task.id,
            worker_id = %selection.worker.id,
            strategy = %strategy,
            score = selection.score,
            candidates = scored.len(),
            "Worker selected"
        );
        Ok(selection)
    }

    /// Filters in order: anti-affinity, capabilities, capacity.
    fn eligible<'a>(&self, task: &TaskDescriptor, workers: &'a [Worker]) -> Result<Vec<&'a Worker>> {
        let capable: Vec<&Worker> = workers
            .iter()
            .filter(|w| !task.anti_affinity.contains(&w.id))
            .filter(|w| w.has_capabilities(&task.capabilities))
            .collect();
        if capable.is_empty() {
            return Err(Error::NoCapableWorker {
                capabilities: task.capabilities.clone(),
            });
        }

        let roomy: Vec<&Worker> = capable
            .into_iter()
            .filter(|w| w.available_capacity() >= task.complexity)
            .collect();
        if roomy.is_empty() {
            return Err(Error::CapacityExceeded {
                required: task.complexity,
            });
        }
        Ok(roomy)
    }

    /// Index of `strategy`'s pick. `scored` is never empty.
    fn pick(&self, strategy: StrategyKind, task: &TaskDescriptor, scored: &[Scored<'_>]) -> usize {
        if strategy == StrategyKind::RoundRobin {
            return self.next.fetch_add(1, Ordering::Relaxed) % scored.len();
        }
        scored
            .iter()
            .position_max_by(|(a, sa), (b, sb)| {
                metric(strategy, task, a, sa)
                    .total_cmp(&metric(strategy, task, b, sb))
                    .then_with(|| rank(a, sa, b, sb))
            })
            .unwrap_or(0)
    }

    /// Every voter picks; the worker with the most weighted votes wins.
    fn vote(&self, task: &TaskDescriptor, scored: &[Scored<'_>]) -> Selection {
        let weights = self.adaptive_weights();
        let mut votes = vec![0.0_f64; scored.len()];
        let mut voters: Vec<Vec<StrategyKind>> = vec![Vec::new(); scored.len()];
        for (strategy, weight) in weights {
            let i = self.pick(strategy, task, scored);
            votes[i] += weight;
            voters[i].push(strategy);
        }

        let winner = (0..scored.len())
            .position_max_by(|&a, &b| {
                votes[a]
                    .total_cmp(&votes[b])
                    .then_with(|| rank(scored[a].0, &scored[a].1, scored[b].0, &scored[b].1))
            })
            .unwrap_or(0);

        let (worker, breakdown) = scored[winner];
        Selection {
            worker: worker.clone(),
            strategy: StrategyKind::Adaptive,
            score: votes[winner],
            breakdown,
            voters: std::mem::take(&mut voters[winner]),
        }
    }

    /// Feed the outcome of a placed task back into the adaptive weights.
    pub fn record_outcome(&self, selection: &Selection, success: bool) {
        let mut adaptive = self.adaptive.lock().unwrap_or_else(PoisonError::into_inner);
        for strategy in &selection.voters {
            adaptive.record(*strategy, success);
        }
    }

    /// Current adaptive weights; they sum to 1.
    pub fn adaptive_weights(&self) -> Vec<(StrategyKind, f64)> {
        self.adaptive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .weights()
    }

    /// Flag overloaded and underutilized workers and suggest migrations.
    #[must_use]
    pub fn detect_overload(&self, workers: &[Worker]) -> OverloadReport {
        overload::detect(workers, &self.config)
    }

    /// Order `tasks` by descending priority and pre-assign a worker to each.
    ///
    /// Load is simulated on copies; `workers` is not touched. Balancers set to
    /// `RoundRobin` or `Adaptive` plan with `WeightedScore` so planning does not
    /// consume rotation or voting state.
    pub fn reorder_queue(&self, tasks: &[TaskDescriptor], workers: &[Worker]) -> Vec<PlannedAssignment> {
        let strategy = match self.config.strategy {
            StrategyKind::RoundRobin | StrategyKind::Adaptive => StrategyKind::WeightedScore,
            other => other,
        };
        let mut simulated: Vec<Worker> = workers.to_vec();

        tasks
            .iter()
            .sorted_by(|a, b| b.priority.cmp(&a.priority))
            .map(|task| {
                let chosen = self.eligible(task, &simulated).ok().map(|candidates| {
                    let scored: Vec<Scored<'_>> = candidates
                        .into_iter()
                        .map(|w| (w, score(w, task, &self.config)))
                        .collect();
                    let (worker, breakdown) = scored[self.pick(strategy, task, &scored)];
                    (worker.id.clone(), metric(strategy, task, worker, &breakdown))
                });

                if let Some((id, _)) = &chosen {
                    if let Some(w) = simulated.iter_mut().find(|w| &w.id == id) {
                        w.current_load = w.current_load.saturating_add(task.complexity).min(w.max_concurrency);
                    }
                }

                PlannedAssignment {
                    task: task.clone(),
                    score: chosen.as_ref().map(|(_, s)| *s),
                    worker_id: chosen.map(|(id, _)| id),
                }
            })
            .collect()
    }
}

/// Value `strategy` ranks workers by.
fn metric(strategy: StrategyKind, task: &TaskDescriptor, worker: &Worker, breakdown: &ScoreBreakdown) -> f64 {
    match strategy {
        StrategyKind::LeastLoaded => breakdown.capacity,
        StrategyKind::CapabilityBased => jaccard(&task.capabilities, &worker.capabilities),
        StrategyKind::PerformanceBased => (breakdown.performance + breakdown.reliability) / 2.0,
        StrategyKind::RoundRobin | StrategyKind::WeightedScore | StrategyKind::Adaptive => breakdown.total,
    }
}

/// Tie-break: higher overall score, then lower id.
fn rank(a: &Worker, sa: &ScoreBreakdown, b: &Worker, sb: &ScoreBreakdown) -> CmpOrdering {
    sa.total.total_cmp(&sb.total).then_with(|| b.id.cmp(&a.id))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::workers::{HealthStatus, WorkerMetrics};

    fn worker(id: &str, load: u32, max: u32, caps: &[&str]) -> Worker {
        Worker {
            id: id.into(),
            node_id: "n".into(),
            capabilities: caps.iter().map(ToString::to_string).collect(),
            max_concurrency: max,
            current_load: load,
            health_status: HealthStatus::Healthy,
            last_heartbeat_at: Utc::now(),
            registered_at: Utc::now(),
            metrics: WorkerMetrics::default(),
        }
    }

    fn balancer(strategy: StrategyKind) -> Result<LoadBalancer> {
        LoadBalancer::new(BalancerConfig {
            strategy,
            ..BalancerConfig::default()
        })
    }

    #[test]
    fn test_least_loaded_prefers_free_worker() -> Result<()> {
        let lb = balancer(StrategyKind::LeastLoaded)?;
        let workers = vec![worker("busy", 8, 10, &["rust"]), worker("idle", 2, 10, &["rust"])];
        let task = TaskDescriptor::new("t").with_capabilities(["rust"]);
        assert_eq!(lb.select_worker(&task, &workers)?.worker.id, "idle");
        Ok(())
    }

    #[test]
    fn test_anti_affinity_is_hard_affinity_is_soft() -> Result<()> {
        let lb = balancer(StrategyKind::WeightedScore)?;
        let workers = vec![worker("a", 0, 10, &["rust"]), worker("b", 5, 10, &["rust"])];

        let avoid_a = TaskDescriptor::new("t").with_anti_affinity(["a"]);
        assert_eq!(lb.select_worker(&avoid_a, &workers)?.worker.id, "b");

        // b's affinity bonus (+0.1) does not beat a's free capacity (+0.2).
        let prefer_b = TaskDescriptor::new("t").with_affinity(["b"]);
        assert_eq!(lb.select_worker(&prefer_b, &workers)?.worker.id, "a");
        Ok(())
    }

    #[test]
    fn test_no_capable_vs_capacity_exceeded() -> Result<()> {
        let lb = balancer(StrategyKind::WeightedScore)?;
        let workers = vec![worker("a", 9, 10, &["rust"])];

        let gpu = TaskDescriptor::new("t").with_capabilities(["gpu"]);
        assert!(matches!(lb.select_worker(&gpu, &workers), Err(Error::NoCapableWorker { .. })));

        let heavy = TaskDescriptor::new("t").with_capabilities(["rust"]).with_complexity(2);
        assert_eq!(
            lb.select_worker(&heavy, &workers),
            Err(Error::CapacityExceeded { required: 2 })
        );
        Ok(())
    }

    #[test]
    fn test_round_robin_rotates() -> Result<()> {
        let lb = balancer(StrategyKind::RoundRobin)?;
        let workers = vec![worker("a", 0, 4, &[]), worker("b", 0, 4, &[]), worker("c", 0, 4, &[])];
        let task = TaskDescriptor::new("t");
        let picks: Vec<String> = (0..4)
            .map(|_| lb.select_worker(&task, &workers).map(|s| s.worker.id))
            .collect::<Result<_>>()?;
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
        Ok(())
    }

    #[test]
    fn test_capability_based_prefers_specialist() -> Result<()> {
        let lb = balancer(StrategyKind::CapabilityBased)?;
        let workers = vec![
            worker("generalist", 0, 10, &["rust", "gpu", "python"]),
            worker("specialist", 5, 10, &["rust"]),
        ];
        let task = TaskDescriptor::new("t").with_capabilities(["rust"]);
        assert_eq!(lb.select_worker(&task, &workers)?.worker.id, "specialist");
        Ok(())
    }

    #[test]
    fn test_performance_based_uses_history() -> Result<()> {
        let lb = balancer(StrategyKind::PerformanceBased)?;
        let mut flaky = worker("flaky", 0, 10, &[]);
        flaky.metrics.tasks_completed = 1;
        flaky.metrics.tasks_failed = 3;
        let mut steady = worker("steady", 9, 10, &[]);
        steady.metrics.tasks_completed = 10;
        let workers = vec![flaky, steady];
        assert_eq!(lb.select_worker(&TaskDescriptor::new("t"), &workers)?.worker.id, "steady");
        Ok(())
    }

    #[test]
    fn test_adaptive_weights_sum_to_one_after_outcomes() -> Result<()> {
        let lb = balancer(StrategyKind::Adaptive)?;
        let workers = vec![worker("a", 1, 10, &["rust"]), worker("b", 6, 10, &["rust"])];
        let task = TaskDescriptor::new("t").with_capabilities(["rust"]);

        for round in 0..6 {
            let selection = lb.select_worker(&task, &workers)?;
            assert_eq!(selection.strategy, StrategyKind::Adaptive);
            assert!(!selection.voters.is_empty());
            lb.record_outcome(&selection, round % 3 != 0);
            let total: f64 = lb.adaptive_weights().iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_reorder_queue_simulates_load() -> Result<()> {
        let lb = balancer(StrategyKind::LeastLoaded)?;
        let workers = vec![worker("a", 0, 2, &["rust"]), worker("b", 1, 2, &["rust"])];
        let tasks = vec![
            TaskDescriptor::new("low").with_capabilities(["rust"]).with_priority(1),
            TaskDescriptor::new("high").with_capabilities(["rust"]).with_priority(9),
            TaskDescriptor::new("mid").with_capabilities(["rust"]).with_priority(5),
            TaskDescriptor::new("overflow").with_capabilities(["rust"]).with_priority(0),
        ];

        let plan = lb.reorder_queue(&tasks, &workers);
        let order: Vec<&str> = plan.iter().map(|p| p.task.id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low", "overflow"]);

        let assigned: Vec<Option<&str>> = plan.iter().map(|p| p.worker_id.as_deref()).collect();
        assert_eq!(assigned, vec![Some("a"), Some("a"), Some("b"), None]);
        // Real load untouched.
        assert_eq!(workers[0].current_load, 0);
        Ok(())
    }
}
