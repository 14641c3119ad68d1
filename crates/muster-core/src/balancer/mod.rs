//! Load balancing across registered workers.
//!
//! Selection runs three filters (anti-affinity, capabilities, capacity) and
//! then ranks what is left with a [`StrategyKind`]. Overload detection and
//! queue planning are advisory: they never mutate worker state.

pub mod load_balancer;
pub mod overload;
pub mod scoring;
pub mod strategy;

pub use load_balancer::{LoadBalancer, PlannedAssignment};
pub use overload::{LoadFlag, MigrationRecommendation, OverloadReport};
pub use scoring::{ScoreBreakdown, ScoringWeights};
pub use strategy::{AdaptiveWeights, Selection, StrategyKind, TaskDescriptor};
