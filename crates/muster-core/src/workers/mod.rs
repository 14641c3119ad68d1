//! Worker liveness, capacity and performance tracking.

pub mod registry;
pub mod types;

pub use registry::WorkerRegistry;
pub use types::{CapacityRecord, DiscoveryFilter, HealthStatus, HeartbeatMetrics, HeartbeatPayload, Worker, WorkerMetrics};
