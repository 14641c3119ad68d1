//! # Muster Core
//!
//! Coordination primitives for a pool of workers sharing one backing store:
//!
//! - [`LockManager`]: exclusive, heartbeated leases over named resources.
//! - [`WorkerRegistry`]: liveness, capacity and performance per worker.
//! - [`LoadBalancer`]: task placement and overload detection.
//! - [`MemorySyncManager`]: batched, vector-clocked key/value replication.
//!
//! [`CoordinationCore`] builds all four from one [`CoreConfig`].
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` / `expect()` / `panic!()` outside tests
//! - No `unsafe`
//!
//! All fallible operations return [`Result<T, Error>`](Result).

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used, clippy::panic))]
#![forbid(unsafe_code)]

pub mod balancer;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod core;
mod error;
pub mod memory;
pub mod store;
pub mod taskregistry;
pub mod telemetry;
pub mod vector_clock;
pub mod workers;

pub use balancer::{LoadBalancer, Selection, StrategyKind, TaskDescriptor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use coordination::{AcquireOptions, AcquireStrategy, Lock, LockManager, LockOwner, LockResult, LockStatus};
pub use self::core::CoordinationCore;
pub use error::{Error, Result};
pub use memory::{MemoryEntry, MemoryListener, MemorySyncManager, ResolverKind};
pub use store::{AssignmentStore, MemoryBackend};
pub use taskregistry::TaskRegistry;
pub use vector_clock::{ClockOrdering, VectorClock};
pub use workers::{HealthStatus, Worker, WorkerRegistry};
