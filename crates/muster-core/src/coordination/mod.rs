//! Distributed mutual exclusion.
//!
//! A [`LockManager`] turns the create-if-absent / compare-and-delete
//! primitives of an [`AssignmentStore`](crate::store::AssignmentStore) into
//! exclusive, heartbeated ownership of named resources.

pub mod backoff;
mod heartbeat;
pub mod locks;
pub mod types;

pub use backoff::{backoff_delay, RetryPolicy};
pub use locks::LockManager;
pub use types::{AcquireOptions, AcquireStrategy, Lock, LockOwner, LockResult, LockStatus, StaleFallback};
