//! Shared memory: vector-clocked entries, batched sync, subscriptions.

pub mod cache;
pub mod entry;
pub mod keys;
pub mod manager;
pub mod pattern;
pub mod resolver;
pub mod subscription;

pub use cache::{CacheStats, EntryCache};
pub use entry::MemoryEntry;
pub use manager::{FlushReport, MemoryStats, MemorySyncManager};
pub use pattern::KeyPattern;
pub use resolver::{ArrayMerge, ConflictResolver, LastWriteWins, MaxValue, ObjectMerge, Resolution, ResolverKind};
pub use subscription::{ChangeEvent, ChangeKind, ChannelListener, MemoryEvent, MemoryListener, SubscriptionId};
