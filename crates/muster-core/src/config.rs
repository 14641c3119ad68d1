//! Component configuration.
//!
//! Every recognised option is an explicit field with a default. Components
//! call `validate()` in their constructors, so a bad value fails at startup
//! rather than in the middle of a lock dance.
//!
//! # Example Config
//!
//! ```toml
//! root = "muster"
//!
//! [lock]
//! stale_threshold_ms = 120000
//! stale_fallback = "retry"
//!
//! [balancer]
//! strategy = "adaptive"
//!
//! [balancer.weights]
//! capacity = 0.5
//! performance = 0.3
//! affinity = 0.2
//! reliability = 0.0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    balancer::{ScoringWeights, StrategyKind},
    coordination::StaleFallback,
    memory::ResolverKind,
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// TOP LEVEL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Prefix of every memory key (`{root}/tasks/...`).
    pub root: String,
    pub logging: LoggingConfig,
    pub lock: LockConfig,
    pub registry: RegistryConfig,
    pub balancer: BalancerConfig,
    pub memory: MemoryConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            root: "muster".to_string(),
            logging: LoggingConfig::default(),
            lock: LockConfig::default(),
            registry: RegistryConfig::default(),
            balancer: BalancerConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.trim().is_empty() {
            return Err(Error::invalid_config("root cannot be empty"));
        }
        if self.root.ends_with('/') {
            return Err(Error::invalid_config("root must not end with '/'"));
        }
        self.lock.validate()?;
        self.registry.validate()?;
        self.balancer.validate()?;
        self.memory.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCK MANAGER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub heartbeat_interval_ms: u64,
    /// Delay before retrying a failed heartbeat.
    pub heartbeat_retry_ms: u64,
    pub stale_threshold_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// What `StealStale` does when the current holder is still live.
    pub stale_fallback: StaleFallback,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_retry_ms: 1_000,
            stale_threshold_ms: 300_000,
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 16_000,
            stale_fallback: StaleFallback::FailFast,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::invalid_config("lock.heartbeat_interval_ms must be > 0"));
        }
        if self.heartbeat_retry_ms == 0 {
            return Err(Error::invalid_config("lock.heartbeat_retry_ms must be > 0"));
        }
        if self.stale_threshold_ms == 0 {
            return Err(Error::invalid_config("lock.stale_threshold_ms must be > 0"));
        }
        if self.heartbeat_interval_ms >= self.stale_threshold_ms {
            return Err(Error::invalid_config(
                "lock.heartbeat_interval_ms must be shorter than lock.stale_threshold_ms",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::invalid_config(
                "lock.initial_backoff_ms cannot exceed lock.max_backoff_ms",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_retry(&self) -> Duration {
        Duration::from_millis(self.heartbeat_retry_ms)
    }

    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeats younger than this are `Healthy`.
    pub healthy_threshold_ms: u64,
    /// Heartbeats at least this old are `Unhealthy` and swept.
    pub unhealthy_threshold_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            healthy_threshold_ms: 600_000,
            unhealthy_threshold_ms: 900_000,
            sweep_interval_ms: 300_000,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.healthy_threshold_ms == 0 {
            return Err(Error::invalid_config("registry.healthy_threshold_ms must be > 0"));
        }
        if self.healthy_threshold_ms >= self.unhealthy_threshold_ms {
            return Err(Error::invalid_config(
                "registry.healthy_threshold_ms must be below registry.unhealthy_threshold_ms",
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::invalid_config("registry.sweep_interval_ms must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOAD BALANCER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: StrategyKind,
    pub weights: ScoringWeights,
    /// Affinity sub-score for workers not named in `task.affinity`.
    pub affinity_baseline: f64,
    /// Average duration that maps to a reliability of 0.5.
    pub reference_task_duration_ms: u64,
    pub overload_threshold: f64,
    pub underutilized_threshold: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::WeightedScore,
            weights: ScoringWeights::default(),
            affinity_baseline: 0.5,
            reference_task_duration_ms: 60_000,
            overload_threshold: 0.8,
            underutilized_threshold: 0.3,
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.affinity_baseline) {
            return Err(Error::invalid_config(
                "balancer.affinity_baseline must be within [0, 1]",
            ));
        }
        if self.reference_task_duration_ms == 0 {
            return Err(Error::invalid_config(
                "balancer.reference_task_duration_ms must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.overload_threshold)
            || !(0.0..=1.0).contains(&self.underutilized_threshold)
        {
            return Err(Error::invalid_config(
                "balancer load thresholds must be within [0, 1]",
            ));
        }
        if self.underutilized_threshold >= self.overload_threshold {
            return Err(Error::invalid_config(
                "balancer.underutilized_threshold must be below balancer.overload_threshold",
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY SYNC
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub batch_interval_ms: u64,
    /// How often the backend is scanned for entries written by other processes.
    pub remote_poll_interval_ms: u64,
    /// Buffered writes that force an early flush.
    pub max_batch_size: usize,
    pub cache_capacity: usize,
    /// Pending subscription notifications before new ones are dropped.
    pub notification_capacity: usize,
    pub resolver: ResolverKind,
    pub backend_retries: u32,
    pub backend_backoff_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 100,
            remote_poll_interval_ms: 1_000,
            max_batch_size: 100,
            cache_capacity: 1_000,
            notification_capacity: 1_024,
            resolver: ResolverKind::LastWriteWins,
            backend_retries: 3,
            backend_backoff_ms: 50,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_interval_ms == 0 {
            return Err(Error::invalid_config("memory.batch_interval_ms must be > 0"));
        }
        if self.remote_poll_interval_ms == 0 {
            return Err(Error::invalid_config("memory.remote_poll_interval_ms must be > 0"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::invalid_config("memory.max_batch_size must be > 0"));
        }
        if self.cache_capacity == 0 {
            return Err(Error::invalid_config("memory.cache_capacity must be > 0"));
        }
        if self.notification_capacity == 0 {
            return Err(Error::invalid_config(
                "memory.notification_capacity must be > 0",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    #[must_use]
    pub const fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.remote_poll_interval_ms)
    }

    #[must_use]
    pub const fn backend_backoff(&self) -> Duration {
        Duration::from_millis(self.backend_backoff_ms)
    }
}
