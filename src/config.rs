//! # Engine Configuration
//!
//! Configuration for the batch engine with sensible defaults, environment
//! variable overrides (`CONVEYOR_*`), and validation. Absent configuration
//! never crashes the engine: every knob has a default and `run()` operates
//! on a normalized copy.

use crate::backoff::BackoffSchedule;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Tunable knobs for a batch-processing run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum records per batch, both for fetching and sink flush groups
    pub batch_size: usize,
    /// Number of concurrent worker tasks (default: available parallelism)
    pub worker_count: usize,
    /// Maximum concurrently leased sink connections
    pub pool_size: usize,
    /// Fingerprint cache capacity; 0 disables memoization
    pub cache_capacity: usize,
    /// How long a flush waits for a pooled connection before `PoolExhausted`
    pub acquire_timeout: Duration,
    /// Optional bound on partition lock waits; `None` waits indefinitely
    pub lock_timeout: Option<Duration>,
    /// Retries per failed flush group before its records go fatal
    pub max_retries: u32,
    /// Delay schedule between flush retries
    pub retry_backoff: BackoffSchedule,
    /// Dispatch queue bound; `None` derives `2 * worker_count`
    pub dispatch_queue_depth: Option<usize>,
    /// Number of disjoint resource partitions for lock granularity
    pub partition_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            worker_count: num_cpus::get(),
            pool_size: 8,
            cache_capacity: 1024,
            acquire_timeout: Duration::from_secs(5),
            lock_timeout: None,
            max_retries: 3,
            retry_backoff: BackoffSchedule::default(),
            dispatch_queue_depth: None,
            partition_count: 64,
        }
    }
}

impl EngineConfig {
    /// Load defaults with `CONVEYOR_*` environment overrides applied
    ///
    /// Unset variables keep their defaults; a set-but-unparsable variable is
    /// an [`EngineError::Configuration`], never a panic.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(value) = parse_env::<usize>("CONVEYOR_BATCH_SIZE")? {
            config.batch_size = value;
        }
        if let Some(value) = parse_env::<usize>("CONVEYOR_WORKER_COUNT")? {
            config.worker_count = value;
        }
        if let Some(value) = parse_env::<usize>("CONVEYOR_POOL_SIZE")? {
            config.pool_size = value;
        }
        if let Some(value) = parse_env::<usize>("CONVEYOR_CACHE_CAPACITY")? {
            config.cache_capacity = value;
        }
        if let Some(ms) = parse_env::<u64>("CONVEYOR_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("CONVEYOR_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(value) = parse_env::<u32>("CONVEYOR_MAX_RETRIES")? {
            config.max_retries = value;
        }
        if let Some(ms) = parse_env::<u64>("CONVEYOR_RETRY_BASE_MS")? {
            config.retry_backoff.base = Duration::from_millis(ms);
        }
        if let Some(value) = parse_env::<f64>("CONVEYOR_RETRY_MULTIPLIER")? {
            config.retry_backoff.multiplier = value;
        }
        if let Some(ms) = parse_env::<u64>("CONVEYOR_RETRY_MAX_MS")? {
            config.retry_backoff.max = Duration::from_millis(ms);
        }
        if let Some(value) = parse_env::<bool>("CONVEYOR_RETRY_JITTER")? {
            config.retry_backoff.jitter_enabled = value;
        }
        if let Some(value) = parse_env::<usize>("CONVEYOR_QUEUE_DEPTH")? {
            config.dispatch_queue_depth = Some(value);
        }
        if let Some(value) = parse_env::<u32>("CONVEYOR_PARTITION_COUNT")? {
            config.partition_count = value;
        }

        Ok(config)
    }

    /// Resolve derived defaults into concrete values
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.worker_count == 0 {
            config.worker_count = num_cpus::get();
        }
        if config.dispatch_queue_depth.is_none() {
            config.dispatch_queue_depth = Some(config.worker_count * 2);
        }
        config
    }

    /// Resolved dispatch queue bound (after [`normalized`](Self::normalized))
    pub fn queue_depth(&self) -> usize {
        self.dispatch_queue_depth
            .unwrap_or(self.worker_count.max(1) * 2)
    }

    /// Validate configuration values
    ///
    /// Hard-invalid values are rejected; degenerate-but-legal settings only
    /// log a warning.
    pub fn validate(&self) -> EngineResult<()> {
        if self.batch_size == 0 {
            return Err(EngineError::configuration("batch_size must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(EngineError::configuration(
                "worker_count must be at least 1 (use normalized() to derive from host parallelism)",
            ));
        }
        if self.pool_size == 0 {
            return Err(EngineError::configuration("pool_size must be at least 1"));
        }
        if self.partition_count == 0 {
            return Err(EngineError::configuration(
                "partition_count must be at least 1",
            ));
        }
        if self.retry_backoff.multiplier < 1.0 {
            return Err(EngineError::configuration(
                "retry_backoff.multiplier must be >= 1.0",
            ));
        }

        if self.cache_capacity == 0 {
            warn!("cache_capacity is 0 - memoization effectively disabled");
        }
        if self.max_retries == 0 {
            warn!("max_retries is 0 - a single sink failure marks a whole batch fatal");
        }
        if self.partition_count == 1 {
            warn!("partition_count is 1 - partition locking degenerates to a global lock");
        }
        if self.acquire_timeout.is_zero() {
            warn!("acquire_timeout is 0 - connection waits fail immediately when the pool is busy");
        }

        Ok(())
    }
}

/// Parse an optional environment variable, surfacing bad values as errors
fn parse_env<T: std::str::FromStr>(name: &str) -> EngineResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::configuration(format!("invalid value for {name}: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
