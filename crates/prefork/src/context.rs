//! Pool configuration and the context the pool is constructed from.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::ConfigError;

/// Remaining number of jobs a permanent worker may serve. Negative means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ttl(i64);

impl Ttl {
    pub const UNLIMITED: Ttl = Ttl(-1);

    pub fn new(jobs: i64) -> Self {
        Self(jobs)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 < 0
    }

    /// The worker must exit now.
    pub fn is_expired(&self) -> bool {
        self.0 == 0
    }

    /// More than one use, or unlimited, is worth a long-lived process.
    pub fn requires_permanent(&self) -> bool {
        self.0 > 1 || self.0 < 0
    }

    /// Count one served job. Unlimited and expired values stay put.
    pub fn decrement(&mut self) {
        if self.0 > 0 {
            self.0 -= 1;
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

impl std::fmt::Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLimits {
    pub max: usize,
}

/// A queue the front end consumes from, as far as pool sizing is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub workers: WorkerLimits,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: WorkerLimits { max: max_workers },
        }
    }
}

fn default_prefork_factor() -> f64 {
    1.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub ttl: Ttl,
    /// Multiplier on the busiest queue's worker limit when pre-forking.
    #[serde(default = "default_prefork_factor")]
    pub prefork_factor: f64,
    /// Kill a worker whose job runs longer than this.
    #[serde(default, with = "duration_secs")]
    pub job_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            ttl: Ttl::UNLIMITED,
            prefork_factor: default_prefork_factor(),
            job_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_prefork_factor(mut self, factor: f64) -> Self {
        self.prefork_factor = factor;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.prefork_factor.is_finite() || self.prefork_factor <= 0.0 {
            return Err(ConfigError::InvalidFactor(self.prefork_factor));
        }
        Ok(())
    }

    /// Overlay `PREFORK_TTL`, `PREFORK_FACTOR` and `PREFORK_JOB_TIMEOUT_SECS`.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn apply_env(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("PREFORK_TTL") {
            let jobs = value.trim().parse::<i64>().map_err(|_| ConfigError::InvalidEnv {
                key: "PREFORK_TTL",
                value: value.clone(),
            })?;
            self.ttl = Ttl::new(jobs);
        }
        if let Some(value) = lookup("PREFORK_FACTOR") {
            self.prefork_factor =
                value.trim().parse::<f64>().map_err(|_| ConfigError::InvalidEnv {
                    key: "PREFORK_FACTOR",
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("PREFORK_JOB_TIMEOUT_SECS") {
            let secs = value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                key: "PREFORK_JOB_TIMEOUT_SECS",
                value: value.clone(),
            })?;
            self.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self.validate()?;
        Ok(self)
    }

    /// `ceil(prefork_factor × max(queue.workers.max))`.
    pub fn target_pool_size(&self) -> usize {
        let busiest = self
            .queues
            .iter()
            .map(|queue| queue.workers.max)
            .max()
            .unwrap_or(0);
        (self.prefork_factor * busiest as f64).ceil() as usize
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) if s == 0.0 => Ok(None),
            Some(s) => Err(serde::de::Error::custom(format!(
                "job_timeout must be a non-negative number of seconds, got {s}"
            ))),
            None => Ok(None),
        }
    }
}

/// Everything the pool needs from its owner at construction.
#[derive(Debug, Clone)]
pub struct PoolContext {
    /// Runtime the pool's event loop is spawned on.
    pub handle: Handle,
    pub config: PoolConfig,
    /// Identity of the queue worker that owns this pool, used in logs.
    pub owner: String,
}

impl PoolContext {
    pub fn new(handle: Handle, config: PoolConfig, owner: impl Into<String>) -> Self {
        Self {
            handle,
            config,
            owner: owner.into(),
        }
    }

    /// Build a context on the runtime the caller is running in.
    pub fn current(config: PoolConfig, owner: impl Into<String>) -> Result<Self, ConfigError> {
        let handle = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        Ok(Self::new(handle, config, owner))
    }
}
