// ABOUTME: Configuration for the daemon connection pool
//
// Defines PoolConfig with every tunable of the pool and its two collaborators:
// - Sizing, acquisition timeout and demand queue limits
// - Per-call timeout and retry policy (CallConfig)
// - Health probe thresholds, trend ratios and history size (HealthConfig)
// All durations are (de)serialised as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid pool configuration: {0}")]
pub struct ConfigError(pub String);

/// Configuration for the connection pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    // === Sizing ===
    /// Sessions opened at initialisation and kept alive afterwards
    pub min_connections: usize,

    /// Hard ceiling on open plus in-flight session creations
    pub max_connections: usize,

    /// Calls served by one session before it is rotated out
    pub max_requests_per_connection: u64,

    /// Prefer the least used healthy session instead of the first available one
    pub load_balancing: bool,

    // === Timeouts ===
    /// How long execute() waits for a session
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Available sessions idle this long are closed while above the minimum
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// Interval between health cycles
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    // === Demand queue ===
    /// Waiters beyond this count back off and retry instead of queueing
    pub max_queue_size: usize,

    /// Sleep between retries when the queue is full
    #[serde(with = "duration_millis")]
    pub queue_backoff: Duration,

    // === Eviction ===
    /// Consecutive unhealthy cycles before a session is evicted
    pub unhealthy_threshold: u32,

    pub call: CallConfig,

    pub health: HealthConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_requests_per_connection: 1000,
            load_balancing: true,

            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300), // 5 minutes
            health_check_interval: Duration::from_secs(5),

            max_queue_size: 100,
            queue_backoff: Duration::from_millis(10),

            unhealthy_threshold: 1,

            call: CallConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections < 1 {
            return Err(invalid("min_connections must be at least 1"));
        }
        if self.max_connections < self.min_connections {
            return Err(invalid(format!(
                "max_connections ({}) must be >= min_connections ({})",
                self.max_connections, self.min_connections
            )));
        }
        if self.max_requests_per_connection < 1 {
            return Err(invalid("max_requests_per_connection must be at least 1"));
        }
        if self.max_queue_size < 1 {
            return Err(invalid("max_queue_size must be at least 1"));
        }
        if self.unhealthy_threshold < 1 {
            return Err(invalid("unhealthy_threshold must be at least 1"));
        }
        non_zero("acquire_timeout", self.acquire_timeout)?;
        non_zero("idle_timeout", self.idle_timeout)?;
        non_zero("health_check_interval", self.health_check_interval)?;

        self.call.validate()?;
        self.health.validate()
    }
}

/// Timeout and retry policy for a single call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Per-attempt response deadline
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Total attempts including the first; only timeouts are retried
    pub max_attempts: u32,

    /// Pause between attempts
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl CallConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(invalid("call.max_attempts must be at least 1"));
        }
        non_zero("call.timeout", self.timeout)
    }
}

/// Health probe and classification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Cheap daemon method used as the probe
    pub probe_method: String,

    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,

    /// At or below this latency a probe is healthy
    #[serde(with = "duration_millis")]
    pub healthy_latency: Duration,

    /// At or below this latency (and above healthy) a probe is degraded
    #[serde(with = "duration_millis")]
    pub degraded_latency: Duration,

    /// Latency samples kept per session
    pub history_size: usize,

    /// Relative latency drop that counts as improving
    pub improving_ratio: f64,

    /// Relative latency rise that counts as degrading
    pub degrading_ratio: f64,

    /// Successful probes slower than degraded_latency times this raise a spike alert
    pub spike_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_method: "ping".to_string(),
            probe_timeout: Duration::from_secs(2),
            healthy_latency: Duration::from_millis(100),
            degraded_latency: Duration::from_millis(500),
            history_size: 50,
            improving_ratio: 0.10,
            degrading_ratio: 0.20,
            spike_factor: 1.5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_method.trim().is_empty() {
            return Err(invalid("health.probe_method must not be empty"));
        }
        non_zero("health.probe_timeout", self.probe_timeout)?;
        if self.healthy_latency > self.degraded_latency {
            return Err(invalid(
                "health.healthy_latency must not exceed health.degraded_latency",
            ));
        }
        if self.history_size < 3 {
            return Err(invalid("health.history_size must be at least 3"));
        }
        if !(self.improving_ratio > 0.0 && self.degrading_ratio > 0.0) {
            return Err(invalid("health trend ratios must be positive"));
        }
        if self.spike_factor < 1.0 {
            return Err(invalid("health.spike_factor must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError(message.into())
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(invalid(format!("{field} must be greater than zero")))
    } else {
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds (u64)
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
