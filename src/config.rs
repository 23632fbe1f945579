//! Declarative orchestrator configuration.
//!
//! Parsed from TOML, validated before use, and exportable as JSON Schema for
//! IDE autocomplete. Every field has a documented default, so an empty file
//! (or no file at all) yields a runnable configuration.

use crate::OrchestratorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

/// Default worker pool size.
fn default_workers() -> usize {
    4
}

/// Default FIFO queue bound.
fn default_max_queue_depth() -> usize {
    64
}

/// Default result cache capacity.
fn default_cache_max_entries() -> usize {
    10_000
}

/// Default result cache TTL: 1 hour.
fn default_cache_ttl_s() -> u64 {
    3600
}

/// Default idle window before cancellation tokens are reaped: 5 minutes.
fn default_session_idle_ttl_s() -> u64 {
    300
}

/// Default load-sampling interval: 1 second.
fn default_sample_interval_ms() -> u64 {
    1000
}

/// Default de-escalation dwell: 3 seconds.
fn default_dwell_ms() -> u64 {
    3000
}

/// Default worker-utilization weight in the combined load score.
fn default_worker_weight() -> f64 {
    0.5
}

/// Default queue-utilization weight.
fn default_queue_weight() -> f64 {
    0.3
}

/// Default memory-utilization weight.
fn default_memory_weight() -> f64 {
    0.2
}

/// Combined load above which the breaker goes degraded.
fn default_degraded_threshold() -> f64 {
    0.70
}

/// Combined load above which the breaker goes overloaded.
fn default_overloaded_threshold() -> f64 {
    0.90
}

/// Cost multiplier while degraded.
fn default_degraded_multiplier() -> f64 {
    2.0
}

/// Cost multiplier while overloaded.
fn default_overloaded_multiplier() -> f64 {
    3.0
}

/// Estimated cost at or above which an overloaded breaker rejects.
fn default_expensive_cost_threshold() -> u64 {
    2_000
}

/// Client back-off hint attached to rejections: 5 seconds.
fn default_retry_after_ms() -> u64 {
    5000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one orchestrator instance.
///
/// # Example
///
/// ```toml
/// [pool]
/// workers = 8
/// max_queue_depth = 128
///
/// [breaker]
/// degraded_threshold = 0.75
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Worker pool sizing.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Circuit breaker thresholds and weights.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Result cache sizing and expiry.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Session tracking lifetimes.
    #[serde(default)]
    pub sessions: SessionSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            sessions: SessionSettings::default(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of long-lived workers. The pool never grows or shrinks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// FIFO queue bound; submissions beyond it are shed.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Circuit breaker sampling, scoring, and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerSettings {
    /// Interval between load samples (ms).
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// How long an improved load level must hold before the breaker
    /// de-escalates (ms). Escalation is always immediate.
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
    /// Weight of worker utilization in the combined score.
    #[serde(default = "default_worker_weight")]
    pub worker_weight: f64,
    /// Weight of queue utilization in the combined score.
    #[serde(default = "default_queue_weight")]
    pub queue_weight: f64,
    /// Weight of memory utilization in the combined score.
    #[serde(default = "default_memory_weight")]
    pub memory_weight: f64,
    /// Combined load at or above which the breaker is degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    /// Combined load at or above which the breaker is overloaded.
    #[serde(default = "default_overloaded_threshold")]
    pub overloaded_threshold: f64,
    /// Cost multiplier applied while degraded.
    #[serde(default = "default_degraded_multiplier")]
    pub degraded_multiplier: f64,
    /// Cost multiplier applied while overloaded.
    #[serde(default = "default_overloaded_multiplier")]
    pub overloaded_multiplier: f64,
    /// Estimated cost at or above which an overloaded breaker rejects.
    #[serde(default = "default_expensive_cost_threshold")]
    pub expensive_cost_threshold: u64,
    /// Back-off hint returned with rejections (ms).
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            dwell_ms: default_dwell_ms(),
            worker_weight: default_worker_weight(),
            queue_weight: default_queue_weight(),
            memory_weight: default_memory_weight(),
            degraded_threshold: default_degraded_threshold(),
            overloaded_threshold: default_overloaded_threshold(),
            degraded_multiplier: default_degraded_multiplier(),
            overloaded_multiplier: default_overloaded_multiplier(),
            expensive_cost_threshold: default_expensive_cost_threshold(),
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

impl BreakerSettings {
    /// De-escalation dwell as a [`Duration`].
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    /// Sampling interval as a [`Duration`].
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Rejection back-off hint as a [`Duration`].
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// Result cache sizing and expiry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum cached results before eviction.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Entry time-to-live (seconds).
    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_s: default_cache_ttl_s(),
        }
    }
}

impl CacheSettings {
    /// TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_s)
    }
}

/// Session tracking lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SessionSettings {
    /// Idle window before cancellation tokens are reaped (seconds).
    #[serde(default = "default_session_idle_ttl_s")]
    pub idle_ttl_s: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl_s: default_session_idle_ttl_s(),
        }
    }
}

impl SessionSettings {
    /// Idle TTL as a [`Duration`].
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_s)
    }
}

impl OrchestratorConfig {
    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] on I/O failure, parse failure,
    /// or semantic validation failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Config(format!(
                "cannot read config `{}`: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] on parse or validation failure.
    pub fn from_toml(raw: &str) -> Result<Self, OrchestratorError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| OrchestratorError::Config(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.pool.workers == 0 {
            return Err(OrchestratorError::Config(
                "pool.workers must be at least 1".to_string(),
            ));
        }

        let b = &self.breaker;
        let weight_sum = b.worker_weight + b.queue_weight + b.memory_weight;
        if (weight_sum - 1.0).abs() > 1e-9 {
            return Err(OrchestratorError::Config(format!(
                "breaker weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if !(0.0..=1.0).contains(&b.degraded_threshold)
            || !(0.0..=1.0).contains(&b.overloaded_threshold)
        {
            return Err(OrchestratorError::Config(
                "breaker thresholds must be within [0, 1]".to_string(),
            ));
        }
        if b.degraded_threshold >= b.overloaded_threshold {
            return Err(OrchestratorError::Config(format!(
                "breaker.degraded_threshold ({}) must be below overloaded_threshold ({})",
                b.degraded_threshold, b.overloaded_threshold
            )));
        }
        if b.degraded_multiplier < 1.0 || b.overloaded_multiplier < b.degraded_multiplier {
            return Err(OrchestratorError::Config(
                "breaker multipliers must satisfy 1.0 <= degraded <= overloaded".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(OrchestratorError::Config(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Export the JSON Schema for [`OrchestratorConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
