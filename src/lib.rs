//! # exponent-orchestrator
//!
//! Computation orchestration and admission control for a channel
//! error-exponent calculator.
//!
//! The numerics themselves live in an opaque native engine (a pure,
//! blocking, uninterruptible function from channel parameters to
//! `{error_probability, error_exponent, optimal_rho, mutual_information,
//! cutoff_rate, critical_rate}`). This crate is the layer that turns those
//! unpredictable, CPU-bound calls into a safe service core:
//!
//! - [`params`] — parameter sets, validation, content fingerprints
//! - [`cost`] — bounded cost estimation for admission and billing
//! - [`breaker`] — load-sampling circuit breaker with hysteresis
//! - [`cancel`] — session-scoped cooperative cancellation
//! - [`pool`] — fixed-size worker pool with batched dispatch
//! - [`store`] — result cache collaborator interface
//! - [`orchestrator`] — cache-first, deduplicated single/batch entry points
//! - [`sweep`] — 1-D and 2-D sweep operations on top of batches
//!
//! ## Architecture
//!
//! ```text
//! API boundary → cost + admission → orchestrator
//!              → {cache lookup, in-flight dedup} → batch planner
//!              → worker pool → native engine → cache write-back → response
//! ```

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod breaker;
pub mod cancel;
pub mod config;
pub mod cost;
pub mod engine;
pub mod metrics;
pub mod orchestrator;
pub mod params;
pub mod pool;
pub mod store;
pub mod sweep;

// Re-exports for convenience
pub use breaker::{AdmissionDecision, CircuitBreaker, CircuitState, HealthMetrics};
pub use cancel::{CancellationRegistry, CancellationToken};
pub use config::OrchestratorConfig;
pub use engine::{AnalyticEngine, EngineCall, NativeEngine};
pub use orchestrator::{BatchOutcome, ComputeOrchestrator, SingleOutcome};
pub use params::{ComputationResult, Modulation, ParameterSet};
pub use pool::{PoolStats, WorkerPool};
pub use store::{MemoryStore, ResultStore};
pub use sweep::{GridOutcome, SweepAxis, SweepField, SweepOutcome};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every error surface in the service core maps to a variant here, matching
/// the taxonomy consumed by the API boundary: validation and overload
/// rejections resolve before any work is scheduled, cancellations are not
/// failures, and per-item computation failures inside a batch never reach
/// this type (they become missing result slots instead).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Parameters out of domain range. Rejected before fingerprinting,
    /// never retried, never cached.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// The owning session was cancelled before this computation started.
    ///
    /// Distinguished from true failures; logged at info level, not error.
    #[error("computation cancelled")]
    Cancelled,

    /// The native engine raised an error for this computation.
    #[error("computation failed: {0}")]
    Computation(String),

    /// The circuit breaker denied admission. Carries a retry-after hint so
    /// the boundary can answer with something better than a generic 5xx.
    #[error("rejected under load: {reason}")]
    Overloaded {
        /// Human-readable reason for the rejection.
        reason: String,
        /// How long the client should wait before retrying.
        retry_after: Duration,
    },

    /// The worker pool FIFO queue is at capacity.
    #[error("worker queue full")]
    QueueFull,

    /// The worker pool is not initialised or is shutting down. The
    /// orchestrator falls back to direct sequential execution on this.
    #[error("worker pool unavailable")]
    PoolUnavailable,

    /// The result store collaborator failed. The orchestrator degrades
    /// (treats reads as misses, drops writes) rather than surfacing this
    /// on the computation path.
    #[error("result store error: {0}")]
    Store(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first computation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Unique session identifier for cancellation scoping and trace correlation.
///
/// Sessions group related requests; a single cancel operation at the API
/// boundary flags every live task registered under the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(
    /// The raw string ID, typically a UUID or user-provided token.
    pub String,
);

impl SessionId {
    /// Create a new [`SessionId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
