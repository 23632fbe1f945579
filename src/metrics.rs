//! Prometheus metrics for the computation orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** constructing the
//! orchestrator. The helper functions (`inc_request`, `observe_compute_duration`,
//! …) are no-ops if `init_metrics` was never called, so the orchestrator is
//! always safe to run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `orchestrator_requests_total` | Counter | `op` |
//! | `orchestrator_cache_hits_total` | Counter | — |
//! | `orchestrator_cache_misses_total` | Counter | — |
//! | `orchestrator_dedup_joined_total` | Counter | — |
//! | `orchestrator_rejections_total` | Counter | `reason` |
//! | `orchestrator_compute_duration_seconds` | Histogram | `kind` |
//! | `orchestrator_pool_busy_workers` | Gauge | — |
//! | `orchestrator_pool_queue_depth` | Gauge | — |
//! | `orchestrator_breaker_state` | Gauge | — |

use crate::OrchestratorError;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the orchestrator, bundled so they can be stored
/// in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Total client operations per operation label.
    pub requests_total: CounterVec,
    /// Results served from the store.
    pub cache_hits: IntCounter,
    /// Results that required computation.
    pub cache_misses: IntCounter,
    /// Requests that joined an identical in-flight computation.
    pub dedup_joined: IntCounter,
    /// Admission rejections by reason.
    pub rejections_total: CounterVec,
    /// Engine compute duration per task kind.
    pub compute_duration: HistogramVec,
    /// Workers currently busy.
    pub pool_busy: IntGauge,
    /// Tasks waiting in the pool queue.
    pub pool_queue_depth: IntGauge,
    /// Breaker state: 0 healthy, 1 degraded, 2 overloaded.
    pub breaker_state: IntGauge,
    /// Combined load score sampled by the breaker.
    pub combined_load: Histogram,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

fn init_err(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Other(format!("metrics init failed: {e}"))
}

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Must be called once at process startup. Calling it a second time is a
/// no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new("orchestrator_requests_total", "Total client operations"),
        &["op"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(init_err)?;

    let cache_hits = IntCounter::new(
        "orchestrator_cache_hits_total",
        "Results served from the result store",
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(cache_hits.clone()))
        .map_err(init_err)?;

    let cache_misses = IntCounter::new(
        "orchestrator_cache_misses_total",
        "Results that required computation",
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(cache_misses.clone()))
        .map_err(init_err)?;

    let dedup_joined = IntCounter::new(
        "orchestrator_dedup_joined_total",
        "Requests that joined an identical in-flight computation",
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(dedup_joined.clone()))
        .map_err(init_err)?;

    let rejections_total = CounterVec::new(
        Opts::new("orchestrator_rejections_total", "Admission rejections"),
        &["reason"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(rejections_total.clone()))
        .map_err(init_err)?;

    let compute_duration = HistogramVec::new(
        HistogramOpts::new(
            "orchestrator_compute_duration_seconds",
            "Engine compute duration per task kind",
        ),
        &["kind"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(compute_duration.clone()))
        .map_err(init_err)?;

    let pool_busy = IntGauge::new("orchestrator_pool_busy_workers", "Workers currently busy")
        .map_err(init_err)?;
    registry
        .register(Box::new(pool_busy.clone()))
        .map_err(init_err)?;

    let pool_queue_depth = IntGauge::new(
        "orchestrator_pool_queue_depth",
        "Tasks waiting in the pool queue",
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(pool_queue_depth.clone()))
        .map_err(init_err)?;

    let breaker_state = IntGauge::new(
        "orchestrator_breaker_state",
        "Breaker state: 0 healthy, 1 degraded, 2 overloaded",
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(breaker_state.clone()))
        .map_err(init_err)?;

    let combined_load = Histogram::with_opts(HistogramOpts::new(
        "orchestrator_combined_load",
        "Weighted load score sampled by the breaker",
    ))
    .map_err(init_err)?;
    registry
        .register(Box::new(combined_load.clone()))
        .map_err(init_err)?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        cache_hits,
        cache_misses,
        dedup_joined,
        rejections_total,
        compute_duration,
        pool_busy,
        pool_queue_depth,
        breaker_state,
        combined_load,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Increment the request counter for a client operation.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn inc_request(op: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[op]) {
            c.inc();
        }
    }
}

/// Record `n` results served from the store.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn inc_cache_hits(n: u64) {
    if let Some(m) = metrics() {
        m.cache_hits.inc_by(n);
    }
}

/// Record `n` results that required computation.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn inc_cache_misses(n: u64) {
    if let Some(m) = metrics() {
        m.cache_misses.inc_by(n);
    }
}

/// Record one request joining an identical in-flight computation.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn inc_dedup_join() {
    if let Some(m) = metrics() {
        m.dedup_joined.inc();
    }
}

/// Increment the rejection counter for a reason (`overloaded`, `queue_full`).
///
/// No-op if metrics have not been initialised. Never panics.
pub fn inc_rejection(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.rejections_total.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Record the compute duration for one pool task.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn observe_compute_duration(kind: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.compute_duration.get_metric_with_label_values(&[kind]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the busy-worker gauge.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn set_pool_busy(busy: usize) {
    if let Some(m) = metrics() {
        m.pool_busy.set(busy as i64);
    }
}

/// Set the pool queue-depth gauge.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn set_pool_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.pool_queue_depth.set(depth as i64);
    }
}

/// Set the breaker-state gauge (0 healthy, 1 degraded, 2 overloaded).
///
/// No-op if metrics have not been initialised. Never panics.
pub fn set_breaker_state(state: i64) {
    if let Some(m) = metrics() {
        m.breaker_state.set(state);
    }
}

/// Record one sampled combined load score.
///
/// No-op if metrics have not been initialised. Never panics.
pub fn observe_combined_load(load: f64) {
    if let Some(m) = metrics() {
        m.combined_load.observe(load);
    }
}

/// Gather all registered metrics as raw metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised. Never panics.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or encoding
/// fails. Observability degrades gracefully rather than panicking.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
