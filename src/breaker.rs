//! Load-sampling circuit breaker with hysteresis.
//!
//! The breaker periodically samples pool occupancy and process memory,
//! folds them into one weighted load score, and maps the score onto three
//! states: healthy, degraded, overloaded. Escalation is immediate — one bad
//! sample is enough — while de-escalation requires the improved level to
//! hold for a dwell window, so the breaker never flaps on the edge of a
//! threshold.
//!
//! Admission control consumes the current state: degraded states inflate
//! the estimated cost of incoming work, and the overloaded state rejects
//! requests at or above the expensive-cost threshold, shedding exactly the
//! expensive tail while cheap interactive requests keep flowing.

use crate::config::BreakerSettings;
use crate::metrics;
use crate::pool::PoolStats;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Breaker state, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CircuitState {
    /// Load below the degraded threshold; all work admitted at face cost.
    Healthy,
    /// Sustained load above the degraded threshold.
    Degraded,
    /// Load above the overloaded threshold.
    Overloaded,
}

impl CircuitState {
    /// Gauge encoding: 0 healthy, 1 degraded, 2 overloaded.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Healthy => 0,
            CircuitState::Degraded => 1,
            CircuitState::Overloaded => 2,
        }
    }

    /// Lowercase label for logs.
    pub fn label(self) -> &'static str {
        match self {
            CircuitState::Healthy => "healthy",
            CircuitState::Degraded => "degraded",
            CircuitState::Overloaded => "overloaded",
        }
    }
}

/// One sampled view of system load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMetrics {
    /// Busy workers over total workers, in `[0, 1]`.
    pub worker_utilization: f64,
    /// Tasks waiting in the pool queue.
    pub queue_depth: usize,
    /// Queued tasks over the queue bound, in `[0, 1]`.
    pub queue_utilization: f64,
    /// Process resident memory over system memory, in `[0, 1]`.
    pub memory_utilization: f64,
    /// Weighted combination of the utilizations, in `[0, 1]`.
    pub combined_load: f64,
    /// Breaker state after this sample was applied.
    pub state: CircuitState,
    /// When the sample was taken.
    pub last_updated: DateTime<Utc>,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            worker_utilization: 0.0,
            queue_depth: 0,
            queue_utilization: 0.0,
            memory_utilization: 0.0,
            combined_load: 0.0,
            state: CircuitState::Healthy,
            last_updated: Utc::now(),
        }
    }
}

/// Verdict of admission control for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Admitted; `effective_cost` is the inflated cost to charge.
    Accept {
        /// Breaker state at decision time.
        state: CircuitState,
        /// Multiplier applied to the estimated cost.
        cost_multiplier: f64,
        /// Cost after the multiplier.
        effective_cost: u64,
    },
    /// Rejected; the client should back off for `retry_after`.
    Reject {
        /// Breaker state at decision time.
        state: CircuitState,
        /// Why the request was shed.
        reason: String,
        /// Suggested back-off before retrying.
        retry_after: Duration,
    },
}

impl AdmissionDecision {
    /// Whether the request was admitted.
    pub fn allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Accept { .. })
    }
}

/// A committed state change, kept in a bounded history for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
    /// Combined load that triggered it.
    pub combined_load: f64,
    /// When the transition was committed.
    pub at: DateTime<Utc>,
}

/// Time source seam so the dwell logic is testable without sleeping.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += d;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Instant::now())
    }
}

/// Memory utilization seam.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of system memory held by this process, in `[0, 1]`.
    fn utilization(&self) -> f64;
}

/// Probe returning a fixed value, for tests and platforms without procfs.
pub struct FixedMemoryProbe(pub f64);

impl MemoryProbe for FixedMemoryProbe {
    fn utilization(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Linux procfs probe: resident set from `/proc/self/statm` over `MemTotal`
/// from `/proc/meminfo`. Reads that fail report zero utilization.
pub struct ProcMemoryProbe;

impl ProcMemoryProbe {
    fn resident_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }

    fn total_bytes() -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn utilization(&self) -> f64 {
        match (Self::resident_bytes(), Self::total_bytes()) {
            (Some(rss), Some(total)) if total > 0 => (rss as f64 / total as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Pure hysteresis core: current state plus the pending de-escalation
/// candidate. Escalation applies immediately; de-escalation applies only
/// after the improved level has been indicated continuously for `dwell`.
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    candidate: Option<(CircuitState, Instant)>,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Healthy,
            candidate: None,
        }
    }

    fn observe(
        &mut self,
        indicated: CircuitState,
        now: Instant,
        dwell: Duration,
    ) -> Option<(CircuitState, CircuitState)> {
        if indicated > self.state {
            let from = self.state;
            self.state = indicated;
            self.candidate = None;
            return Some((from, indicated));
        }
        if indicated == self.state {
            self.candidate = None;
            return None;
        }

        // Indicated below current: hold until the dwell elapses. A changed
        // candidate level restarts the window.
        match self.candidate {
            Some((level, since)) if level == indicated => {
                if now.duration_since(since) >= dwell {
                    let from = self.state;
                    self.state = indicated;
                    self.candidate = None;
                    Some((from, indicated))
                } else {
                    None
                }
            }
            _ => {
                self.candidate = Some((indicated, now));
                None
            }
        }
    }
}

struct BreakerInner {
    core: BreakerCore,
    last: HealthMetrics,
}

/// Load-sampling circuit breaker shared across the orchestrator.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    inner: RwLock<BreakerInner>,
    history: Mutex<VecDeque<Transition>>,
}

const HISTORY_CAPACITY: usize = 64;

impl CircuitBreaker {
    /// Breaker with wall-clock time and the procfs memory probe.
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_parts(settings, Arc::new(SystemClock), Arc::new(ProcMemoryProbe))
    }

    /// Breaker with injected clock and memory probe, for tests.
    pub fn with_parts(
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            settings,
            clock,
            memory,
            inner: RwLock::new(BreakerInner {
                core: BreakerCore::new(),
                last: HealthMetrics::default(),
            }),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Fold one pool snapshot (plus a fresh memory reading) into the breaker.
    pub async fn record_sample(&self, stats: PoolStats, max_queue_depth: usize) {
        let worker_utilization = if stats.total > 0 {
            stats.busy as f64 / stats.total as f64
        } else {
            1.0
        };
        let queue_utilization = if max_queue_depth > 0 {
            (stats.queued as f64 / max_queue_depth as f64).min(1.0)
        } else {
            0.0
        };
        let memory_utilization = self.memory.utilization();

        let combined_load = (self.settings.worker_weight * worker_utilization
            + self.settings.queue_weight * queue_utilization
            + self.settings.memory_weight * memory_utilization)
            .clamp(0.0, 1.0);

        let indicated = if combined_load >= self.settings.overloaded_threshold {
            CircuitState::Overloaded
        } else if combined_load >= self.settings.degraded_threshold {
            CircuitState::Degraded
        } else {
            CircuitState::Healthy
        };

        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.write().await;
            let change = inner.core.observe(indicated, now, self.settings.dwell());
            inner.last = HealthMetrics {
                worker_utilization,
                queue_depth: stats.queued,
                queue_utilization,
                memory_utilization,
                combined_load,
                state: inner.core.state,
                last_updated: Utc::now(),
            };
            change
        };

        metrics::observe_combined_load(combined_load);
        debug!(
            combined_load = combined_load,
            indicated = indicated.label(),
            "load sample"
        );

        if let Some((from, to)) = transition {
            metrics::set_breaker_state(to.as_gauge());
            let record = Transition {
                from,
                to,
                combined_load,
                at: Utc::now(),
            };
            if let Ok(mut history) = self.history.lock() {
                if history.len() == HISTORY_CAPACITY {
                    history.pop_front();
                }
                history.push_back(record);
            }
            if to > from {
                warn!(
                    from = from.label(),
                    to = to.label(),
                    combined_load = combined_load,
                    "breaker escalated"
                );
            } else {
                info!(
                    from = from.label(),
                    to = to.label(),
                    combined_load = combined_load,
                    "breaker de-escalated"
                );
            }
        }
    }

    /// Decide admission for a request with the given estimated cost.
    ///
    /// Healthy admits at face cost. Degraded admits everything with the cost
    /// doubled, as an early-warning regime. Overloaded triples the cost and
    /// rejects requests whose estimated cost reaches the expensive threshold,
    /// shedding only the expensive tail.
    pub async fn should_accept(&self, cost: u64) -> AdmissionDecision {
        let state = self.inner.read().await.core.state;
        let cost_multiplier = match state {
            CircuitState::Healthy => 1.0,
            CircuitState::Degraded => self.settings.degraded_multiplier,
            CircuitState::Overloaded => self.settings.overloaded_multiplier,
        };

        if state == CircuitState::Overloaded && cost >= self.settings.expensive_cost_threshold {
            warn!(state = state.label(), cost = cost, "admission rejected");
            metrics::inc_rejection("overloaded");
            return AdmissionDecision::Reject {
                state,
                reason: format!(
                    "estimated cost {cost} at or above expensive threshold {} while overloaded",
                    self.settings.expensive_cost_threshold
                ),
                retry_after: self.settings.retry_after(),
            };
        }
        AdmissionDecision::Accept {
            state,
            cost_multiplier,
            effective_cost: (cost as f64 * cost_multiplier).ceil() as u64,
        }
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.core.state
    }

    /// Last sampled health snapshot.
    pub async fn health(&self) -> HealthMetrics {
        self.inner.read().await.last
    }

    /// Committed transitions, oldest first.
    pub fn transitions(&self) -> Vec<Transition> {
        self.history
            .lock()
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rejection back-off hint from the settings.
    pub fn retry_after(&self) -> Duration {
        self.settings.retry_after()
    }
}

/// Spawn the periodic sampling loop feeding `breaker` from `pool`.
///
/// The loop runs until the pool shuts down.
pub fn spawn_sampler(
    breaker: Arc<CircuitBreaker>,
    pool: Arc<crate::pool::WorkerPool>,
) -> tokio::task::JoinHandle<()> {
    let interval = breaker.settings.sample_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if pool.is_shutdown() {
                break;
            }
            breaker
                .record_sample(pool.stats(), pool.max_queue_depth())
                .await;
        }
    })
}
