//! Admission, dedup, cache planning, and dispatch for computation requests.
//!
//! Every request flows through the same gauntlet: validate (done by the
//! caller when constructing a [`ParameterSet`](crate::params::ParameterSet)),
//! estimate cost, pass admission control, consult the result store, coalesce
//! with identical in-flight work, and only then touch the worker pool.
//!
//! Batches are planned against the store in one round trip and dispatched as
//! a single pool task covering exactly the uncached points; cached slots are
//! filled without computing, and freshly computed results are written back
//! best-effort.

use crate::breaker::{AdmissionDecision, CircuitBreaker};
use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::config::OrchestratorConfig;
use crate::cost::{estimate_cost, RequestShape};
use crate::engine::{EngineCall, NativeEngine};
use crate::metrics;
use crate::params::{ComputationResult, ParameterSet};
use crate::pool::{ItemOutcome, WorkerPool};
use crate::store::{MemoryStore, ResultStore};
use crate::{OrchestratorError, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Terminal signal broadcast to requests that joined an in-flight
/// computation. Must be `Clone` for the broadcast channel.
#[derive(Debug, Clone)]
enum InflightFailure {
    Cancelled,
    Failed(String),
}

type InflightSender = broadcast::Sender<Result<ComputationResult, InflightFailure>>;

/// Outcome of a single-point computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleOutcome {
    /// The computed (or recalled) result.
    pub result: ComputationResult,
    /// Whether the result came from the store without computing.
    pub cached: bool,
}

/// Outcome of a batch computation: one slot per requested parameter set, in
/// request order. A `None` slot means that point failed or was skipped by
/// cancellation; completed siblings are still returned.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Per-point results aligned with the request order.
    pub slots: Vec<Option<ComputationResult>>,
    /// Whether the owning session was cancelled partway through.
    pub cancelled: bool,
    /// Whether every slot was served from the store.
    pub all_cached: bool,
}

impl BatchOutcome {
    /// Number of requested points, populated or not.
    pub fn requested_points(&self) -> usize {
        self.slots.len()
    }

    /// Number of populated slots.
    pub fn computed_points(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether any slot is missing.
    pub fn incomplete(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    /// Populated results in request order, skipping missing slots.
    pub fn results(&self) -> impl Iterator<Item = &ComputationResult> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

/// The orchestration core tying admission, dedup, store, and pool together.
pub struct ComputeOrchestrator {
    pool: Arc<WorkerPool>,
    store: Arc<dyn ResultStore>,
    breaker: Arc<CircuitBreaker>,
    engine: Arc<dyn NativeEngine>,
    sessions: Arc<CancellationRegistry>,
    inflight: Arc<DashMap<String, InflightSender>>,
}

impl ComputeOrchestrator {
    /// Assemble an orchestrator from explicitly constructed collaborators.
    pub fn new(
        pool: Arc<WorkerPool>,
        store: Arc<dyn ResultStore>,
        breaker: Arc<CircuitBreaker>,
        engine: Arc<dyn NativeEngine>,
        sessions: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            pool,
            store,
            breaker,
            engine,
            sessions,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Build a full orchestrator stack from configuration: in-memory store,
    /// worker pool over `engine`, breaker with its sampling loop, and a
    /// session registry.
    pub fn from_config(config: &OrchestratorConfig, engine: Arc<dyn NativeEngine>) -> Self {
        let pool = Arc::new(WorkerPool::new(
            config.pool.workers,
            config.pool.max_queue_depth,
            Arc::clone(&engine),
        ));
        let store = Arc::new(MemoryStore::new(
            config.cache.max_entries,
            config.cache.ttl(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        crate::breaker::spawn_sampler(Arc::clone(&breaker), Arc::clone(&pool));
        let sessions = Arc::new(CancellationRegistry::new(config.sessions.idle_ttl()));
        Self::new(pool, store, breaker, engine, sessions)
    }

    /// The worker pool, for health endpoints and shutdown.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The circuit breaker, for health endpoints.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Register a new client operation under `session` and hand back its
    /// cancellation token.
    pub fn begin_operation(&self, session: &SessionId) -> CancellationToken {
        self.sessions.register(session)
    }

    /// Cancel every live operation of `session`. Returns the number of tasks
    /// that were live when the flag was raised; tasks already inside the
    /// engine run to completion.
    pub fn cancel_session(&self, session: &SessionId) -> usize {
        metrics::inc_request("cancel");
        self.sessions.cancel_all(session)
    }

    /// Compute one point, deduplicating against identical in-flight requests
    /// and consulting the store first.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Overloaded`] when admission control rejects,
    /// [`OrchestratorError::Cancelled`] when the session was cancelled before
    /// a result materialised, [`OrchestratorError::Computation`] on engine
    /// failure, [`OrchestratorError::QueueFull`] when the pool sheds.
    pub async fn compute_single(
        &self,
        params: &ParameterSet,
        token: &CancellationToken,
    ) -> Result<SingleOutcome, OrchestratorError> {
        metrics::inc_request("single");
        self.admit(params, RequestShape::Single).await?;

        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let fingerprint = params.fingerprint();

        // Store first: a hit costs one read, no admission of pool work.
        if let Some(result) = self.store_get(&fingerprint).await {
            metrics::inc_cache_hits(1);
            debug!(fingerprint = %fingerprint, "served from store");
            return Ok(SingleOutcome {
                result,
                cached: true,
            });
        }
        metrics::inc_cache_misses(1);

        // Coalesce with identical in-flight work. The entry API makes the
        // insert-or-subscribe decision atomic, so two racing requests cannot
        // both become producers.
        let rx = match self.inflight.entry(fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Some(entry.get().subscribe()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(8);
                entry.insert(tx);
                None
            }
        };

        if let Some(mut rx) = rx {
            metrics::inc_dedup_join();
            debug!(fingerprint = %fingerprint, "joined in-flight computation");
            return match rx.recv().await {
                Ok(Ok(result)) => Ok(SingleOutcome {
                    result,
                    cached: false,
                }),
                Ok(Err(InflightFailure::Cancelled)) => Err(OrchestratorError::Cancelled),
                Ok(Err(InflightFailure::Failed(msg))) => Err(OrchestratorError::Computation(msg)),
                // A closed or lagged channel does not mean the computation
                // failed: the producer may have broadcast before this waiter
                // subscribed. The store is the source of truth.
                Err(_) => match self.store_get(&fingerprint).await {
                    Some(result) => Ok(SingleOutcome {
                        result,
                        cached: true,
                    }),
                    None => Err(OrchestratorError::Computation(
                        "in-flight computation abandoned".to_string(),
                    )),
                },
            };
        }

        // Producer path. The guard removes the in-flight entry on every exit,
        // including early returns and panics in awaited code.
        let _guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            fingerprint: fingerprint.clone(),
        };

        let outcome = self
            .dispatch_single(EngineCall::from_params(params), token.clone())
            .await;

        // Waiters get exactly what the producer got.
        let broadcast_payload = match &outcome {
            Ok(result) => Ok(*result),
            Err(OrchestratorError::Cancelled) => Err(InflightFailure::Cancelled),
            Err(e) => Err(InflightFailure::Failed(e.to_string())),
        };

        if let Ok(result) = &outcome {
            self.store_put(&fingerprint, result).await;
        }

        if let Some(tx) = self.inflight.get(&fingerprint) {
            let _ = tx.send(broadcast_payload);
        }

        outcome.map(|result| SingleOutcome {
            result,
            cached: false,
        })
    }

    /// Compute a batch of independent points with one store round trip and
    /// one pool dispatch covering exactly the uncached points.
    ///
    /// Slots in the outcome are aligned with `items`; per-point failures
    /// leave their slot empty without failing the batch.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Overloaded`] when admission control rejects the
    /// batch, and the pool-level errors of [`WorkerPool::execute_batch`].
    /// Cancellation is never an error here: a session cancelled at any point
    /// yields an `Ok` outcome with `cancelled` set and the slots that were
    /// already filled from the store retained.
    pub async fn compute_batch(
        &self,
        items: &[ParameterSet],
        token: &CancellationToken,
    ) -> Result<BatchOutcome, OrchestratorError> {
        metrics::inc_request("batch");
        self.compute_batch_with_shape(items, RequestShape::Batch(items.len()), token)
            .await
    }

    /// Batch path with an explicit cost shape, shared with the sweep
    /// planner (which admits as a sweep or grid, not as a plain batch).
    pub(crate) async fn compute_batch_with_shape(
        &self,
        items: &[ParameterSet],
        shape: RequestShape,
        token: &CancellationToken,
    ) -> Result<BatchOutcome, OrchestratorError> {
        if items.is_empty() {
            return Ok(BatchOutcome {
                slots: Vec::new(),
                cancelled: false,
                all_cached: true,
            });
        }

        // Admission is judged on the most expensive member scaled to the
        // batch size, so a batch cannot sneak past as many cheap singles.
        let representative = items
            .iter()
            .max_by_key(|p| estimate_cost(p, RequestShape::Single))
            .unwrap_or(&items[0]);
        self.admit(representative, shape).await?;

        let fingerprints: Vec<String> = items.iter().map(ParameterSet::fingerprint).collect();
        let mut slots: Vec<Option<ComputationResult>> = vec![None; items.len()];

        // One read for the whole batch.
        let cached = match self.store.batch_get(&fingerprints).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "store batch read failed, treating all as misses");
                Default::default()
            }
        };
        for (i, fp) in fingerprints.iter().enumerate() {
            if let Some(raw) = cached.get(fp) {
                match ComputationResult::from_json(raw) {
                    Ok(result) => slots[i] = Some(result),
                    Err(e) => warn!(fingerprint = %fp, error = %e, "discarding corrupt store entry"),
                }
            }
        }

        let uncached: Vec<usize> = (0..items.len()).filter(|&i| slots[i].is_none()).collect();
        metrics::inc_cache_hits((items.len() - uncached.len()) as u64);
        metrics::inc_cache_misses(uncached.len() as u64);
        debug!(
            total = items.len(),
            cached = items.len() - uncached.len(),
            "batch planned"
        );

        if uncached.is_empty() {
            return Ok(BatchOutcome {
                slots,
                cancelled: false,
                all_cached: true,
            });
        }

        if token.is_cancelled() {
            // Cached hits are still returned; nothing new is started.
            return Ok(BatchOutcome {
                slots,
                cancelled: true,
                all_cached: false,
            });
        }

        let calls: Vec<EngineCall> = uncached
            .iter()
            .map(|&i| EngineCall::from_params(&items[i]))
            .collect();
        let outcomes = match self.dispatch_batch(calls, token.clone()).await {
            Ok(outcomes) => outcomes,
            // The whole pool task was dropped by cancellation (typically
            // while queued). Cached slots are still a valid partial answer.
            Err(OrchestratorError::Cancelled) => {
                return Ok(BatchOutcome {
                    slots,
                    cancelled: true,
                    all_cached: false,
                });
            }
            Err(e) => return Err(e),
        };

        let mut cancelled = false;
        for (slot_idx, outcome) in uncached.iter().zip(outcomes) {
            match outcome {
                ItemOutcome::Completed(result) => {
                    self.store_put_detached(&fingerprints[*slot_idx], &result);
                    slots[*slot_idx] = Some(result);
                }
                ItemOutcome::Failed(msg) => {
                    warn!(index = slot_idx, error = %msg, "batch point failed");
                }
                ItemOutcome::Cancelled => cancelled = true,
            }
        }

        Ok(BatchOutcome {
            slots,
            cancelled,
            all_cached: false,
        })
    }

    /// Current Prometheus exposition text, for a metrics endpoint.
    pub fn metrics_text(&self) -> String {
        metrics::gather_metrics()
    }

    async fn admit(
        &self,
        params: &ParameterSet,
        shape: RequestShape,
    ) -> Result<u64, OrchestratorError> {
        let cost = estimate_cost(params, shape);
        match self.breaker.should_accept(cost).await {
            AdmissionDecision::Accept { effective_cost, .. } => Ok(effective_cost),
            AdmissionDecision::Reject {
                reason, retry_after, ..
            } => Err(OrchestratorError::Overloaded {
                reason,
                retry_after,
            }),
        }
    }

    async fn dispatch_single(
        &self,
        call: EngineCall,
        token: CancellationToken,
    ) -> Result<ComputationResult, OrchestratorError> {
        match self.pool.execute(call.clone(), token.clone()).await {
            Err(OrchestratorError::PoolUnavailable) => {
                self.compute_inline(vec![call], &token)
                    .await?
                    .into_iter()
                    .next()
                    .map_or(Err(OrchestratorError::Cancelled), item_to_result)
            }
            other => other,
        }
    }

    async fn dispatch_batch(
        &self,
        calls: Vec<EngineCall>,
        token: CancellationToken,
    ) -> Result<Vec<ItemOutcome>, OrchestratorError> {
        match self.pool.execute_batch(calls.clone(), token.clone()).await {
            Err(OrchestratorError::PoolUnavailable) => self.compute_inline(calls, &token).await,
            other => other,
        }
    }

    /// Degraded path when the pool is gone: run the engine on an ad-hoc
    /// blocking thread so a draining process can still serve.
    async fn compute_inline(
        &self,
        calls: Vec<EngineCall>,
        token: &CancellationToken,
    ) -> Result<Vec<ItemOutcome>, OrchestratorError> {
        warn!(items = calls.len(), "pool unavailable, computing inline");
        let engine = Arc::clone(&self.engine);
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            calls
                .iter()
                .map(|call| {
                    if token.is_cancelled() {
                        return ItemOutcome::Cancelled;
                    }
                    match engine.compute(call) {
                        Ok(result) => ItemOutcome::Completed(result),
                        Err(e) => ItemOutcome::Failed(e.to_string()),
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| OrchestratorError::Computation(format!("inline compute failed: {e}")))
    }

    async fn store_get(&self, fingerprint: &str) -> Option<ComputationResult> {
        match self.store.get(fingerprint).await {
            Ok(Some(raw)) => match ComputationResult::from_json(&raw) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "discarding corrupt store entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                // Store trouble degrades to a miss; computing is always correct.
                warn!(error = %e, "store read failed, treating as miss");
                None
            }
        }
    }

    async fn store_put(&self, fingerprint: &str, result: &ComputationResult) {
        match result.to_json() {
            Ok(raw) => {
                if let Err(e) = self.store.put(fingerprint, raw).await {
                    warn!(error = %e, "store write failed, result not cached");
                }
            }
            Err(e) => warn!(error = %e, "result serialization failed"),
        }
    }

    /// Fire-and-forget store write, used on the batch path where one slow
    /// write must not delay the outcome.
    fn store_put_detached(&self, fingerprint: &str, result: &ComputationResult) {
        let store = Arc::clone(&self.store);
        let fingerprint = fingerprint.to_string();
        let result = *result;
        tokio::spawn(async move {
            match result.to_json() {
                Ok(raw) => {
                    if let Err(e) = store.put(&fingerprint, raw).await {
                        warn!(error = %e, "store write failed, result not cached");
                    }
                }
                Err(e) => warn!(error = %e, "result serialization failed"),
            }
        });
    }

    /// Stop accepting work and release the pool. In-flight tasks finish.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.pool.shutdown();
    }
}

fn item_to_result(item: ItemOutcome) -> Result<ComputationResult, OrchestratorError> {
    match item {
        ItemOutcome::Completed(result) => Ok(result),
        ItemOutcome::Failed(msg) => Err(OrchestratorError::Computation(msg)),
        ItemOutcome::Cancelled => Err(OrchestratorError::Cancelled),
    }
}

struct InflightGuard {
    inflight: Arc<DashMap<String, InflightSender>>,
    fingerprint: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{Clock, FixedMemoryProbe, ManualClock};
    use crate::config::BreakerSettings;
    use crate::engine::AnalyticEngine;
    use crate::params::Modulation;
    use std::time::Duration;

    fn params(snr: f64) -> ParameterSet {
        ParameterSet::new(4, Modulation::Psk, snr, 0.3, 20, 100, 1e-6).unwrap()
    }

    fn orchestrator() -> ComputeOrchestrator {
        let engine: Arc<dyn NativeEngine> = Arc::new(AnalyticEngine::new());
        let pool = Arc::new(WorkerPool::new(2, 16, Arc::clone(&engine)));
        let store = Arc::new(MemoryStore::new(100, Duration::from_secs(60)));
        let breaker = Arc::new(CircuitBreaker::with_parts(
            BreakerSettings::default(),
            Arc::new(ManualClock::new()) as Arc<dyn Clock>,
            Arc::new(FixedMemoryProbe(0.0)),
        ));
        let sessions = Arc::new(CancellationRegistry::new(Duration::from_secs(300)));
        ComputeOrchestrator::new(pool, store, breaker, engine, sessions)
    }

    #[tokio::test]
    async fn test_single_then_repeat_is_cached() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        let p = params(3.0);

        let first = orch.compute_single(&p, &token).await.unwrap();
        assert!(!first.cached);

        let second = orch.compute_single(&p, &token).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.result, second.result);
    }

    #[tokio::test]
    async fn test_late_waiter_recovers_result_from_store_when_channel_closes() {
        // A waiter that subscribes after the producer has already broadcast
        // sees only a closed channel. The result is in the store by then, so
        // the waiter must recover it instead of reporting a failure.
        let engine: Arc<dyn NativeEngine> = Arc::new(AnalyticEngine::new());
        let pool = Arc::new(WorkerPool::new(2, 16, Arc::clone(&engine)));
        let store = Arc::new(MemoryStore::new(100, Duration::from_secs(60)));
        let breaker = Arc::new(CircuitBreaker::with_parts(
            BreakerSettings::default(),
            Arc::new(ManualClock::new()) as Arc<dyn Clock>,
            Arc::new(FixedMemoryProbe(0.0)),
        ));
        let sessions = Arc::new(CancellationRegistry::new(Duration::from_secs(300)));
        let orch = Arc::new(ComputeOrchestrator::new(
            pool,
            Arc::clone(&store) as Arc<dyn ResultStore>,
            breaker,
            Arc::clone(&engine),
            sessions,
        ));

        let token = orch.begin_operation(&SessionId::new("late"));
        let p = params(6.0);
        let fingerprint = p.fingerprint();

        // Producer entry already present; its broadcast will never reach the
        // waiter below.
        let (tx, keepalive) = broadcast::channel(8);
        orch.inflight.insert(fingerprint.clone(), tx.clone());

        let waiter = {
            let orch = Arc::clone(&orch);
            let p = p.clone();
            let token = token.clone();
            tokio::spawn(async move { orch.compute_single(&p, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Producer finishes: result lands in the store, then the in-flight
        // entry and channel are torn down without the waiter seeing a send.
        let expected = engine.compute(&EngineCall::from_params(&p)).unwrap();
        store
            .put(&fingerprint, expected.to_json().unwrap())
            .await
            .unwrap();
        orch.inflight.remove(&fingerprint);
        drop(keepalive);
        drop(tx);

        let outcome = waiter
            .await
            .unwrap()
            .expect("waiter must fall back to the store, not fail");
        assert!(outcome.cached);
        assert_eq!(outcome.result, expected);
    }

    #[tokio::test]
    async fn test_cancelled_token_rejected_before_dispatch() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        token.cancel();
        let result = orch.compute_single(&params(3.0), &token).await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_batch_slots_align_with_request_order() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        let items: Vec<ParameterSet> = (1..=5).map(|i| params(f64::from(i))).collect();

        let outcome = orch.compute_batch(&items, &token).await.unwrap();
        assert_eq!(outcome.slots.len(), 5);
        assert!(!outcome.incomplete());
        assert!(!outcome.cancelled);

        // Each slot must match its own single-point computation.
        for (item, slot) in items.iter().zip(&outcome.slots) {
            let single = orch.compute_single(item, &token).await.unwrap();
            assert_eq!(slot.as_ref(), Some(&single.result));
        }
    }

    #[tokio::test]
    async fn test_fully_cached_batch_skips_the_pool() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        let items: Vec<ParameterSet> = (1..=3).map(|i| params(f64::from(i))).collect();

        let first = orch.compute_batch(&items, &token).await.unwrap();
        assert!(!first.all_cached);

        // Batch write-back is fire-and-forget; give it a beat to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = orch.compute_batch(&items, &token).await.unwrap();
        assert!(second.all_cached);
        assert_eq!(first.slots, second.slots);
    }

    #[tokio::test]
    async fn test_empty_batch_is_trivially_complete() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        let outcome = orch.compute_batch(&[], &token).await.unwrap();
        assert!(outcome.slots.is_empty());
        assert!(outcome.all_cached);
        assert_eq!(outcome.computed_points(), 0);
    }

    #[tokio::test]
    async fn test_pool_shutdown_falls_back_to_inline_compute() {
        let orch = orchestrator();
        let token = orch.begin_operation(&SessionId::new("s"));
        orch.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = orch.compute_single(&params(2.5), &token).await.unwrap();
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn test_cancel_session_flags_registered_tokens() {
        let orch = orchestrator();
        let session = SessionId::new("victim");
        let token = orch.begin_operation(&session);
        orch.cancel_session(&session);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_from_config_builds_working_stack() {
        let orch = ComputeOrchestrator::from_config(
            &OrchestratorConfig::default(),
            Arc::new(AnalyticEngine::new()),
        );
        let token = orch.begin_operation(&SessionId::new("s"));
        let outcome = orch.compute_single(&params(4.0), &token).await.unwrap();
        assert!(!outcome.cached);
    }
}
