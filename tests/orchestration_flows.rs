//! # Orchestration Flow Integration Tests
//!
//! ## Responsibility
//! Validates the request gauntlet end to end over the public API: identical
//! concurrent requests coalesce into one engine call, repeated requests are
//! served from the store without computing, and batch planning dispatches
//! exactly the uncached points while preserving request order.

use exponent_orchestrator::breaker::{Clock, FixedMemoryProbe, ManualClock};
use exponent_orchestrator::config::BreakerSettings;
use exponent_orchestrator::engine::EngineError;
use exponent_orchestrator::store::StoreError;
use exponent_orchestrator::{
    AnalyticEngine, CancellationRegistry, CircuitBreaker, ComputationResult, ComputeOrchestrator,
    EngineCall, MemoryStore, Modulation, NativeEngine, ParameterSet, ResultStore, SessionId,
    WorkerPool,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine wrapper counting every compute call.
struct CountingEngine {
    inner: AnalyticEngine,
    calls: AtomicUsize,
}

impl CountingEngine {
    fn new(delay_ms: u64) -> Self {
        Self {
            inner: AnalyticEngine::with_delay(delay_ms),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NativeEngine for CountingEngine {
    fn compute(&self, call: &EngineCall) -> Result<ComputationResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compute(call)
    }
}

/// Store wrapper counting reads and writes.
struct CountingStore {
    inner: MemoryStore,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(1000, Duration::from_secs(300)),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ResultStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.batch_get(keys).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value).await
    }
}

/// Store that fails every operation, for degraded-mode checks.
struct BrokenStore;

#[async_trait::async_trait]
impl ResultStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn batch_get(&self, _keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn put(&self, _key: &str, _value: String) -> Result<(), StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

fn quiet_breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::with_parts(
        BreakerSettings::default(),
        Arc::new(ManualClock::new()) as Arc<dyn Clock>,
        Arc::new(FixedMemoryProbe(0.0)),
    ))
}

fn build(
    engine: Arc<CountingEngine>,
    store: Arc<dyn ResultStore>,
    workers: usize,
) -> ComputeOrchestrator {
    let engine_dyn: Arc<dyn NativeEngine> = engine;
    let pool = Arc::new(WorkerPool::new(workers, 64, Arc::clone(&engine_dyn)));
    let sessions = Arc::new(CancellationRegistry::new(Duration::from_secs(300)));
    ComputeOrchestrator::new(pool, store, quiet_breaker(), engine_dyn, sessions)
}

fn params(snr: f64) -> ParameterSet {
    ParameterSet::new(4, Modulation::Psk, snr, 0.3, 20, 100, 1e-6)
        .expect("test: valid parameters")
}

// ── Dedup ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_eight_concurrent_identical_requests_share_one_engine_call() {
    let engine = Arc::new(CountingEngine::new(80));
    let orch = Arc::new(build(
        Arc::clone(&engine),
        Arc::new(CountingStore::new()),
        4,
    ));
    let token = orch.begin_operation(&SessionId::new("dedup"));
    let p = params(3.0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orch = Arc::clone(&orch);
        let token = token.clone();
        let p = p.clone();
        handles.push(tokio::spawn(
            async move { orch.compute_single(&p, &token).await },
        ));
    }

    let mut results = Vec::new();
    for h in handles {
        results.push(
            h.await
                .expect("test: join")
                .expect("test: compute succeeds"),
        );
    }

    // All eight callers got the same result from one computation.
    assert_eq!(engine.calls(), 1, "identical in-flight requests must coalesce");
    for pair in results.windows(2) {
        assert_eq!(pair[0].result, pair[1].result);
    }
}

#[tokio::test]
async fn test_different_parameters_do_not_coalesce() {
    let engine = Arc::new(CountingEngine::new(30));
    let orch = Arc::new(build(
        Arc::clone(&engine),
        Arc::new(CountingStore::new()),
        4,
    ));
    let token = orch.begin_operation(&SessionId::new("distinct"));

    let p1 = params(1.0);
    let p2 = params(2.0);
    let (a, b) = tokio::join!(
        orch.compute_single(&p1, &token),
        orch.compute_single(&p2, &token),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(engine.calls(), 2);
}

// ── Cache-first ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_repeat_request_served_from_store_without_computing() {
    let engine = Arc::new(CountingEngine::new(0));
    let orch = build(Arc::clone(&engine), Arc::new(CountingStore::new()), 2);
    let token = orch.begin_operation(&SessionId::new("cache"));
    let p = params(5.0);

    let first = orch.compute_single(&p, &token).await.expect("test: first");
    assert!(!first.cached);
    assert_eq!(engine.calls(), 1);

    let second = orch.compute_single(&p, &token).await.expect("test: second");
    assert!(second.cached);
    assert_eq!(engine.calls(), 1, "store hit must not reach the engine");
    assert_eq!(first.result, second.result);
}

#[tokio::test]
async fn test_broken_store_degrades_to_recompute() {
    let engine = Arc::new(CountingEngine::new(0));
    let orch = build(Arc::clone(&engine), Arc::new(BrokenStore), 2);
    let token = orch.begin_operation(&SessionId::new("degraded"));
    let p = params(5.0);

    // Both calls succeed; the dead store just costs a recompute.
    let first = orch.compute_single(&p, &token).await.expect("test: first");
    let second = orch.compute_single(&p, &token).await.expect("test: second");
    assert!(!first.cached);
    assert!(!second.cached);
    assert_eq!(engine.calls(), 2);
}

// ── Batch planning ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_computes_only_uncached_points() {
    let engine = Arc::new(CountingEngine::new(0));
    let store = Arc::new(CountingStore::new());
    let orch = build(Arc::clone(&engine), Arc::clone(&store) as Arc<dyn ResultStore>, 2);
    let token = orch.begin_operation(&SessionId::new("batch"));

    let items: Vec<ParameterSet> = (1..=5).map(|i| params(f64::from(i))).collect();

    // Warm points 1 and 3 through the single path.
    orch.compute_single(&items[0], &token)
        .await
        .expect("test: warm 0");
    orch.compute_single(&items[2], &token)
        .await
        .expect("test: warm 2");
    assert_eq!(engine.calls(), 2);
    let dispatched_before = orch.pool().dispatched_tasks();

    let outcome = orch
        .compute_batch(&items, &token)
        .await
        .expect("test: batch");
    assert_eq!(outcome.slots.len(), 5);
    assert!(!outcome.incomplete());
    assert!(!outcome.all_cached);

    // Exactly the three cold points were computed, as one batched pool task.
    assert_eq!(engine.calls(), 5);
    assert_eq!(
        orch.pool().dispatched_tasks() - dispatched_before,
        1,
        "uncached points must go out as a single batched dispatch"
    );

    // Batch write-back is fire-and-forget; give it a beat to land, then the
    // store must hold one put per computed point: 2 warm + 3 from the batch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.puts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_batch_preserves_request_order() {
    let engine = Arc::new(CountingEngine::new(0));
    let orch = build(Arc::clone(&engine), Arc::new(CountingStore::new()), 2);
    let token = orch.begin_operation(&SessionId::new("order"));

    // Descending SNR: results must come back in the same descending order.
    let items: Vec<ParameterSet> = (1..=6).rev().map(|i| params(f64::from(i))).collect();
    let outcome = orch
        .compute_batch(&items, &token)
        .await
        .expect("test: batch");

    let mis: Vec<f64> = outcome
        .results()
        .map(|r| r.mutual_information)
        .collect();
    assert_eq!(mis.len(), 6);
    assert!(
        mis.windows(2).all(|w| w[0] > w[1]),
        "slot order must follow request order, not completion order"
    );
}

#[tokio::test]
async fn test_second_identical_batch_is_fully_cached() {
    let engine = Arc::new(CountingEngine::new(0));
    let orch = build(Arc::clone(&engine), Arc::new(CountingStore::new()), 2);
    let token = orch.begin_operation(&SessionId::new("rebatch"));
    let items: Vec<ParameterSet> = (1..=4).map(|i| params(f64::from(i))).collect();

    let first = orch
        .compute_batch(&items, &token)
        .await
        .expect("test: first batch");
    assert!(!first.all_cached);
    let computed_after_first = engine.calls();

    // Batch write-back is fire-and-forget; give it a beat to land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = orch
        .compute_batch(&items, &token)
        .await
        .expect("test: second batch");
    assert!(second.all_cached);
    assert_eq!(engine.calls(), computed_after_first);
    assert_eq!(first.slots, second.slots);
}
