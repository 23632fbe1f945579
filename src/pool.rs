//! Fixed-size worker pool over the native engine.
//!
//! A single dispatcher task owns the worker array and the FIFO queue
//! (single-writer discipline): it never blocks, and suspends only while
//! waiting for submissions or completion notices. Each dispatched task runs
//! the blocking engine call on a dedicated blocking thread, so N workers
//! give true N-way CPU parallelism.
//!
//! A **batch** task bundles many parameter sets into one dispatch to one
//! worker, amortizing per-task overhead — the key optimization over a naive
//! one-dispatch-per-point design. Within a batch the cancellation token is
//! checked between items; an item already inside the engine always runs to
//! completion.
//!
//! Worker failure (engine error or panic) surfaces as a per-task failure,
//! never a pool failure: the slot is released and the pool keeps serving.

use crate::cancel::CancellationToken;
use crate::engine::{EngineCall, NativeEngine};
use crate::metrics;
use crate::params::ComputationResult;
use crate::{OrchestratorError, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one parameter set within a pool task.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// Engine produced a result.
    Completed(ComputationResult),
    /// Engine reported a failure for this item; siblings are unaffected.
    Failed(String),
    /// The owning session was cancelled before this item started.
    Cancelled,
}

/// Work bundled into one pool task.
#[derive(Debug)]
pub enum TaskKind {
    /// One evaluation point.
    Single(EngineCall),
    /// Many evaluation points executed sequentially on one worker.
    Batch(Vec<EngineCall>),
}

impl TaskKind {
    fn item_count(&self) -> usize {
        match self {
            TaskKind::Single(_) => 1,
            TaskKind::Batch(calls) => calls.len(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TaskKind::Single(_) => "single",
            TaskKind::Batch(_) => "batch",
        }
    }
}

/// Unit of work handed to the pool.
#[derive(Debug)]
pub struct Task {
    /// Unique task id for trace correlation.
    pub id: Uuid,
    /// Single or batched payload.
    pub kind: TaskKind,
    /// Session that owns the task.
    pub session: SessionId,
}

/// Snapshot of pool occupancy, consumed by the circuit breaker and by
/// operational health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total workers in the pool.
    pub total: usize,
    /// Workers currently executing a task.
    pub busy: usize,
    /// Idle workers.
    pub available: usize,
    /// Tasks waiting in the FIFO queue.
    pub queued: usize,
}

/// Per-worker occupancy flag, mutated only by the dispatcher.
#[derive(Debug, Clone)]
struct WorkerHandle {
    busy: bool,
}

struct PoolShared {
    total: usize,
    busy: AtomicUsize,
    queued: AtomicUsize,
    dispatched: AtomicUsize,
    shutdown: AtomicBool,
}

struct PoolJob {
    task: Task,
    token: CancellationToken,
    reply: oneshot::Sender<Result<Vec<ItemOutcome>, OrchestratorError>>,
}

enum PoolMsg {
    Submit(PoolJob),
    WorkerDone(usize),
    Shutdown,
}

/// Fixed pool of long-lived workers wrapping the native engine.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<PoolMsg>,
    shared: Arc<PoolShared>,
    max_queue_depth: usize,
}

impl WorkerPool {
    /// Spawn a pool with `workers` slots and a FIFO queue bounded at
    /// `max_queue_depth`, all wrapping the given engine.
    pub fn new(workers: usize, max_queue_depth: usize, engine: Arc<dyn NativeEngine>) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            total: workers,
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            engine,
            shared: Arc::clone(&shared),
            tx: tx.clone(),
            workers: vec![WorkerHandle { busy: false }; workers],
            queue: VecDeque::new(),
            max_queue_depth,
        };
        tokio::spawn(dispatcher.run(rx));

        Self {
            tx,
            shared,
            max_queue_depth,
        }
    }

    /// Execute one evaluation point.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Cancelled`] if the token was observed cancelled
    /// before dispatch, [`OrchestratorError::Computation`] on engine
    /// failure, [`OrchestratorError::QueueFull`] when the FIFO is at
    /// capacity, [`OrchestratorError::PoolUnavailable`] after shutdown.
    pub async fn execute(
        &self,
        call: EngineCall,
        token: CancellationToken,
    ) -> Result<ComputationResult, OrchestratorError> {
        let outcomes = self.submit(TaskKind::Single(call), token).await?;
        match outcomes.into_iter().next() {
            Some(ItemOutcome::Completed(result)) => Ok(result),
            Some(ItemOutcome::Failed(msg)) => Err(OrchestratorError::Computation(msg)),
            Some(ItemOutcome::Cancelled) | None => Err(OrchestratorError::Cancelled),
        }
    }

    /// Execute many evaluation points as one batched task on one worker.
    ///
    /// The returned outcomes are aligned with `calls` by index; per-item
    /// failures and cancellations are reported in place, never as a task
    /// failure.
    ///
    /// # Errors
    ///
    /// Same task-level errors as [`WorkerPool::execute`].
    pub async fn execute_batch(
        &self,
        calls: Vec<EngineCall>,
        token: CancellationToken,
    ) -> Result<Vec<ItemOutcome>, OrchestratorError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        self.submit(TaskKind::Batch(calls), token).await
    }

    async fn submit(
        &self,
        kind: TaskKind,
        token: CancellationToken,
    ) -> Result<Vec<ItemOutcome>, OrchestratorError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(OrchestratorError::PoolUnavailable);
        }

        let task = Task {
            id: Uuid::new_v4(),
            kind,
            session: token.session().clone(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = PoolJob {
            task,
            token,
            reply: reply_tx,
        };

        self.tx
            .send(PoolMsg::Submit(job))
            .map_err(|_| OrchestratorError::PoolUnavailable)?;
        reply_rx
            .await
            .map_err(|_| OrchestratorError::PoolUnavailable)?
    }

    /// Current occupancy snapshot. Lock-free.
    pub fn stats(&self) -> PoolStats {
        let busy = self.shared.busy.load(Ordering::Acquire);
        PoolStats {
            total: self.shared.total,
            busy,
            available: self.shared.total.saturating_sub(busy),
            queued: self.shared.queued.load(Ordering::Acquire),
        }
    }

    /// Configured FIFO queue bound, used for queue-utilization sampling.
    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth
    }

    /// Cumulative count of tasks handed to a worker since startup. A batch
    /// of any size counts as one task.
    pub fn dispatched_tasks(&self) -> usize {
        self.shared.dispatched.load(Ordering::Acquire)
    }

    /// Whether the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work. Queued tasks are failed with
    /// [`OrchestratorError::PoolUnavailable`]; in-flight tasks run to
    /// completion.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.tx.send(PoolMsg::Shutdown);
    }
}

struct Dispatcher {
    engine: Arc<dyn NativeEngine>,
    shared: Arc<PoolShared>,
    tx: mpsc::UnboundedSender<PoolMsg>,
    workers: Vec<WorkerHandle>,
    queue: VecDeque<PoolJob>,
    max_queue_depth: usize,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolMsg>) {
        info!(workers = self.workers.len(), "worker pool started");

        while let Some(msg) = rx.recv().await {
            match msg {
                PoolMsg::Submit(job) => self.on_submit(job),
                PoolMsg::WorkerDone(idx) => self.on_worker_done(idx),
                PoolMsg::Shutdown => break,
            }
        }

        // Fail everything still queued; in-flight tasks reply on their own.
        while let Some(job) = self.queue.pop_front() {
            let _ = job.reply.send(Err(OrchestratorError::PoolUnavailable));
        }
        self.shared.queued.store(0, Ordering::Release);
        info!("worker pool dispatcher stopped");
    }

    fn on_submit(&mut self, job: PoolJob) {
        if job.token.is_cancelled() {
            debug!(task_id = %job.task.id, "task cancelled before queueing");
            let _ = job.reply.send(Err(OrchestratorError::Cancelled));
            return;
        }

        if let Some(idx) = self.workers.iter().position(|w| !w.busy) {
            self.dispatch(idx, job);
        } else if self.queue.len() >= self.max_queue_depth {
            warn!(
                task_id = %job.task.id,
                depth = self.queue.len(),
                "queue full, shedding task"
            );
            let _ = job.reply.send(Err(OrchestratorError::QueueFull));
        } else {
            self.queue.push_back(job);
            self.sync_queue_gauge();
        }
    }

    fn on_worker_done(&mut self, idx: usize) {
        self.workers[idx].busy = false;
        self.shared.busy.fetch_sub(1, Ordering::AcqRel);
        metrics::set_pool_busy(self.shared.busy.load(Ordering::Acquire));

        while let Some(job) = self.queue.pop_front() {
            self.sync_queue_gauge();
            if job.token.is_cancelled() {
                // Dropped without consuming a worker slot.
                debug!(
                    task_id = %job.task.id,
                    session_id = job.task.session.as_str(),
                    "dropping cancelled queued task"
                );
                let _ = job.reply.send(Err(OrchestratorError::Cancelled));
                continue;
            }
            self.dispatch(idx, job);
            return;
        }
    }

    fn dispatch(&mut self, idx: usize, job: PoolJob) {
        self.workers[idx].busy = true;
        self.shared.busy.fetch_add(1, Ordering::AcqRel);
        self.shared.dispatched.fetch_add(1, Ordering::AcqRel);
        metrics::set_pool_busy(self.shared.busy.load(Ordering::Acquire));

        let engine = Arc::clone(&self.engine);
        let done_tx = self.tx.clone();
        let PoolJob { task, token, reply } = job;
        let guard = token.task_guard();
        let item_count = task.kind.item_count();
        let kind_label = task.kind.label();

        debug!(
            task_id = %task.id,
            worker = idx,
            items = item_count,
            kind = kind_label,
            "task dispatched"
        );

        tokio::spawn(async move {
            let started = Instant::now();
            let run_token = token.clone();
            let outcomes =
                tokio::task::spawn_blocking(move || run_task(engine.as_ref(), &task, &run_token))
                    .await
                    .unwrap_or_else(|join_err| {
                        error!(error = %join_err, "worker crashed; surfacing per-task failure");
                        vec![ItemOutcome::Failed(format!("worker crashed: {join_err}")); item_count]
                    });

            metrics::observe_compute_duration(kind_label, started.elapsed());
            let _ = reply.send(Ok(outcomes));
            drop(guard);
            let _ = done_tx.send(PoolMsg::WorkerDone(idx));
        });
    }

    fn sync_queue_gauge(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::Release);
        metrics::set_pool_queue_depth(self.queue.len());
    }
}

fn run_task(engine: &dyn NativeEngine, task: &Task, token: &CancellationToken) -> Vec<ItemOutcome> {
    match &task.kind {
        TaskKind::Single(call) => vec![run_item(engine, call, token)],
        TaskKind::Batch(calls) => calls.iter().map(|call| run_item(engine, call, token)).collect(),
    }
}

fn run_item(engine: &dyn NativeEngine, call: &EngineCall, token: &CancellationToken) -> ItemOutcome {
    // Checked before each item starts; an item already inside the engine is
    // never interrupted.
    if token.is_cancelled() {
        return ItemOutcome::Cancelled;
    }
    match engine.compute(call) {
        Ok(result) => ItemOutcome::Completed(result),
        Err(e) => ItemOutcome::Failed(e.to_string()),
    }
}
