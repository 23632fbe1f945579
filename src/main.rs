//! Demo binary for exponent-orchestrator
//!
//! Builds the full orchestration stack over the analytic stand-in engine and
//! walks through the main flows: single compute, cache hit, in-flight dedup,
//! a partially cached batch, a 1-D SNR sweep, and session cancellation.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)
//! - `ORCHESTRATOR_CONFIG` — optional path to a TOML config file

use exponent_orchestrator::{
    init_tracing, metrics, AnalyticEngine, ComputeOrchestrator, Modulation, NativeEngine,
    OrchestratorConfig, ParameterSet, SessionId, SweepAxis, SweepField,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match std::env::var("ORCHESTRATOR_CONFIG") {
        Ok(path) => OrchestratorConfig::load(&path)?,
        Err(_) => OrchestratorConfig::default(),
    };

    info!(
        workers = config.pool.workers,
        queue = config.pool.max_queue_depth,
        "starting exponent-orchestrator demo"
    );

    // Analytic engine with a 30ms simulated compute, so the pool and dedup
    // paths actually get exercised.
    let engine: Arc<dyn NativeEngine> = Arc::new(AnalyticEngine::with_delay(30));
    let orchestrator = Arc::new(ComputeOrchestrator::from_config(&config, engine));

    let session = SessionId::new("demo-session");
    let token = orchestrator.begin_operation(&session);

    // 1. Single compute, then the identical request again: second one is a
    //    store hit.
    let params = ParameterSet::new(4, Modulation::Psk, 2.0, 0.4, 20, 500, 1e-6)?;
    let first = orchestrator.compute_single(&params, &token).await?;
    info!(
        cached = first.cached,
        exponent = first.result.error_exponent,
        pe = first.result.error_probability,
        "first compute"
    );
    let second = orchestrator.compute_single(&params, &token).await?;
    info!(cached = second.cached, "identical request again");

    // 2. Dedup: two concurrent requests for the same fresh parameters share
    //    one engine call.
    let fresh = ParameterSet::new(8, Modulation::Qam, 5.0, 0.5, 24, 1000, 1e-6)?;
    let (a, b) = tokio::join!(
        orchestrator.compute_single(&fresh, &token),
        orchestrator.compute_single(&fresh, &token),
    );
    info!(
        a_ok = a.is_ok(),
        b_ok = b.is_ok(),
        "concurrent identical requests coalesced"
    );

    // 3. Batch where one member is already cached from step 1.
    let batch: Vec<ParameterSet> = vec![
        params.clone(),
        params.with_snr(3.0)?,
        params.with_snr(4.0)?,
    ];
    let outcome = orchestrator.compute_batch(&batch, &token).await?;
    info!(
        total = outcome.slots.len(),
        computed = outcome.computed_points(),
        all_cached = outcome.all_cached,
        "batch complete"
    );

    // 4. 1-D SNR sweep (axis in dB).
    let axis = SweepAxis {
        field: SweepField::Snr,
        start: 0.0,
        stop: 10.0,
        points: 11,
    };
    let sweep = orchestrator.sweep_1d(&params, &axis, &token).await?;
    for (db, result) in sweep.points().take(3) {
        info!(
            snr_db = db,
            exponent = result.error_exponent,
            "sweep point"
        );
    }
    info!(points = sweep.points().count(), "sweep complete");

    // 5. Cancellation: start a slow batch, then cancel the session.
    let slow_session = SessionId::new("impatient-user");
    let slow_token = orchestrator.begin_operation(&slow_session);
    let slow_items: Vec<ParameterSet> = (1..=20)
        .map(|i| params.with_snr(10.0 + f64::from(i)))
        .collect::<Result<_, _>>()?;
    let slow = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .compute_batch(&slow_items, &slow_token)
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let flagged = orchestrator.cancel_session(&slow_session);
    match slow.await? {
        Ok(outcome) => info!(
            flagged_tasks = flagged,
            computed = outcome.computed_points(),
            requested = outcome.requested_points(),
            cancelled = outcome.cancelled,
            "cancelled batch returned partial results"
        ),
        Err(e) => warn!(error = %e, "cancelled batch"),
    }

    // Health snapshot and a metrics sample before teardown.
    let health = orchestrator.breaker().health().await;
    info!(
        state = health.state.label(),
        combined = health.combined_load,
        queue_depth = health.queue_depth,
        "breaker health"
    );
    let exposition = orchestrator.metrics_text();
    info!(bytes = exposition.len(), "metrics exposition ready");

    info!("demo complete - shutting down");
    orchestrator.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok(())
}
