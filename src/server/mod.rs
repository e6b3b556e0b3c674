//! HTTP server assembly: wires the store, bus, services, orchestrator,
//! and background workers together, then serves the API router.

pub mod api;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::aggregates::{self, AggregatesCache};
use crate::allocator::OffsetAllocator;
use crate::bulk::BulkTracker;
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::metrics::RuntimeMetrics;
use crate::orchestrator::{Orchestrator, chain};
use crate::reconciler::{CounterReconciler, ReconcilePolicy};
use crate::rehydrate::RehydrationWorker;
use crate::services::probe::{AcceptAllBackend, ProbeBackend};
use crate::services::{ServiceRuntime, ServiceSet};
use crate::store::{CampaignStore, DbHandle};
use api::{AppState, FeatureFlags, SharedState};

/// Resume claims older than this may be taken over by another process.
const RESUME_CLAIM_TTL_SECS: i64 = 300;

/// Assemble the application state and start the event-driven tasks (chain
/// runner, aggregates invalidator). Periodic workers are spawned
/// separately by `spawn_periodic_workers`.
pub fn bootstrap(
    config: &AppConfig,
    store: CampaignStore,
    backend: Arc<dyn ProbeBackend>,
) -> (SharedState, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = DbHandle::new(store);
    let bus = EventBus::new();
    let metrics = RuntimeMetrics::new();
    let runtime = ServiceRuntime::new(db.clone(), bus.clone(), Arc::clone(&metrics), backend);
    let services = ServiceSet::build(runtime);
    let orchestrator = Orchestrator::new(
        db.clone(),
        bus.clone(),
        Arc::clone(&metrics),
        services,
    );
    let aggregates = AggregatesCache::new(
        db.clone(),
        Duration::from_secs(config.aggregates_ttl_secs),
    );

    let _ = chain::spawn(Arc::clone(&orchestrator), shutdown_rx.clone());
    let _ = aggregates::spawn_invalidator(Arc::clone(&aggregates), bus.clone(), shutdown_rx);

    let state = Arc::new(AppState {
        allocator: OffsetAllocator::new(db.clone()),
        orchestrator,
        db,
        bus,
        metrics,
        aggregates,
        bulk: Arc::new(BulkTracker::new()),
        flags: FeatureFlags {
            advanced_filters: config.enable_advanced_filters,
            server_sort: config.analysis_server_sort,
        },
    });
    (state, shutdown_tx)
}

/// Rehydration, reconciliation, and cleanup on their configured intervals.
pub fn spawn_periodic_workers(
    state: &SharedState,
    config: &AppConfig,
    shutdown: watch::Receiver<bool>,
) {
    let rehydrator = RehydrationWorker::new(
        Arc::clone(&state.orchestrator),
        state.db.clone(),
        RESUME_CLAIM_TTL_SECS,
    );
    let _ = rehydrator.spawn(config.rehydration_interval_secs, shutdown.clone());

    let reconciler = CounterReconciler::new(
        state.db.clone(),
        state.bus.clone(),
        Arc::clone(&state.metrics),
        ReconcilePolicy {
            drift_window_secs: config.reconcile_interval_secs as i64,
            drift_threshold_pct: config.reconcile_drift_threshold_pct,
            auto_correct: config.reconcile_auto_correct,
            max_corrections: config.reconcile_max_corrections,
        },
    );
    let _ = reconciler.spawn(config.reconcile_interval_secs, shutdown.clone());

    let cleanup = crate::cleanup::CleanupWorker::new(
        state.db.clone(),
        Arc::clone(&state.bulk),
        Arc::clone(&state.aggregates),
    );
    let _ = cleanup.spawn(config.cleanup_interval_secs, shutdown);
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let store = CampaignStore::open(std::path::Path::new(config.db.database_path()))
        .context("Failed to initialize campaign store")?;
    let (state, shutdown_tx) = bootstrap(&config, store, Arc::new(AcceptAllBackend));
    spawn_periodic_workers(&state, &config, shutdown_tx.subscribe());

    let mut app = build_router(state);
    if config.environment.is_development() {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "leadforge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Background workers flush their current unit of work and exit.
    let _ = shutdown_tx.send(true);
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown requested");
}
