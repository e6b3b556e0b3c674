//! Phase services: one per work phase, all obeying the same contract
//! (`Configure`, `Start`, `GetStatus`, `Cancel`, `Resume`).
//!
//! The shared `PhaseEngine` owns the contract mechanics (execution-row
//! transitions, cancel flags, progress events, the spawned batch loop);
//! each phase contributes a `JobSpec` that turns its stored configuration
//! into a batch job. Work itself goes through the `ProbeBackend` seam.

pub mod analysis;
pub mod generation;
pub mod probe;
pub mod validation;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::{CoreError, classify_service_error};
use crate::events::{Event, EventBus, ProgressPayload};
use crate::metrics::RuntimeMetrics;
use crate::orchestrator::validation::PhaseConfig;
use crate::phase::{PHASE_ORDER, Phase, PhaseStatus};
use crate::store::DbHandle;
use crate::store::models::PhaseExecution;
use probe::ProbeBackend;

// ── Status snapshot ──────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseStatusSnapshot {
    pub phase: &'static str,
    pub status: PhaseStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub items_total: i64,
    pub items_processed: i64,
    pub items_successful: i64,
    pub items_failed: i64,
    pub progress_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Value>,
}

impl From<PhaseExecution> for PhaseStatusSnapshot {
    fn from(execution: PhaseExecution) -> Self {
        Self {
            phase: execution.phase.wire_name(),
            status: execution.status,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            items_total: execution.items_total,
            items_processed: execution.items_processed,
            items_successful: execution.items_successful,
            items_failed: execution.items_failed,
            progress_pct: execution.progress_pct,
            configuration: execution.configuration,
            last_error: execution.error_details,
        }
    }
}

// ── Service contract ─────────────────────────────────────────────────

#[async_trait]
pub trait PhaseService: Send + Sync {
    fn phase(&self) -> Phase;

    /// Persist the validated config onto the execution row (`configured`).
    async fn configure(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
        config: &PhaseConfig,
    ) -> Result<PhaseStatusSnapshot, CoreError>;

    /// `configured → running`; spawns the batch loop.
    async fn start(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
        is_auto_start: bool,
    ) -> Result<PhaseStatusSnapshot, CoreError>;

    async fn get_status(&self, campaign_id: Uuid) -> Result<PhaseStatusSnapshot, CoreError>;

    /// Best-effort stop; idempotent. Marks the execution failed with
    /// `reason = cancelled` unless it is already terminal.
    async fn cancel(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
    ) -> Result<PhaseStatusSnapshot, CoreError>;

    /// Re-enter an execution left `running`/`paused` (after a restart).
    async fn resume(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
    ) -> Result<PhaseStatusSnapshot, CoreError>;
}

// ── Shared runtime ───────────────────────────────────────────────────

pub struct ServiceRuntime {
    pub db: DbHandle,
    pub bus: EventBus,
    pub metrics: Arc<RuntimeMetrics>,
    pub backend: Arc<dyn ProbeBackend>,
    cancel_flags: Mutex<HashMap<(Uuid, Phase), Arc<AtomicBool>>>,
}

impl ServiceRuntime {
    pub fn new(
        db: DbHandle,
        bus: EventBus,
        metrics: Arc<RuntimeMetrics>,
        backend: Arc<dyn ProbeBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            metrics,
            backend,
            cancel_flags: Mutex::new(HashMap::new()),
        })
    }

    fn cancel_flag(&self, campaign_id: Uuid, phase: Phase) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().expect("cancel flag lock poisoned");
        Arc::clone(
            flags
                .entry((campaign_id, phase))
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    fn drop_cancel_flag(&self, campaign_id: Uuid, phase: Phase) {
        let mut flags = self.cancel_flags.lock().expect("cancel flag lock poisoned");
        flags.remove(&(campaign_id, phase));
    }
}

// ── Batch jobs ───────────────────────────────────────────────────────

pub(crate) struct BatchResult {
    pub processed: i64,
    pub successful: i64,
    pub failed: i64,
    pub done: bool,
}

#[async_trait]
pub(crate) trait PhaseJob: Send + Sync {
    /// Item count for progress reporting, computed before the first batch.
    async fn total(&self) -> Result<i64, CoreError>;

    /// Run one batch. `done` ends the loop; an empty batch should be
    /// reported as done rather than spinning.
    async fn step(&self) -> Result<BatchResult, CoreError>;
}

/// Phase-specific part of a service: building the batch job from the
/// stored canonical configuration.
pub(crate) trait JobSpec: Send + Sync + 'static {
    fn phase(&self) -> Phase;

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError>;
}

// ── Engine ───────────────────────────────────────────────────────────

pub(crate) struct PhaseEngine<S: JobSpec> {
    runtime: Arc<ServiceRuntime>,
    spec: S,
}

impl<S: JobSpec> PhaseEngine<S> {
    pub(crate) fn new(runtime: Arc<ServiceRuntime>, spec: S) -> Self {
        Self { runtime, spec }
    }

    async fn execution(&self, campaign_id: Uuid) -> Result<PhaseExecution, CoreError> {
        let phase = self.spec.phase();
        self.runtime
            .db
            .call(move |store| store.get_execution(campaign_id, phase))
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))
    }

    fn spawn_driver(&self, ctx: &RequestContext, execution: PhaseExecution) {
        let runtime = Arc::clone(&self.runtime);
        let ctx = ctx.clone();
        let phase = self.spec.phase();
        let campaign_id = execution.campaign_id;
        let config = execution.configuration.clone().unwrap_or_else(|| json!({}));
        match self.spec.build_job(&runtime, campaign_id, config) {
            Ok(job) => {
                let flag = runtime.cancel_flag(campaign_id, phase);
                flag.store(false, Ordering::SeqCst);
                tokio::spawn(drive_execution(runtime, ctx, execution, job, flag));
            }
            Err(e) => {
                // A snapshot that no longer builds a job is a config bug;
                // fail the execution rather than leaving it running forever.
                let runtime_err = Arc::clone(&runtime);
                let message = e.to_string();
                tokio::spawn(async move {
                    fail_execution(&runtime_err, &ctx, campaign_id, phase, &message, 0.0).await;
                });
            }
        }
    }
}

#[async_trait]
impl<S: JobSpec> PhaseService for PhaseEngine<S> {
    fn phase(&self) -> Phase {
        self.spec.phase()
    }

    async fn configure(
        &self,
        _ctx: &RequestContext,
        campaign_id: Uuid,
        config: &PhaseConfig,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        let phase = self.spec.phase();
        let snapshot = config.canonical_json();
        let updated = self
            .runtime
            .db
            .call(move |store| {
                store.try_mark_execution_configured(campaign_id, phase, &snapshot)
            })
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))?;
        if !updated {
            // Either no execution row (campaign unknown) or it is busy.
            let execution = self.execution(campaign_id).await?;
            return Err(CoreError::Conflict(format!(
                "cannot configure {} while it is {}",
                phase.wire_name(),
                execution.status.as_str()
            )));
        }
        Ok(self.execution(campaign_id).await?.into())
    }

    async fn start(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
        is_auto_start: bool,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        let phase = self.spec.phase();
        let execution = self.execution(campaign_id).await?;
        if execution.status == PhaseStatus::Running {
            return Err(CoreError::Conflict(format!(
                "{} is already running",
                phase.wire_name()
            )));
        }
        if execution.configuration.is_none() {
            return Err(CoreError::Conflict(format!(
                "{} is not configured",
                phase.wire_name()
            )));
        }

        let correlation_id = ctx.request_id.clone();
        let moved = self
            .runtime
            .db
            .call(move |store| {
                let moved = store.try_mark_execution_running(
                    campaign_id,
                    phase,
                    is_auto_start,
                    &correlation_id,
                )?;
                if moved {
                    store.set_campaign_phase_position(campaign_id, phase, PhaseStatus::Running)?;
                    store.mark_campaign_started(campaign_id)?;
                }
                Ok(moved)
            })
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))?;
        if !moved {
            let execution = self.execution(campaign_id).await?;
            return Err(CoreError::Conflict(format!(
                "cannot start {} from status {}",
                phase.wire_name(),
                execution.status.as_str()
            )));
        }

        let execution = self.execution(campaign_id).await?;
        info!(
            campaign_id = %campaign_id,
            phase = phase.wire_name(),
            auto = is_auto_start,
            request_id = %ctx.request_id,
            "phase started"
        );
        self.runtime.bus.publish(
            ctx,
            Some(campaign_id),
            Event::PhaseStarted {
                phase: phase.wire_name(),
                progress_pct: execution.progress_pct,
            },
        );
        self.spawn_driver(ctx, execution.clone());
        Ok(execution.into())
    }

    async fn get_status(&self, campaign_id: Uuid) -> Result<PhaseStatusSnapshot, CoreError> {
        Ok(self.execution(campaign_id).await?.into())
    }

    async fn cancel(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        let phase = self.spec.phase();
        // Trip the flag first so a running loop stops at its next batch.
        self.runtime
            .cancel_flag(campaign_id, phase)
            .store(true, Ordering::SeqCst);

        let marked = self
            .runtime
            .db
            .call(move |store| {
                let marked = store.try_mark_execution_failed(
                    campaign_id,
                    phase,
                    &json!({"reason": "cancelled"}),
                )?;
                if marked {
                    store.set_campaign_phase_position(campaign_id, phase, PhaseStatus::Failed)?;
                }
                Ok(marked)
            })
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))?;

        let execution = self.execution(campaign_id).await?;
        if marked {
            self.runtime.bus.publish(
                ctx,
                Some(campaign_id),
                Event::PhaseFailed {
                    phase: phase.wire_name(),
                    progress_pct: execution.progress_pct,
                    last_error: Some("cancelled".into()),
                },
            );
        }
        // Already-terminal rows make this a no-op, which is the idempotence
        // the contract asks for.
        Ok(execution.into())
    }

    async fn resume(
        &self,
        ctx: &RequestContext,
        campaign_id: Uuid,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        let phase = self.spec.phase();
        let resumed = self
            .runtime
            .db
            .call(move |store| store.try_mark_execution_resumed(campaign_id, phase))
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))?;
        if !resumed {
            let execution = self.execution(campaign_id).await?;
            return Err(CoreError::Conflict(format!(
                "cannot resume {} from status {}",
                phase.wire_name(),
                execution.status.as_str()
            )));
        }
        let execution = self.execution(campaign_id).await?;
        if execution.configuration.is_none() {
            return Err(CoreError::Conflict(format!(
                "{} has no configuration snapshot to resume from",
                phase.wire_name()
            )));
        }
        info!(
            campaign_id = %campaign_id,
            phase = phase.wire_name(),
            request_id = %ctx.request_id,
            "phase resumed"
        );
        self.runtime.metrics.rehydration_resumes.fetch_add(1, Ordering::Relaxed);
        self.spawn_driver(ctx, execution.clone());
        Ok(execution.into())
    }
}

// ── Driver loop ──────────────────────────────────────────────────────

async fn drive_execution(
    runtime: Arc<ServiceRuntime>,
    ctx: RequestContext,
    execution: PhaseExecution,
    job: Arc<dyn PhaseJob>,
    cancel: Arc<AtomicBool>,
) {
    let campaign_id = execution.campaign_id;
    let phase = execution.phase;
    let started = Instant::now();

    // Resumes pick the totals back up from the row; fresh starts ask the job.
    let mut total = execution.items_total;
    if total == 0 {
        total = match job.total().await {
            Ok(t) => t,
            Err(e) => {
                fail_execution(&runtime, &ctx, campaign_id, phase, &e.to_string(), 0.0).await;
                return;
            }
        };
    }
    let mut processed = execution.items_processed;
    let mut successful = execution.items_successful;
    let mut failed = execution.items_failed;

    loop {
        if cancel.load(Ordering::SeqCst) {
            // Cancel already marked the row failed; just stop working.
            runtime.drop_cancel_flag(campaign_id, phase);
            return;
        }

        let batch = match job.step().await {
            Ok(batch) => batch,
            Err(e) => {
                let pct = progress_pct(processed, total);
                fail_execution(&runtime, &ctx, campaign_id, phase, &e.to_string(), pct).await;
                runtime.drop_cancel_flag(campaign_id, phase);
                return;
            }
        };

        processed += batch.processed;
        successful += batch.successful;
        failed += batch.failed;
        total = total.max(processed);

        let landed = runtime
            .db
            .call(move |store| {
                store.update_execution_progress(
                    campaign_id, phase, total, processed, successful, failed,
                )
            })
            .await
            .unwrap_or(false);
        // The row left `running` under us (cancelled); stop quietly.
        if !landed && !batch.done {
            runtime.drop_cancel_flag(campaign_id, phase);
            return;
        }

        runtime.bus.publish(
            &ctx,
            Some(campaign_id),
            Event::Progress(ProgressPayload {
                phase: phase.wire_name(),
                status: "running".into(),
                items_total: total,
                items_processed: processed,
                items_successful: successful,
                items_failed: failed,
                progress_pct: progress_pct(processed, total),
                message: None,
                error: None,
            }),
        );

        if batch.done {
            break;
        }
    }

    let duration_ns = started.elapsed().as_nanos() as u64;
    let metrics_json = json!({"duration_ns": duration_ns});
    let completed = runtime
        .db
        .call(move |store| {
            let completed =
                store.try_mark_execution_completed(campaign_id, phase, Some(&metrics_json))?;
            if completed {
                store.set_campaign_phase_position(campaign_id, phase, PhaseStatus::Completed)?;
            }
            Ok(completed)
        })
        .await
        .unwrap_or(false);
    runtime.drop_cancel_flag(campaign_id, phase);
    if !completed {
        return; // lost the race to a cancel
    }

    runtime.metrics.phase_completions.fetch_add(1, Ordering::Relaxed);
    runtime.metrics.record_phase_duration(phase, duration_ns);
    info!(
        campaign_id = %campaign_id,
        phase = phase.wire_name(),
        items = processed,
        "phase completed"
    );
    runtime.bus.publish(
        &ctx,
        Some(campaign_id),
        Event::PhaseCompleted {
            phase: phase.wire_name(),
            progress_pct: 100.0,
        },
    );
}

async fn fail_execution(
    runtime: &Arc<ServiceRuntime>,
    ctx: &RequestContext,
    campaign_id: Uuid,
    phase: Phase,
    message: &str,
    progress: f64,
) {
    error!(
        campaign_id = %campaign_id,
        phase = phase.wire_name(),
        error = message,
        request_id = %ctx.request_id,
        "phase failed"
    );
    let classified = classify_service_error(message);
    let details = json!({"error": message, "code": classified.code()});
    let _ = runtime
        .db
        .call(move |store| {
            let marked = store.try_mark_execution_failed(campaign_id, phase, &details)?;
            if marked {
                store.set_campaign_phase_position(campaign_id, phase, PhaseStatus::Failed)?;
            }
            Ok(marked)
        })
        .await;
    runtime.metrics.phase_failures.fetch_add(1, Ordering::Relaxed);
    runtime.bus.publish(
        ctx,
        Some(campaign_id),
        Event::PhaseFailed {
            phase: phase.wire_name(),
            progress_pct: progress,
            last_error: Some(message.to_string()),
        },
    );
}

fn progress_pct(processed: i64, total: i64) -> f64 {
    if total > 0 {
        (processed as f64 / total as f64 * 100.0).min(100.0)
    } else {
        0.0
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// One service per phase, built once at startup.
#[derive(Clone)]
pub struct ServiceSet {
    services: Arc<HashMap<Phase, Arc<dyn PhaseService>>>,
}

impl ServiceSet {
    pub fn build(runtime: Arc<ServiceRuntime>) -> Self {
        let mut services: HashMap<Phase, Arc<dyn PhaseService>> = HashMap::new();
        services.insert(
            Phase::DomainGeneration,
            Arc::new(PhaseEngine::new(
                Arc::clone(&runtime),
                generation::GenerationSpec,
            )),
        );
        services.insert(
            Phase::DnsValidation,
            Arc::new(PhaseEngine::new(
                Arc::clone(&runtime),
                validation::DnsValidationSpec,
            )),
        );
        services.insert(
            Phase::HttpKeywordValidation,
            Arc::new(PhaseEngine::new(
                Arc::clone(&runtime),
                validation::HttpKeywordSpec,
            )),
        );
        services.insert(
            Phase::Enrichment,
            Arc::new(PhaseEngine::new(
                Arc::clone(&runtime),
                analysis::EnrichmentSpec,
            )),
        );
        services.insert(
            Phase::Analysis,
            Arc::new(PhaseEngine::new(Arc::clone(&runtime), analysis::AnalysisSpec)),
        );
        debug_assert_eq!(services.len(), PHASE_ORDER.len());
        Self {
            services: Arc::new(services),
        }
    }

    pub fn get(&self, phase: Phase) -> Arc<dyn PhaseService> {
        Arc::clone(
            self.services
                .get(&phase)
                .expect("service registry covers every phase"),
        )
    }
}
