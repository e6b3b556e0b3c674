//! Campaign orchestrator: the persisted state machine behind every public
//! operation.
//!
//! The orchestrator is stateless in memory. Each operation reads what it
//! needs from the store, enforces the preconditions (configs present,
//! phase ordering, status transitions), delegates execution to the phase
//! services, and writes campaign-level rows under an optimistic-lock CAS
//! (retried once on conflict). Progress never flows back through here;
//! phase services publish straight onto the event bus.

pub mod chain;
pub mod validation;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::{CoreError, StoreError};
use crate::events::{Event, EventBus};
use crate::metrics::RuntimeMetrics;
use crate::phase::{CampaignMode, CampaignStateTag, PHASE_ORDER, Phase, PhaseStatus};
use crate::services::{PhaseStatusSnapshot, ServiceSet};
use crate::store::models::{Campaign, CampaignState, PhaseExecution};
use crate::store::{CampaignFilter, DbHandle, StatePatch, seed_executions};
use validation::PhaseConfig;

// ── Request / response shapes ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub user_id: Option<Uuid>,
    pub configuration: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub configuration: Option<Value>,
}

/// Campaign plus everything a dashboard wants in one round trip.
#[derive(Debug, Serialize)]
pub struct EnrichedCampaign {
    pub campaign: Campaign,
    pub state: CampaignState,
    pub executions: Vec<PhaseStatusSnapshot>,
    #[serde(rename = "configsPresent")]
    pub configs_present: Map<String, Value>,
}

// ── Orchestrator ─────────────────────────────────────────────────────

pub struct Orchestrator {
    db: DbHandle,
    bus: EventBus,
    metrics: Arc<RuntimeMetrics>,
    services: ServiceSet,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        bus: EventBus,
        metrics: Arc<RuntimeMetrics>,
        services: ServiceSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            metrics,
            services,
        })
    }

    // ── Campaign CRUD ─────────────────────────────────────────────────

    pub async fn create_campaign(
        &self,
        ctx: &RequestContext,
        req: CreateCampaignRequest,
    ) -> Result<Campaign, CoreError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "campaign name must not be empty".into(),
            ));
        }
        let id = Uuid::new_v4();
        let configuration = req.configuration.unwrap_or_else(|| json!({}));

        let mut owner = req.user_id;
        let campaign = loop {
            let attempt_owner = owner;
            let attempt_name = name.clone();
            let attempt_config = configuration.clone();
            let result = self
                .db
                .call(move |store| {
                    let campaign =
                        store.create_campaign(id, &attempt_name, attempt_owner, &json!({}))?;
                    store.create_campaign_state(id, CampaignMode::StepByStep, &attempt_config)?;
                    seed_executions(store, id)?;
                    Ok(campaign)
                })
                .await;
            match result {
                Ok(campaign) => break campaign,
                // Stale session: clear the weak owner reference and retry once.
                Err(StoreError::ForeignKey(detail)) if owner.is_some() => {
                    warn!(
                        campaign_id = %id,
                        request_id = %ctx.request_id,
                        detail,
                        "owner reference rejected, retrying without owner"
                    );
                    owner = None;
                }
                Err(e) => return Err(CoreError::from_store(e, "campaign")),
            }
        };
        info!(campaign_id = %id, request_id = %ctx.request_id, "campaign created");
        Ok(campaign)
    }

    pub async fn get_campaign(&self, id: Uuid) -> Result<Campaign, CoreError> {
        self.db
            .call(move |store| store.get_campaign(id))
            .await
            .map_err(|e| CoreError::from_store(e, "campaign"))
    }

    pub async fn list_campaigns(
        &self,
        filter: CampaignFilter,
    ) -> Result<Vec<Campaign>, CoreError> {
        self.db
            .call(move |store| store.list_campaigns(&filter))
            .await
            .map_err(|e| CoreError::from_store(e, "campaigns"))
    }

    pub async fn update_campaign(
        &self,
        _ctx: &RequestContext,
        id: Uuid,
        patch: UpdateCampaignRequest,
    ) -> Result<Campaign, CoreError> {
        let campaign = self.get_campaign(id).await?;
        let mut metadata = campaign.metadata.clone();
        if !metadata.is_object() {
            metadata = json!({});
        }
        if let Some(description) = &patch.description {
            metadata["description"] = json!(description);
        }
        if let Some(configuration) = &patch.configuration {
            metadata["configuration"] = configuration.clone();
        }
        let name = patch.name.clone();
        self.db
            .call(move |store| store.update_campaign(id, name.as_deref(), Some(&metadata)))
            .await
            .map_err(|e| CoreError::from_store(e, "campaign"))
    }

    /// Idempotent in the NotFound sense: the second delete reports the
    /// campaign gone.
    pub async fn delete_campaign(&self, ctx: &RequestContext, id: Uuid) -> Result<(), CoreError> {
        let deleted = self
            .db
            .call(move |store| store.delete_campaign(id))
            .await
            .map_err(|e| CoreError::from_store(e, "campaign"))?;
        if !deleted {
            return Err(CoreError::NotFound("campaign not found".into()));
        }
        info!(campaign_id = %id, request_id = %ctx.request_id, "campaign deleted");
        Ok(())
    }

    /// Clone a campaign: metadata, state configuration, and phase configs
    /// carry over; progress does not. The copy starts back at domain
    /// generation with fresh execution rows.
    pub async fn duplicate_campaign(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> Result<Campaign, CoreError> {
        let source = self.get_campaign(id).await?;
        let state = self.get_campaign_state(id).await?;
        let configs = self
            .db
            .call(move |store| store.list_phase_configs(id))
            .await
            .map_err(|e| CoreError::from_store(e, "phase configurations"))?;

        let copy = self
            .create_campaign(
                ctx,
                CreateCampaignRequest {
                    name: format!("{} (copy)", source.name),
                    user_id: source.user_id,
                    configuration: Some(state.configuration.clone()),
                },
            )
            .await?;
        let copy_id = copy.id;
        let metadata = source.metadata.clone();
        let mode = state.mode;
        self.db
            .call(move |store| {
                store.update_campaign(copy_id, None, Some(&metadata))?;
                let fresh = store.get_campaign_state(copy_id)?;
                store.update_campaign_state_cas(
                    copy_id,
                    fresh.version,
                    &StatePatch {
                        mode: Some(mode),
                        ..Default::default()
                    },
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::from_store(e, "campaign"))?;

        // Re-run each stored config through its service so the execution
        // rows come up `configured` like the source's once were.
        for (phase, raw) in configs {
            let config = PhaseConfig::validate(phase, &raw)?;
            let canonical = config.canonical_json();
            self.db
                .call(move |store| store.upsert_phase_config(copy_id, phase, &canonical))
                .await
                .map_err(|e| CoreError::from_store(e, "phase configuration"))?;
            self.services
                .get(phase)
                .configure(ctx, copy_id, &config)
                .await?;
        }
        self.get_campaign(copy_id).await
    }

    pub async fn enriched_campaign(&self, id: Uuid) -> Result<EnrichedCampaign, CoreError> {
        let campaign = self.get_campaign(id).await?;
        let state = self.get_campaign_state(id).await?;
        let executions = self.list_phase_executions(id).await?;
        let configured = self
            .db
            .call(move |store| store.configured_phases(id))
            .await
            .map_err(|e| CoreError::from_store(e, "phase configurations"))?;
        let configs_present = PHASE_ORDER
            .iter()
            .map(|phase| {
                (
                    phase.wire_name().to_string(),
                    json!(configured.contains(phase)),
                )
            })
            .collect();
        Ok(EnrichedCampaign {
            campaign,
            state,
            executions: executions.into_iter().map(Into::into).collect(),
            configs_present,
        })
    }

    // ── Campaign state row ────────────────────────────────────────────

    pub async fn get_campaign_state(&self, id: Uuid) -> Result<CampaignState, CoreError> {
        self.db
            .call(move |store| store.get_campaign_state(id))
            .await
            .map_err(|e| CoreError::from_store(e, "campaign state"))
    }

    /// PUT semantics over the state row; still CAS-protected against
    /// concurrent writers.
    pub async fn replace_campaign_state(
        &self,
        _ctx: &RequestContext,
        id: Uuid,
        current_state: CampaignStateTag,
        mode: CampaignMode,
        configuration: Value,
    ) -> Result<CampaignState, CoreError> {
        self.update_state_with_retry(
            id,
            StatePatch {
                current_state: Some(current_state),
                mode: Some(mode),
                configuration: Some(configuration),
            },
        )
        .await
    }

    pub async fn delete_campaign_state(&self, id: Uuid) -> Result<(), CoreError> {
        let deleted = self
            .db
            .call(move |store| store.delete_campaign_state(id))
            .await
            .map_err(|e| CoreError::from_store(e, "campaign state"))?;
        if !deleted {
            return Err(CoreError::NotFound("campaign state not found".into()));
        }
        Ok(())
    }

    pub async fn set_mode(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        mode_raw: &str,
    ) -> Result<CampaignMode, CoreError> {
        let mode = CampaignMode::from_str(mode_raw).map_err(CoreError::InvalidArgument)?;
        self.get_campaign(id).await?;
        self.update_state_with_retry(
            id,
            StatePatch {
                mode: Some(mode),
                ..Default::default()
            },
        )
        .await?;
        self.metrics.mode_changes.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            ctx,
            Some(id),
            Event::ModeChanged {
                mode: mode.as_str(),
            },
        );
        info!(campaign_id = %id, mode = mode.as_str(), request_id = %ctx.request_id, "mode changed");
        Ok(mode)
    }

    /// CAS with a single retry; concurrent writers past that surface
    /// `Conflict` to the caller.
    async fn update_state_with_retry(
        &self,
        id: Uuid,
        patch: StatePatch,
    ) -> Result<CampaignState, CoreError> {
        for attempt in 0..2 {
            let state = self.get_campaign_state(id).await?;
            let attempt_patch = patch.clone();
            match self
                .db
                .call(move |store| {
                    store.update_campaign_state_cas(id, state.version, &attempt_patch)
                })
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict) if attempt == 0 => continue,
                Err(e) => return Err(CoreError::from_store(e, "campaign state")),
            }
        }
        Err(CoreError::Conflict(
            "campaign state was modified concurrently".into(),
        ))
    }

    // ── Phase operations ──────────────────────────────────────────────

    pub async fn configure_phase(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        phase: Phase,
        raw: &Value,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.get_campaign(id).await?;
        let execution = self.get_execution(id, phase).await?;
        if !execution.status.can_configure() {
            return Err(CoreError::Conflict(format!(
                "cannot configure {} while it is {}",
                phase.wire_name(),
                execution.status.as_str()
            )));
        }

        // Validation failures leave the stored config row untouched.
        let config = PhaseConfig::validate(phase, raw)?;
        let canonical = config.canonical_json();
        self.db
            .call(move |store| store.upsert_phase_config(id, phase, &canonical))
            .await
            .map_err(|e| CoreError::from_store(e, "phase configuration"))?;

        let snapshot = self.services.get(phase).configure(ctx, id, &config).await?;
        self.metrics
            .phase_config_updates
            .fetch_add(1, Ordering::Relaxed);

        // First configuration moves a draft campaign into `configuring`;
        // best-effort, a concurrent writer is not an error here.
        if let Ok(state) = self.get_campaign_state(id).await {
            if matches!(
                state.current_state,
                CampaignStateTag::Draft | CampaignStateTag::Failed
            ) {
                let _ = self
                    .update_state_with_retry(
                        id,
                        StatePatch {
                            current_state: Some(CampaignStateTag::Configuring),
                            ..Default::default()
                        },
                    )
                    .await;
            }
        }
        info!(
            campaign_id = %id,
            phase = phase.wire_name(),
            request_id = %ctx.request_id,
            "phase configured"
        );
        Ok(snapshot)
    }

    /// Manual start from the HTTP layer: never inferred as an auto start.
    pub async fn start_phase(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        phase: Phase,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.start_phase_inner(ctx, id, phase, false).await
    }

    pub(crate) async fn start_phase_inner(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        phase: Phase,
        is_auto_start: bool,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.get_campaign(id).await?;
        let state = self.get_campaign_state(id).await?;
        let executions = self.list_phase_executions(id).await?;

        let execution = executions
            .iter()
            .find(|e| e.phase == phase)
            .ok_or_else(|| CoreError::NotFound("phase execution not found".into()))?;
        match execution.status {
            PhaseStatus::Configured | PhaseStatus::Ready => {}
            PhaseStatus::Running => {
                return Err(CoreError::Conflict(format!(
                    "{} is already running",
                    phase.wire_name()
                )));
            }
            other => {
                return Err(CoreError::Conflict(format!(
                    "{} is {}, configure it before starting",
                    phase.wire_name(),
                    other.as_str()
                )));
            }
        }

        // Full-sequence runs demand the whole prior chain be configured up
        // front; no partial starts. Checked before the completion gate so
        // the caller learns every missing config in one round trip.
        if state.mode == CampaignMode::FullSequence {
            let configured = self
                .db
                .call(move |store| store.configured_phases(id))
                .await
                .map_err(|e| CoreError::from_store(e, "phase configurations"))?;
            let missing: Vec<Phase> = phase
                .prior_phases()
                .iter()
                .filter(|p| !configured.contains(p))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::MissingPhaseConfigs { missing });
            }
        }

        // Fixed-order gate: every prior phase must have completed.
        for prior in phase.prior_phases() {
            let prior_execution = executions
                .iter()
                .find(|e| e.phase == *prior)
                .ok_or_else(|| CoreError::NotFound("phase execution not found".into()))?;
            if prior_execution.status != PhaseStatus::Completed {
                return Err(CoreError::Conflict(format!(
                    "prior phase {} is {}, not completed",
                    prior.wire_name(),
                    prior_execution.status.as_str()
                )));
            }
        }

        let snapshot = self
            .services
            .get(phase)
            .start(ctx, id, is_auto_start)
            .await?;

        self.metrics.phase_starts.fetch_add(1, Ordering::Relaxed);
        if is_auto_start {
            self.metrics
                .phase_auto_starts
                .fetch_add(1, Ordering::Relaxed);
        }
        // Campaign-level state follows the first running phase.
        if state.current_state != CampaignStateTag::Running {
            let _ = self
                .update_state_with_retry(
                    id,
                    StatePatch {
                        current_state: Some(CampaignStateTag::Running),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(snapshot)
    }

    /// Start without the prior-phase-completed gate; the phase was already
    /// in flight when this process took over.
    pub async fn resume_phase(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        phase: Phase,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.get_campaign(id).await?;
        self.services.get(phase).resume(ctx, id).await
    }

    pub async fn get_phase_status(
        &self,
        id: Uuid,
        phase: Phase,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.get_campaign(id).await?;
        self.services.get(phase).get_status(id).await
    }

    pub async fn cancel_phase(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        phase: Phase,
    ) -> Result<PhaseStatusSnapshot, CoreError> {
        self.get_campaign(id).await?;
        self.services.get(phase).cancel(ctx, id).await
    }

    pub async fn list_phase_configs(&self, id: Uuid) -> Result<Map<String, Value>, CoreError> {
        self.get_campaign(id).await?;
        let configs = self
            .db
            .call(move |store| store.list_phase_configs(id))
            .await
            .map_err(|e| CoreError::from_store(e, "phase configurations"))?;
        Ok(configs
            .into_iter()
            .map(|(phase, value)| (phase.wire_name().to_string(), value))
            .collect())
    }

    pub async fn list_phase_executions(
        &self,
        id: Uuid,
    ) -> Result<Vec<PhaseExecution>, CoreError> {
        self.get_campaign(id).await?;
        self.db
            .call(move |store| store.list_executions(id))
            .await
            .map_err(|e| CoreError::from_store(e, "phase executions"))
    }

    async fn get_execution(&self, id: Uuid, phase: Phase) -> Result<PhaseExecution, CoreError> {
        self.db
            .call(move |store| store.get_execution(id, phase))
            .await
            .map_err(|e| CoreError::from_store(e, "phase execution"))
    }

    // ── Completion handling (driven by the chain runner) ──────────────

    /// React to a completed phase: auto-advance in full-sequence mode, or
    /// promote the campaign when the final phase lands.
    pub(crate) async fn handle_phase_completed(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        completed: Phase,
    ) {
        if completed == Phase::Analysis {
            self.promote_campaign_completed(ctx, id).await;
            return;
        }
        let state = match self.get_campaign_state(id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(campaign_id = %id, error = %e, "completion handling skipped");
                return;
            }
        };
        if state.mode != CampaignMode::FullSequence {
            return;
        }
        let Some(next) = completed.next() else { return };

        let configured = match self.db.call(move |store| store.configured_phases(id)).await {
            Ok(configured) => configured,
            Err(e) => {
                warn!(campaign_id = %id, error = %e, "completion handling skipped");
                return;
            }
        };
        if !configured.contains(&next) {
            // Halt the chain; the client reconfigures and restarts manually.
            let missing: Vec<Phase> = PHASE_ORDER[next.index()..]
                .iter()
                .filter(|p| !configured.contains(p))
                .copied()
                .collect();
            self.metrics.chain_blocked.fetch_add(1, Ordering::Relaxed);
            warn!(
                campaign_id = %id,
                after = completed.wire_name(),
                missing = ?missing.iter().map(|p| p.wire_name()).collect::<Vec<_>>(),
                "chain blocked on missing configurations"
            );
            self.bus
                .publish(ctx, Some(id), Event::chain_blocked(completed, &missing));
            return;
        }

        if let Err(e) = self.start_phase_inner(ctx, id, next, true).await {
            warn!(
                campaign_id = %id,
                phase = next.wire_name(),
                error = %e,
                "auto-start failed, chain stopped"
            );
        }
    }

    async fn promote_campaign_completed(&self, ctx: &RequestContext, id: Uuid) {
        let result = self
            .update_state_with_retry(
                id,
                StatePatch {
                    current_state: Some(CampaignStateTag::Completed),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            warn!(campaign_id = %id, error = %e, "failed to promote campaign state");
        }
        let _ = self
            .db
            .call(move |store| store.mark_campaign_completed(id))
            .await;
        info!(campaign_id = %id, "campaign completed");
        self.bus.publish(ctx, Some(id), Event::CampaignCompleted {});
        // Post-completion hook: a summary snapshot for subscribers.
        if let Ok(counters) = self
            .db
            .call(move |store| store.aggregate_domain_counters(id))
            .await
        {
            self.bus.publish(
                ctx,
                Some(id),
                Event::System {
                    name: "campaign.summary".into(),
                    payload: json!({
                        "total": counters.total,
                        "dns": counters.dns,
                        "http": counters.http,
                        "lead": counters.lead,
                    }),
                },
            );
        }
    }

    /// A failed phase pins the campaign state to `failed` until a client
    /// reconfigures (which moves it back to `configuring`).
    pub(crate) async fn handle_phase_failed(&self, _ctx: &RequestContext, id: Uuid) {
        let _ = self
            .update_state_with_retry(
                id,
                StatePatch {
                    current_state: Some(CampaignStateTag::Failed),
                    ..Default::default()
                },
            )
            .await;
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceRuntime;
    use crate::services::probe::AcceptAllBackend;
    use crate::store::CampaignStore;

    fn orchestrator() -> Arc<Orchestrator> {
        let db = DbHandle::new(CampaignStore::in_memory().unwrap());
        let bus = EventBus::new();
        let metrics = RuntimeMetrics::new();
        let runtime = ServiceRuntime::new(
            db.clone(),
            bus.clone(),
            Arc::clone(&metrics),
            Arc::new(AcceptAllBackend),
        );
        let services = ServiceSet::build(runtime);
        Orchestrator::new(db, bus, metrics, services)
    }

    fn ctx() -> RequestContext {
        RequestContext::internal()
    }

    async fn draft_campaign(orch: &Orchestrator) -> Campaign {
        orch.create_campaign(
            &ctx(),
            CreateCampaignRequest {
                name: "test-campaign".into(),
                user_id: None,
                configuration: None,
            },
        )
        .await
        .unwrap()
    }

    fn generation_config() -> Value {
        json!({
            "characterSet": "abc", "tld": "com", "numDomains": 3,
            "patternType": "prefix", "variableLength": 1
        })
    }

    #[tokio::test]
    async fn test_create_campaign_seeds_state_and_executions() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        assert_eq!(campaign.current_phase, Phase::DomainGeneration);

        let state = orch.get_campaign_state(campaign.id).await.unwrap();
        assert_eq!(state.current_state, CampaignStateTag::Draft);
        assert_eq!(state.mode, CampaignMode::StepByStep);

        let executions = orch.list_phase_executions(campaign.id).await.unwrap();
        assert_eq!(executions.len(), 5);
        assert!(
            executions
                .iter()
                .all(|e| e.status == PhaseStatus::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_create_campaign_rejects_empty_name() {
        let orch = orchestrator();
        let err = orch
            .create_campaign(
                &ctx(),
                CreateCampaignRequest {
                    name: "   ".into(),
                    user_id: None,
                    configuration: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_campaign_clears_stale_owner() {
        let orch = orchestrator();
        // Owner does not exist; the create must self-heal by clearing it.
        let campaign = orch
            .create_campaign(
                &ctx(),
                CreateCampaignRequest {
                    name: "orphaned".into(),
                    user_id: Some(Uuid::new_v4()),
                    configuration: None,
                },
            )
            .await
            .unwrap();
        assert!(campaign.user_id.is_none());
    }

    #[tokio::test]
    async fn test_set_mode_validates_and_bumps_version() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;

        let err = orch.set_mode(&ctx(), campaign.id, "turbo").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));

        orch.set_mode(&ctx(), campaign.id, "full_sequence")
            .await
            .unwrap();
        let state = orch.get_campaign_state(campaign.id).await.unwrap();
        assert_eq!(state.mode, CampaignMode::FullSequence);
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_and_keeps_row_unchanged() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.configure_phase(&ctx(), campaign.id, Phase::DomainGeneration, &generation_config())
            .await
            .unwrap();

        // extraction config missing keywords: InvalidConfig, nothing stored.
        let err = orch
            .configure_phase(
                &ctx(),
                campaign.id,
                Phase::HttpKeywordValidation,
                &json!({"personaIds": [Uuid::new_v4().to_string()], "keywords": []}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        let configs = orch.list_phase_configs(campaign.id).await.unwrap();
        assert!(configs.contains_key("discovery"));
        assert!(!configs.contains_key("extraction"));
        let status = orch
            .get_phase_status(campaign.id, Phase::HttpKeywordValidation)
            .await
            .unwrap();
        assert_eq!(status.status, PhaseStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        let err = orch
            .start_phase(&ctx(), campaign.id, Phase::DomainGeneration)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_start_requires_prior_phases_completed() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.configure_phase(
            &ctx(),
            campaign.id,
            Phase::DnsValidation,
            &json!({"personaIds": [Uuid::new_v4().to_string()]}),
        )
        .await
        .unwrap();

        let err = orch
            .start_phase(&ctx(), campaign.id, Phase::DnsValidation)
            .await
            .unwrap_err();
        let CoreError::Conflict(message) = err else {
            panic!("expected conflict");
        };
        assert!(message.contains("discovery"));
    }

    #[tokio::test]
    async fn test_full_sequence_start_reports_missing_prior_configs() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.set_mode(&ctx(), campaign.id, "full_sequence")
            .await
            .unwrap();
        // Only analysis configured; starting it must name every missing prior.
        orch.configure_phase(
            &ctx(),
            campaign.id,
            Phase::Analysis,
            &json!({"personaIds": [Uuid::new_v4().to_string()]}),
        )
        .await
        .unwrap();

        let err = orch
            .start_phase(&ctx(), campaign.id, Phase::Analysis)
            .await
            .unwrap_err();
        let CoreError::MissingPhaseConfigs { missing } = err else {
            panic!("expected MissingPhaseConfigs, got {:?}", err);
        };
        assert_eq!(
            missing,
            vec![
                Phase::DomainGeneration,
                Phase::DnsValidation,
                Phase::HttpKeywordValidation,
                Phase::Enrichment
            ]
        );
        // No side effects persisted.
        let status = orch
            .get_phase_status(campaign.id, Phase::Analysis)
            .await
            .unwrap();
        assert_eq!(status.status, PhaseStatus::Configured);
    }

    #[tokio::test]
    async fn test_configure_twice_is_idempotent_on_snapshot() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        let first = orch
            .configure_phase(&ctx(), campaign.id, Phase::DomainGeneration, &generation_config())
            .await
            .unwrap();
        let second = orch
            .configure_phase(&ctx(), campaign.id, Phase::DomainGeneration, &generation_config())
            .await
            .unwrap();
        assert_eq!(first.configuration, second.configuration);
        assert_eq!(second.status, PhaseStatus::Configured);
    }

    #[tokio::test]
    async fn test_delete_campaign_idempotent_via_not_found() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.delete_campaign(&ctx(), campaign.id).await.unwrap();
        let err = orch.delete_campaign(&ctx(), campaign.id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_resets_progress_and_keeps_configs() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.set_mode(&ctx(), campaign.id, "full_sequence")
            .await
            .unwrap();
        orch.configure_phase(&ctx(), campaign.id, Phase::DomainGeneration, &generation_config())
            .await
            .unwrap();

        let copy = orch.duplicate_campaign(&ctx(), campaign.id).await.unwrap();
        assert_ne!(copy.id, campaign.id);
        assert!(copy.name.contains("copy"));
        assert_eq!(copy.current_phase, Phase::DomainGeneration);
        assert!(copy.started_at.is_none());
        assert!(copy.completed_at.is_none());

        let state = orch.get_campaign_state(copy.id).await.unwrap();
        assert_eq!(state.mode, CampaignMode::FullSequence);

        let configs = orch.list_phase_configs(copy.id).await.unwrap();
        assert!(configs.contains_key("discovery"));
        let status = orch
            .get_phase_status(copy.id, Phase::DomainGeneration)
            .await
            .unwrap();
        assert_eq!(status.status, PhaseStatus::Configured);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let orch = orchestrator();
        let campaign = draft_campaign(&orch).await;
        orch.configure_phase(&ctx(), campaign.id, Phase::DomainGeneration, &generation_config())
            .await
            .unwrap();

        let first = orch
            .cancel_phase(&ctx(), campaign.id, Phase::DomainGeneration)
            .await
            .unwrap();
        assert_eq!(first.status, PhaseStatus::Failed);
        let second = orch
            .cancel_phase(&ctx(), campaign.id, Phase::DomainGeneration)
            .await
            .unwrap();
        assert_eq!(second.status, PhaseStatus::Failed);
        assert_eq!(second.last_error.unwrap()["reason"], "cancelled");
    }
}
