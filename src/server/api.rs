//! HTTP/JSON adapter over the orchestrator. Thin by design: decode the
//! request, build the `RequestContext`, call the core, encode the result.
//! Error bodies always carry `{code, message, timestamp, request_id}`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::HeaderName},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::aggregates::{AggregateKind, AggregatesCache};
use crate::allocator::{OffsetAllocator, PatternParams, PatternType};
use crate::bulk::BulkTracker;
use crate::context::RequestContext;
use crate::errors::{CoreError, ErrorBody};
use crate::events::EventBus;
use crate::metrics::RuntimeMetrics;
use crate::orchestrator::{CreateCampaignRequest, Orchestrator, UpdateCampaignRequest};
use crate::phase::{CampaignMode, CampaignStateTag, Phase};
use crate::reconciler::counters_or_rebuild;
use crate::store::models::DomainResultStatus;
use crate::store::{DbHandle, DomainCursor, DomainFilters, DomainQuery, DomainSort};

// ── Shared application state ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    pub advanced_filters: bool,
    pub server_sort: bool,
}

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub db: DbHandle,
    pub bus: EventBus,
    pub metrics: Arc<RuntimeMetrics>,
    pub allocator: OffsetAllocator,
    pub aggregates: Arc<AggregatesCache>,
    pub bulk: Arc<BulkTracker>,
    pub flags: FeatureFlags,
}

pub type SharedState = Arc<AppState>;

static SORT_VERSION_HEADER: HeaderName = HeaderName::from_static("x-domains-sort-version");

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCampaignBody {
    pub name: String,
    #[serde(default, alias = "userId")]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

#[derive(Deserialize, Default)]
pub struct UpdateCampaignBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub configuration: Option<Value>,
}

#[derive(Deserialize)]
pub struct SetModeBody {
    pub mode: String,
}

#[derive(Deserialize)]
pub struct ConfigureBody {
    pub configuration: Value,
}

#[derive(Deserialize)]
pub struct PutStateBody {
    #[serde(default, rename = "currentState", alias = "current_state")]
    pub current_state_raw: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub configuration: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternOffsetBody {
    #[serde(default, alias = "pattern_type")]
    pub pattern_type: Option<String>,
    #[serde(default, alias = "variable_length")]
    pub variable_length: Option<i64>,
    #[serde(default, alias = "prefix_variable_length")]
    pub prefix_variable_length: Option<i64>,
    #[serde(default, alias = "suffix_variable_length")]
    pub suffix_variable_length: Option<i64>,
    #[serde(alias = "character_set")]
    pub character_set: String,
    #[serde(default, alias = "constant_string")]
    pub constant_string: Option<String>,
    pub tld: String,
}

#[derive(Deserialize)]
pub struct BulkGenerateBody {
    pub operations: Vec<BulkGenerateItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkGenerateItem {
    #[serde(alias = "campaign_id")]
    pub campaign_id: Uuid,
    #[serde(default)]
    pub configuration: Option<Value>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub cursor: Option<String>,
    #[serde(alias = "dns_status")]
    pub dns_status: Option<String>,
    #[serde(alias = "http_status")]
    pub http_status: Option<String>,
    #[serde(alias = "dns_reason")]
    pub dns_reason: Option<String>,
    #[serde(alias = "http_reason")]
    pub http_reason: Option<String>,
    #[serde(alias = "min_score")]
    pub min_score: Option<f64>,
    #[serde(alias = "not_parked")]
    pub not_parked: Option<bool>,
    #[serde(alias = "has_contact")]
    pub has_contact: Option<bool>,
    pub keyword: Option<String>,
    #[serde(alias = "sort_by")]
    pub sort_by: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListCampaignsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(alias = "phase_status")]
    pub phase_status: Option<String>,
    pub phase: Option<String>,
    #[serde(alias = "user_id")]
    pub user_id: Option<Uuid>,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError {
    error: CoreError,
    request_id: String,
}

impl ApiError {
    fn of(error: CoreError, ctx: &RequestContext) -> Self {
        Self {
            error,
            request_id: ctx.request_id.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            CoreError::InvalidArgument(_) | CoreError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::MissingPhaseConfigs { .. } => {
                StatusCode::CONFLICT
            }
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody::new(&self.error, &self.request_id);
        (status, Json(body)).into_response()
    }
}

/// Context from the adapter headers; correlation ids are passed through,
/// never synthesized from request contents.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok());
    RequestContext::new(request_id, user_id)
}

fn parse_campaign_id(raw: &str, ctx: &RequestContext) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::of(
            CoreError::InvalidArgument(format!("invalid campaign id: {}", raw)),
            ctx,
        )
    })
}

fn parse_phase(raw: &str, ctx: &RequestContext) -> Result<Phase, ApiError> {
    Phase::from_wire_name(raw)
        .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), ctx))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/campaigns/domain-generation/pattern-offset",
            post(pattern_offset),
        )
        .route("/campaigns/bulk/domains/generate", post(bulk_generate))
        .route("/campaigns/bulk/operations/{op_id}", get(bulk_operation))
        .route(
            "/campaigns/{id}",
            get(get_campaign)
                .patch(update_campaign)
                .delete(delete_campaign),
        )
        .route("/campaigns/{id}/mode", patch(set_mode))
        .route("/campaigns/{id}/configs", get(list_configs))
        .route(
            "/campaigns/{id}/phase/{phase}/configure",
            post(configure_phase),
        )
        .route("/campaigns/{id}/phase/{phase}/start", post(start_phase))
        .route("/campaigns/{id}/phase/{phase}/stop", post(stop_phase))
        .route("/campaigns/{id}/phase/{phase}/status", get(phase_status))
        .route("/campaigns/{id}/phase-executions", get(phase_executions))
        .route(
            "/campaigns/{id}/phase-executions/{phase}",
            get(phase_execution),
        )
        .route(
            "/campaigns/{id}/state",
            get(get_state).put(put_state).delete(delete_state),
        )
        .route("/campaigns/{id}/enriched", get(enriched))
        .route("/campaigns/{id}/domains", get(list_domains))
        .route("/campaigns/{id}/duplicate", post(duplicate))
        .route("/campaigns/{id}/funnel", get(funnel))
        .route("/campaigns/{id}/classifications", get(classifications))
        .route("/campaigns/{id}/momentum", get(momentum))
        .route("/campaigns/{id}/status", get(status_aggregate))
        .route("/campaigns/{id}/metrics", get(metrics_aggregate))
        .route(
            "/campaigns/{id}/insights/recommendations",
            get(recommendations),
        )
        .route("/events", get(super::sse::events_handler))
        .route("/metrics", get(runtime_metrics))
        .route("/health", get(health))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn runtime_metrics(State(state): State<SharedState>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn list_campaigns(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListCampaignsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let mut filter = crate::store::CampaignFilter {
        limit: query.limit.unwrap_or(100).clamp(1, 500),
        offset: query.offset.unwrap_or(0).max(0),
        user_id: query.user_id,
        ..Default::default()
    };
    if let Some(raw) = &query.phase {
        filter.current_phase = Some(parse_phase(raw, &ctx)?);
    }
    if let Some(raw) = &query.phase_status {
        filter.phase_status = Some(
            crate::phase::PhaseStatus::from_str(raw)
                .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?,
        );
    }
    let campaigns = state
        .orchestrator
        .list_campaigns(filter)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(campaigns))
}

async fn create_campaign(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateCampaignBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let campaign = state
        .orchestrator
        .create_campaign(
            &ctx,
            CreateCampaignRequest {
                name: body.name,
                user_id: body.user_id.or(ctx.user_id),
                configuration: body.configuration,
            },
        )
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_campaign(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let campaign = state
        .orchestrator
        .get_campaign(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(campaign))
}

async fn update_campaign(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateCampaignBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let campaign = state
        .orchestrator
        .update_campaign(
            &ctx,
            id,
            UpdateCampaignRequest {
                name: body.name,
                description: body.description,
                configuration: body.configuration,
            },
        )
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(campaign))
}

async fn delete_campaign(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    state
        .orchestrator
        .delete_campaign(&ctx, id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_mode(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SetModeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let mode = state
        .orchestrator
        .set_mode(&ctx, id, &body.mode)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(json!({"mode": mode.as_str()})))
}

async fn list_configs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let configs = state
        .orchestrator
        .list_phase_configs(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(Value::Object(configs)))
}

async fn configure_phase(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
    Json(body): Json<ConfigureBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let phase = parse_phase(&phase, &ctx)?;
    let snapshot = state
        .orchestrator
        .configure_phase(&ctx, id, phase, &body.configuration)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(snapshot))
}

async fn start_phase(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let phase = parse_phase(&phase, &ctx)?;
    let snapshot = state
        .orchestrator
        .start_phase(&ctx, id, phase)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(snapshot))
}

async fn stop_phase(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let phase = parse_phase(&phase, &ctx)?;
    let snapshot = state
        .orchestrator
        .cancel_phase(&ctx, id, phase)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(snapshot))
}

async fn phase_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let phase = parse_phase(&phase, &ctx)?;
    let snapshot = state
        .orchestrator
        .get_phase_status(id, phase)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(snapshot))
}

async fn phase_executions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let executions = state
        .orchestrator
        .list_phase_executions(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(executions))
}

async fn phase_execution(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let phase = parse_phase(&phase, &ctx)?;
    let executions = state
        .orchestrator
        .list_phase_executions(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    let execution = executions
        .into_iter()
        .find(|e| e.phase == phase)
        .ok_or_else(|| {
            ApiError::of(CoreError::NotFound("phase execution not found".into()), &ctx)
        })?;
    Ok(Json(execution))
}

async fn get_state(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let row = state
        .orchestrator
        .get_campaign_state(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(row))
}

async fn put_state(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PutStateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let current = state
        .orchestrator
        .get_campaign_state(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    let current_state = match &body.current_state_raw {
        Some(raw) => CampaignStateTag::from_str(raw)
            .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?,
        None => current.current_state,
    };
    let mode = match &body.mode {
        Some(raw) => CampaignMode::from_str(raw)
            .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?,
        None => current.mode,
    };
    let configuration = if body.configuration.is_null() {
        current.configuration.clone()
    } else {
        body.configuration
    };
    let row = state
        .orchestrator
        .replace_campaign_state(&ctx, id, current_state, mode, configuration)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(row))
}

async fn delete_state(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    state
        .orchestrator
        .delete_campaign_state(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enriched(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let enriched = state
        .orchestrator
        .enriched_campaign(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(enriched))
}

async fn duplicate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    let copy = state
        .orchestrator
        .duplicate_campaign(&ctx, id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn list_domains(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DomainsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let id = parse_campaign_id(&id, &ctx)?;
    state
        .orchestrator
        .get_campaign(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;

    let mut filters = DomainFilters {
        keyword: query.keyword.clone(),
        ..Default::default()
    };
    if let Some(raw) = &query.dns_status {
        filters.dns_status = Some(
            DomainResultStatus::from_str(raw)
                .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?,
        );
    }
    if let Some(raw) = &query.http_status {
        filters.http_status = Some(
            DomainResultStatus::from_str(raw)
                .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?,
        );
    }
    filters.dns_reason = query.dns_reason.clone();
    filters.http_reason = query.http_reason.clone();
    // Experimental filters stay behind their flag.
    if state.flags.advanced_filters {
        filters.min_score = query.min_score;
        filters.not_parked = query.not_parked.unwrap_or(false);
        filters.has_contact = query.has_contact.unwrap_or(false);
    }

    let mut sort = DomainSort::OffsetAsc;
    let mut sort_active = false;
    if state.flags.server_sort {
        if let Some(raw) = &query.sort_by {
            sort = DomainSort::from_str(raw)
                .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?;
            sort_active = true;
            state
                .metrics
                .counter("domains_sort_requests")
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    let cursor = query
        .cursor
        .as_deref()
        .map(DomainCursor::decode)
        .transpose()
        .map_err(|message| ApiError::of(CoreError::InvalidArgument(message), &ctx))?;

    let domain_query = DomainQuery {
        filters,
        sort,
        limit: query.limit.unwrap_or(100),
        offset: query.offset,
        cursor,
    };
    let page = state
        .db
        .call(move |store| store.list_domains(id, &domain_query))
        .await
        .map_err(|e| ApiError::of(CoreError::from_store(e, "generated domains"), &ctx))?;

    // The counters row backs the aggregates block; rebuild it on miss.
    let counters = counters_or_rebuild(&state.db, id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;

    let body = json!({
        "items": page.items,
        "nextCursor": page.next_cursor,
        "total": counters.total,
        "aggregates": {
            "dns": counters.dns,
            "http": counters.http,
            "lead": counters.lead,
        },
    });
    let mut response = Json(body).into_response();
    if sort_active {
        response
            .headers_mut()
            .insert(SORT_VERSION_HEADER.clone(), "1".parse().expect("static header"));
    }
    Ok(response)
}

async fn pattern_offset(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<PatternOffsetBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let params = pattern_params_from(&body).map_err(|e| ApiError::of(e, &ctx))?;
    let hash = params.config_hash();
    let current_offset = state
        .allocator
        .peek(&hash)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(json!({
        "configHash": hash,
        "currentOffset": current_offset,
    })))
}

fn pattern_params_from(body: &PatternOffsetBody) -> Result<PatternParams, CoreError> {
    let character_set = body.character_set.trim().to_string();
    if character_set.is_empty() {
        return Err(CoreError::InvalidArgument(
            "character_set must not be empty".into(),
        ));
    }
    let tld = body.tld.trim().trim_start_matches('.').to_lowercase();
    if tld.is_empty() {
        return Err(CoreError::InvalidArgument("tld must not be empty".into()));
    }
    let pattern_type = match &body.pattern_type {
        Some(raw) => PatternType::from_str(raw).map_err(CoreError::InvalidArgument)?,
        None => PatternType::Prefix,
    };
    let fallback = body.variable_length.unwrap_or(0);
    Ok(PatternParams {
        pattern_type,
        prefix_variable_length: body.prefix_variable_length.unwrap_or(fallback).max(0),
        suffix_variable_length: body.suffix_variable_length.unwrap_or(fallback).max(0),
        character_set,
        constant_string: body.constant_string.clone().unwrap_or_default(),
        tld,
    })
}

async fn bulk_generate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<BulkGenerateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    if body.operations.is_empty() {
        return Err(ApiError::of(
            CoreError::InvalidArgument("operations must not be empty".into()),
            &ctx,
        ));
    }
    let campaign_ids: Vec<Uuid> = body.operations.iter().map(|op| op.campaign_id).collect();
    let op_id = state.bulk.new_operation("domain_generation", &campaign_ids);

    // Per-item failures are recorded, not rolled back.
    for item in &body.operations {
        let result = async {
            if let Some(configuration) = &item.configuration {
                state
                    .orchestrator
                    .configure_phase(&ctx, item.campaign_id, Phase::DomainGeneration, configuration)
                    .await?;
            }
            state
                .orchestrator
                .start_phase(&ctx, item.campaign_id, Phase::DomainGeneration)
                .await
        }
        .await;
        match result {
            Ok(_) => state.bulk.mark_started(op_id, item.campaign_id),
            Err(e) => state.bulk.mark_failed(op_id, item.campaign_id, &e.to_string()),
        }
    }

    let operation = state.bulk.get(op_id).expect("operation registered above");
    Ok((StatusCode::ACCEPTED, Json(operation.to_json())))
}

async fn bulk_operation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(op_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = request_context(&headers);
    let operation = state.bulk.get(op_id).ok_or_else(|| {
        ApiError::of(CoreError::NotFound("bulk operation not found".into()), &ctx)
    })?;
    Ok(Json(operation.to_json()))
}

// ── Aggregate endpoints ───────────────────────────────────────────────

async fn aggregate(
    state: &SharedState,
    headers: &HeaderMap,
    id: String,
    kind: AggregateKind,
) -> Result<Json<Value>, ApiError> {
    let ctx = request_context(headers);
    let id = parse_campaign_id(&id, &ctx)?;
    state
        .orchestrator
        .get_campaign(id)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    let value = state
        .aggregates
        .get(id, kind)
        .await
        .map_err(|e| ApiError::of(e, &ctx))?;
    Ok(Json(value))
}

async fn funnel(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Funnel).await
}

async fn classifications(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Classifications).await
}

async fn momentum(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Momentum).await
}

async fn status_aggregate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Status).await
}

async fn metrics_aggregate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Metrics).await
}

async fn recommendations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    aggregate(&state, &headers, id, AggregateKind::Recommendations).await
}
