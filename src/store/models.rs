use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::phase::{CampaignMode, CampaignStateTag, Phase, PhaseStatus};

// ── Per-domain result statuses ───────────────────────────────────────

/// Outcome of a validation pass (DNS or HTTP) for one domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DomainResultStatus {
    Pending,
    Ok,
    Error,
    Timeout,
}

impl DomainResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid result status: {}", s)),
        }
    }
}

/// Lead classification for one domain; extends the result statuses with
/// match/no-match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Match,
    NoMatch,
    Error,
    Timeout,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Match => "match",
            Self::NoMatch => "no_match",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "match" => Ok(Self::Match),
            "no_match" => Ok(Self::NoMatch),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid lead status: {}", s)),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub user_id: Option<Uuid>,
    pub current_phase: Phase,
    pub phase_status: PhaseStatus,
    pub metadata: Value,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignState {
    pub campaign_id: Uuid,
    pub current_state: CampaignStateTag,
    pub mode: CampaignMode,
    pub configuration: Value,
    pub version: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub failed_at: Option<String>,
    pub completed_at: Option<String>,
    pub items_total: i64,
    pub items_processed: i64,
    pub items_successful: i64,
    pub items_failed: i64,
    pub progress_pct: f64,
    pub configuration: Option<Value>,
    pub error_details: Option<Value>,
    pub metrics: Option<Value>,
    pub is_auto_start: bool,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDomain {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub offset_index: i64,
    pub created_at: String,
    pub dns_status: DomainResultStatus,
    pub dns_reason: Option<String>,
    pub http_status: DomainResultStatus,
    pub http_reason: Option<String>,
    pub lead_status: LeadStatus,
    pub domain_score: Option<f64>,
    pub features: Option<Value>,
    pub last_http_fetched_at: Option<String>,
}

/// Per-status counts for a validation pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultBreakdown {
    pub pending: i64,
    pub ok: i64,
    pub error: i64,
    pub timeout: i64,
}

/// Per-status counts for lead classification.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadBreakdown {
    pub pending: i64,
    #[serde(rename = "match")]
    pub matched: i64,
    pub no_match: i64,
    pub error: i64,
    pub timeout: i64,
}

/// Materialized per-campaign domain counters. Best-effort maintained by
/// workers; the reconciler rebuilds it from `generated_domains` when drift
/// is detected or the row is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCounters {
    pub campaign_id: Uuid,
    pub total: i64,
    pub dns: ResultBreakdown,
    pub http: ResultBreakdown,
    pub lead: LeadBreakdown,
    /// `campaign_state.version` observed when the row was last written;
    /// a mismatch is a reconcile trigger.
    pub campaign_version: i64,
    pub updated_at: String,
}

impl DomainCounters {
    /// Empty counters for a campaign with no generated domains yet.
    pub fn empty(campaign_id: Uuid, campaign_version: i64, now: &str) -> Self {
        Self {
            campaign_id,
            total: 0,
            dns: ResultBreakdown::default(),
            http: ResultBreakdown::default(),
            lead: LeadBreakdown::default(),
            campaign_version,
            updated_at: now.to_string(),
        }
    }

    /// True when every bucket matches `other` (timestamps ignored).
    pub fn same_counts(&self, other: &DomainCounters) -> bool {
        self.total == other.total
            && self.dns == other.dns
            && self.http == other.http
            && self.lead == other.lead
    }
}

// ── Internal row helpers ─────────────────────────────────────────────

/// Intermediate row for campaigns; converts TEXT columns into typed values.
pub(crate) struct CampaignRow {
    pub id: String,
    pub name: String,
    pub user_id: Option<String>,
    pub current_phase: String,
    pub phase_status: String,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s)
        .with_context(|| format!("Malformed UUID in store: {}", s))
        .map_err(StoreError::Other)
}

fn parse_json(s: &str) -> Result<Value, StoreError> {
    serde_json::from_str(s)
        .context("Malformed JSON column")
        .map_err(StoreError::Other)
}

fn parse_opt_json(s: Option<String>) -> Result<Option<Value>, StoreError> {
    s.as_deref().map(parse_json).transpose()
}

impl CampaignRow {
    pub fn into_campaign(self) -> Result<Campaign, StoreError> {
        Ok(Campaign {
            id: parse_uuid(&self.id)?,
            name: self.name,
            user_id: self.user_id.as_deref().map(parse_uuid).transpose()?,
            current_phase: Phase::from_str(&self.current_phase)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            phase_status: PhaseStatus::from_str(&self.phase_status)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            metadata: parse_json(&self.metadata)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

pub(crate) struct CampaignStateRow {
    pub campaign_id: String,
    pub current_state: String,
    pub mode: String,
    pub configuration: String,
    pub version: i64,
    pub updated_at: String,
}

impl CampaignStateRow {
    pub fn into_state(self) -> Result<CampaignState, StoreError> {
        Ok(CampaignState {
            campaign_id: parse_uuid(&self.campaign_id)?,
            current_state: CampaignStateTag::from_str(&self.current_state)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            mode: CampaignMode::from_str(&self.mode)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            configuration: parse_json(&self.configuration)?,
            version: self.version,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) struct PhaseExecutionRow {
    pub id: String,
    pub campaign_id: String,
    pub phase: String,
    pub status: String,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub failed_at: Option<String>,
    pub completed_at: Option<String>,
    pub items_total: i64,
    pub items_processed: i64,
    pub items_successful: i64,
    pub items_failed: i64,
    pub progress_pct: f64,
    pub configuration: Option<String>,
    pub error_details: Option<String>,
    pub metrics: Option<String>,
    pub is_auto_start: bool,
    pub correlation_id: String,
}

impl PhaseExecutionRow {
    pub fn into_execution(self) -> Result<PhaseExecution, StoreError> {
        Ok(PhaseExecution {
            id: parse_uuid(&self.id)?,
            campaign_id: parse_uuid(&self.campaign_id)?,
            phase: Phase::from_str(&self.phase)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            status: PhaseStatus::from_str(&self.status)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            started_at: self.started_at,
            paused_at: self.paused_at,
            failed_at: self.failed_at,
            completed_at: self.completed_at,
            items_total: self.items_total,
            items_processed: self.items_processed,
            items_successful: self.items_successful,
            items_failed: self.items_failed,
            progress_pct: self.progress_pct,
            configuration: parse_opt_json(self.configuration)?,
            error_details: parse_opt_json(self.error_details)?,
            metrics: parse_opt_json(self.metrics)?,
            is_auto_start: self.is_auto_start,
            correlation_id: self.correlation_id,
        })
    }
}

pub(crate) struct GeneratedDomainRow {
    pub id: String,
    pub campaign_id: String,
    pub domain_name: String,
    pub offset_index: i64,
    pub created_at: String,
    pub dns_status: String,
    pub dns_reason: Option<String>,
    pub http_status: String,
    pub http_reason: Option<String>,
    pub lead_status: String,
    pub domain_score: Option<f64>,
    pub features: Option<String>,
    pub last_http_fetched_at: Option<String>,
}

impl GeneratedDomainRow {
    pub fn into_domain(self) -> Result<GeneratedDomain, StoreError> {
        Ok(GeneratedDomain {
            id: parse_uuid(&self.id)?,
            campaign_id: parse_uuid(&self.campaign_id)?,
            domain_name: self.domain_name,
            offset_index: self.offset_index,
            created_at: self.created_at,
            dns_status: DomainResultStatus::from_str(&self.dns_status)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            dns_reason: self.dns_reason,
            http_status: DomainResultStatus::from_str(&self.http_status)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            http_reason: self.http_reason,
            lead_status: LeadStatus::from_str(&self.lead_status)
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
            domain_score: self.domain_score,
            features: parse_opt_json(self.features)?,
            last_http_fetched_at: self.last_http_fetched_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_round_trip() {
        for status in [
            DomainResultStatus::Pending,
            DomainResultStatus::Ok,
            DomainResultStatus::Error,
            DomainResultStatus::Timeout,
        ] {
            assert_eq!(
                DomainResultStatus::from_str(status.as_str()).unwrap(),
                status
            );
        }
    }

    #[test]
    fn test_lead_status_includes_match_variants() {
        assert_eq!(LeadStatus::from_str("match").unwrap(), LeadStatus::Match);
        assert_eq!(
            LeadStatus::from_str("no_match").unwrap(),
            LeadStatus::NoMatch
        );
        assert!(LeadStatus::from_str("maybe").is_err());
    }

    #[test]
    fn test_lead_breakdown_serializes_match_key() {
        let breakdown = LeadBreakdown {
            matched: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&breakdown).unwrap();
        assert_eq!(json["match"], 3);
        assert_eq!(json["no_match"], 0);
    }

    #[test]
    fn test_counters_same_counts_ignores_timestamps() {
        let id = Uuid::new_v4();
        let a = DomainCounters::empty(id, 1, "2026-01-01T00:00:00Z");
        let mut b = DomainCounters::empty(id, 9, "2026-02-02T00:00:00Z");
        assert!(a.same_counts(&b));
        b.total = 5;
        assert!(!a.same_counts(&b));
    }
}
