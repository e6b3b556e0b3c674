//! Phase vocabulary for the campaign engine.
//!
//! This module provides:
//! - `Phase` — the five ordered work phases and their wire-name mapping
//! - `PhaseStatus` — per-execution status tags and the allowed transitions
//! - `CampaignStateTag` / `CampaignMode` — campaign-level state machine tags

use serde::{Deserialize, Serialize};

/// The five work phases, in pipeline order.
///
/// Storage names (`domain_generation`, ...) are what the database holds;
/// clients address phases by their wire names (`discovery`, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
    Enrichment,
    Analysis,
}

/// Fixed execution order. A phase may only start once every prior entry
/// here is completed (`ResumePhase` excepted).
pub static PHASE_ORDER: [Phase; 5] = [
    Phase::DomainGeneration,
    Phase::DnsValidation,
    Phase::HttpKeywordValidation,
    Phase::Enrichment,
    Phase::Analysis,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainGeneration => "domain_generation",
            Self::DnsValidation => "dns_validation",
            Self::HttpKeywordValidation => "http_keyword_validation",
            Self::Enrichment => "enrichment",
            Self::Analysis => "analysis",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "domain_generation" => Ok(Self::DomainGeneration),
            "dns_validation" => Ok(Self::DnsValidation),
            "http_keyword_validation" => Ok(Self::HttpKeywordValidation),
            "enrichment" => Ok(Self::Enrichment),
            "analysis" => Ok(Self::Analysis),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }

    /// Client-facing name used in URLs and event payloads.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::DomainGeneration => "discovery",
            Self::DnsValidation => "validation",
            Self::HttpKeywordValidation => "extraction",
            Self::Enrichment => "enrichment",
            Self::Analysis => "analysis",
        }
    }

    /// Parse a client-facing phase name. Storage names are accepted too so
    /// older clients keep working.
    pub fn from_wire_name(s: &str) -> Result<Self, String> {
        match s {
            "discovery" => Ok(Self::DomainGeneration),
            "validation" => Ok(Self::DnsValidation),
            "extraction" => Ok(Self::HttpKeywordValidation),
            "enrichment" => Ok(Self::Enrichment),
            "analysis" => Ok(Self::Analysis),
            other => Self::from_str(other).map_err(|_| format!("Invalid phase: {}", other)),
        }
    }

    /// Position in `PHASE_ORDER`.
    pub fn index(&self) -> usize {
        PHASE_ORDER.iter().position(|p| p == self).unwrap_or(0)
    }

    /// The phase after this one, or `None` for the last phase.
    pub fn next(&self) -> Option<Phase> {
        PHASE_ORDER.get(self.index() + 1).copied()
    }

    /// All phases strictly before this one in pipeline order.
    pub fn prior_phases(&self) -> &'static [Phase] {
        &PHASE_ORDER[..self.index()]
    }
}

/// Status of a single phase execution row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Configured,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Configured => "configured",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "configured" => Ok(Self::Configured),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }

    /// Terminal states are sticky; only deleting the execution row resets them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `Configure` may move this execution to `configured`.
    /// Re-configuring is allowed from any non-running, non-completed state;
    /// a failed execution is reset by configuring it again.
    pub fn can_configure(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused | Self::Completed)
    }
}

/// Campaign-level state, held on the 1:1 `campaign_state` row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStateTag {
    Draft,
    Configuring,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "draft" => Ok(Self::Draft),
            "configuring" => Ok(Self::Configuring),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid campaign state: {}", s)),
        }
    }
}

/// Execution discipline: each phase manually started, or auto-advanced by
/// the chain runner when the previous phase completes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignMode {
    StepByStep,
    FullSequence,
}

impl CampaignMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepByStep => "step_by_step",
            Self::FullSequence => "full_sequence",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "step_by_step" => Ok(Self::StepByStep),
            "full_sequence" => Ok(Self::FullSequence),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}
