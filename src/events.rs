//! Event bus: single-writer fan-out of progress, status-change, and system
//! events to per-subscriber queues.
//!
//! Built on `tokio::sync::broadcast`, which gives each subscriber its own
//! bounded ring: a slow subscriber never blocks the producer, overflow
//! drops its oldest events, and the receiver observes the loss as a
//! `Lagged` count. Envelope enrichment (campaign/user/correlation ids from
//! the calling context) happens here, not at the call sites.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::phase::Phase;

/// Ring capacity per subscriber.
const EVENT_BUFFER: usize = 256;

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    pub phase: &'static str,
    pub status: String,
    pub items_total: i64,
    pub items_processed: i64,
    pub items_successful: i64,
    pub items_failed: i64,
    pub progress_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "campaign.progress")]
    Progress(ProgressPayload),

    #[serde(rename = "phase.started")]
    PhaseStarted {
        phase: &'static str,
        progress_pct: f64,
    },

    #[serde(rename = "phase.completed")]
    PhaseCompleted {
        phase: &'static str,
        progress_pct: f64,
    },

    #[serde(rename = "phase.failed")]
    PhaseFailed {
        phase: &'static str,
        progress_pct: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },

    #[serde(rename = "mode.changed")]
    ModeChanged { mode: &'static str },

    #[serde(rename = "campaign.completed")]
    CampaignCompleted {},

    #[serde(rename = "chain.blocked")]
    ChainBlocked {
        after_phase: &'static str,
        missing_phases: Vec<&'static str>,
    },

    #[serde(rename = "counter.drift")]
    CounterDrift { bucket: String, drift_pct: f64 },

    #[serde(rename = "system")]
    System { name: String, payload: Value },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "campaign.progress",
            Self::PhaseStarted { .. } => "phase.started",
            Self::PhaseCompleted { .. } => "phase.completed",
            Self::PhaseFailed { .. } => "phase.failed",
            Self::ModeChanged { .. } => "mode.changed",
            Self::CampaignCompleted {} => "campaign.completed",
            Self::ChainBlocked { .. } => "chain.blocked",
            Self::CounterDrift { .. } => "counter.drift",
            Self::System { .. } => "system",
        }
    }

    pub fn chain_blocked(after: Phase, missing: &[Phase]) -> Self {
        Self::ChainBlocked {
            after_phase: after.wire_name(),
            missing_phases: missing.iter().map(|p| p.wire_name()).collect(),
        }
    }
}

/// What subscribers receive: the event plus everything the bus could
/// derive about its origin.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

// ── Bus ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish with enrichment from the calling context. Delivery is
    /// best-effort; no subscribers is not an error.
    pub fn publish(&self, ctx: &RequestContext, campaign_id: Option<Uuid>, event: Event) {
        let envelope = EventEnvelope {
            event,
            timestamp: Utc::now(),
            campaign_id,
            user_id: ctx.user_id,
            request_id: ctx.request_id.clone(),
        };
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
