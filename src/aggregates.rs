//! Aggregates cache: TTL memoization over the expensive read-only
//! aggregations served by the campaign dashboards (funnel, classification
//! buckets, momentum histogram, status summary, metric rates,
//! recommendations).
//!
//! Entries are keyed by (campaign, kind) and expire after the TTL or when
//! the invalidator task sees progress on that campaign. The lock is never
//! held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{Event, EventBus};
use crate::reconciler::counters_or_rebuild;
use crate::store::DbHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Funnel,
    Classifications,
    Momentum,
    Status,
    Metrics,
    Recommendations,
}

impl AggregateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Funnel => "funnel",
            Self::Classifications => "classifications",
            Self::Momentum => "momentum",
            Self::Status => "status",
            Self::Metrics => "metrics",
            Self::Recommendations => "recommendations",
        }
    }
}

struct CacheEntry {
    inserted: Instant,
    value: Value,
}

pub struct AggregatesCache {
    db: DbHandle,
    ttl: Duration,
    entries: Mutex<HashMap<(Uuid, &'static str), CacheEntry>>,
}

/// Hours of history in the momentum histogram.
const MOMENTUM_BUCKETS: i64 = 24;

impl AggregatesCache {
    pub fn new(db: DbHandle, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get(
        &self,
        campaign_id: Uuid,
        kind: AggregateKind,
    ) -> Result<Value, CoreError> {
        if let Some(value) = self.lookup(campaign_id, kind) {
            return Ok(value);
        }
        let value = self.compute(campaign_id, kind).await?;
        self.entries
            .lock()
            .expect("aggregates lock poisoned")
            .insert(
                (campaign_id, kind.as_str()),
                CacheEntry {
                    inserted: Instant::now(),
                    value: value.clone(),
                },
            );
        Ok(value)
    }

    fn lookup(&self, campaign_id: Uuid, kind: AggregateKind) -> Option<Value> {
        let entries = self.entries.lock().expect("aggregates lock poisoned");
        entries
            .get(&(campaign_id, kind.as_str()))
            .filter(|entry| entry.inserted.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn invalidate(&self, campaign_id: Uuid) {
        self.entries
            .lock()
            .expect("aggregates lock poisoned")
            .retain(|(id, _), _| *id != campaign_id);
    }

    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("aggregates lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    async fn compute(
        &self,
        campaign_id: Uuid,
        kind: AggregateKind,
    ) -> Result<Value, CoreError> {
        match kind {
            AggregateKind::Funnel => {
                let counters = counters_or_rebuild(&self.db, campaign_id).await?;
                Ok(json!({
                    "stages": [
                        {"name": "generated", "count": counters.total},
                        {"name": "dns_resolved", "count": counters.dns.ok},
                        {"name": "http_reachable", "count": counters.http.ok},
                        {"name": "lead_matches", "count": counters.lead.matched},
                    ]
                }))
            }
            AggregateKind::Classifications => {
                let (high, medium, low, unscored) = self
                    .db
                    .call(move |store| store.score_classification_buckets(campaign_id))
                    .await
                    .map_err(|e| CoreError::from_store(e, "generated domains"))?;
                Ok(json!({
                    "high": high,
                    "medium": medium,
                    "low": low,
                    "unscored": unscored,
                }))
            }
            AggregateKind::Momentum => {
                let histogram = self
                    .db
                    .call(move |store| {
                        store.domains_created_per_hour(campaign_id, MOMENTUM_BUCKETS)
                    })
                    .await
                    .map_err(|e| CoreError::from_store(e, "generated domains"))?;
                Ok(json!({
                    "windowHours": MOMENTUM_BUCKETS,
                    "buckets": histogram
                        .into_iter()
                        .map(|(hour, count)| json!({"hour": hour, "count": count}))
                        .collect::<Vec<_>>(),
                }))
            }
            AggregateKind::Status => {
                let (campaign, state, executions) = self
                    .db
                    .call(move |store| {
                        let campaign = store.get_campaign(campaign_id)?;
                        let state = store.get_campaign_state(campaign_id)?;
                        let executions = store.list_executions(campaign_id)?;
                        Ok((campaign, state, executions))
                    })
                    .await
                    .map_err(|e| CoreError::from_store(e, "campaign"))?;
                Ok(json!({
                    "currentPhase": campaign.current_phase.wire_name(),
                    "phaseStatus": campaign.phase_status,
                    "state": state.current_state,
                    "mode": state.mode,
                    "executions": executions
                        .into_iter()
                        .map(|e| json!({
                            "phase": e.phase.wire_name(),
                            "status": e.status,
                            "progressPct": e.progress_pct,
                        }))
                        .collect::<Vec<_>>(),
                }))
            }
            AggregateKind::Metrics => {
                let counters = counters_or_rebuild(&self.db, campaign_id).await?;
                let rate = |num: i64, den: i64| {
                    if den > 0 {
                        num as f64 / den as f64
                    } else {
                        0.0
                    }
                };
                Ok(json!({
                    "total": counters.total,
                    "dnsSuccessRate": rate(counters.dns.ok, counters.total),
                    "httpSuccessRate": rate(counters.http.ok, counters.dns.ok),
                    "matchRate": rate(counters.lead.matched, counters.http.ok),
                }))
            }
            AggregateKind::Recommendations => {
                let counters = counters_or_rebuild(&self.db, campaign_id).await?;
                let mut recommendations: Vec<String> = Vec::new();
                if counters.total == 0 {
                    recommendations
                        .push("Configure and start the discovery phase to generate domains".into());
                } else {
                    if counters.dns.error * 2 > counters.total {
                        recommendations.push(
                            "More than half of generated domains fail DNS; review the character set and TLD".into(),
                        );
                    }
                    if counters.http.ok > 0 && counters.lead.matched == 0 {
                        recommendations.push(
                            "No lead matches yet; broaden the keyword rules in the analysis configuration".into(),
                        );
                    }
                    if counters.dns.pending > 0 {
                        recommendations.push(
                            "DNS validation has pending domains; start or resume the validation phase".into(),
                        );
                    }
                }
                Ok(json!({"recommendations": recommendations}))
            }
        }
    }
}

/// Invalidate cached aggregates whenever a campaign reports progress.
pub fn spawn_invalidator(
    cache: Arc<AggregatesCache>,
    bus: EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        if let Some(campaign_id) = envelope.campaign_id {
                            if matches!(
                                envelope.event,
                                Event::Progress(_)
                                    | Event::PhaseCompleted { .. }
                                    | Event::PhaseFailed { .. }
                            ) {
                                cache.invalidate(campaign_id);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Lost track of which campaigns progressed; the TTL
                        // still bounds staleness.
                        debug!(skipped, "aggregates invalidator lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::CampaignMode;
    use crate::store::models::{DomainResultStatus, LeadStatus};
    use crate::store::{CampaignStore, DomainQuery, seed_executions};

    async fn populated() -> (DbHandle, Uuid) {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = store
            .create_campaign(Uuid::new_v4(), "agg-test", None, &json!({}))
            .unwrap();
        store
            .create_campaign_state(campaign.id, CampaignMode::StepByStep, &json!({}))
            .unwrap();
        seed_executions(&store, campaign.id).unwrap();
        let batch: Vec<(i64, String)> = (0..6).map(|i| (i, format!("d{}.com", i))).collect();
        store.insert_generated_domains(campaign.id, &batch).unwrap();
        let domains = store
            .list_domains(campaign.id, &DomainQuery::default())
            .unwrap()
            .items;
        for domain in &domains[..4] {
            store
                .set_dns_result(domain.id, DomainResultStatus::Ok, None)
                .unwrap();
        }
        for domain in &domains[..3] {
            store
                .set_http_result(domain.id, DomainResultStatus::Ok, None)
                .unwrap();
        }
        store
            .set_lead_result(domains[0].id, LeadStatus::Match, Some(0.8))
            .unwrap();
        store
            .set_lead_result(domains[1].id, LeadStatus::NoMatch, Some(0.1))
            .unwrap();
        (DbHandle::new(store), campaign.id)
    }

    #[tokio::test]
    async fn test_funnel_counts_narrow_by_stage() {
        let (db, campaign_id) = populated().await;
        let cache = AggregatesCache::new(db, Duration::from_secs(30));
        let funnel = cache
            .get(campaign_id, AggregateKind::Funnel)
            .await
            .unwrap();
        let counts: Vec<i64> = funnel["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["count"].as_i64().unwrap())
            .collect();
        assert_eq!(counts, vec![6, 4, 3, 1]);
    }

    #[tokio::test]
    async fn test_classifications_bucket_scores() {
        let (db, campaign_id) = populated().await;
        let cache = AggregatesCache::new(db, Duration::from_secs(30));
        let buckets = cache
            .get(campaign_id, AggregateKind::Classifications)
            .await
            .unwrap();
        assert_eq!(buckets["high"], 1);
        assert_eq!(buckets["low"], 1);
        assert_eq!(buckets["unscored"], 4);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_invalidated() {
        let (db, campaign_id) = populated().await;
        let cache = AggregatesCache::new(db.clone(), Duration::from_secs(3600));
        let before = cache
            .get(campaign_id, AggregateKind::Funnel)
            .await
            .unwrap();

        // New rows do not show through the warm cache...
        db.call(move |store| {
            store
                .insert_generated_domains(campaign_id, &[(100, "fresh.com".into())])
                .map(|_| ())
        })
        .await
        .unwrap();
        let cached = cache
            .get(campaign_id, AggregateKind::Funnel)
            .await
            .unwrap();
        assert_eq!(cached, before);

        // ...until the campaign is invalidated.
        cache.invalidate(campaign_id);
        let fresh = cache
            .get(campaign_id, AggregateKind::Funnel)
            .await
            .unwrap();
        assert_eq!(fresh["stages"][0]["count"], 7);
    }

    #[tokio::test]
    async fn test_recommendations_for_empty_campaign() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = store
            .create_campaign(Uuid::new_v4(), "empty", None, &json!({}))
            .unwrap();
        store
            .create_campaign_state(campaign.id, CampaignMode::StepByStep, &json!({}))
            .unwrap();
        let cache = AggregatesCache::new(DbHandle::new(store), Duration::from_secs(30));
        let value = cache
            .get(campaign.id, AggregateKind::Recommendations)
            .await
            .unwrap();
        let recommendations = value["recommendations"].as_array().unwrap();
        assert_eq!(recommendations.len(), 1);
        assert!(
            recommendations[0]
                .as_str()
                .unwrap()
                .contains("discovery")
        );
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_dead_entries() {
        let (db, campaign_id) = populated().await;
        let cache = AggregatesCache::new(db, Duration::ZERO);
        cache
            .get(campaign_id, AggregateKind::Funnel)
            .await
            .unwrap();
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.sweep_expired(), 0);
    }
}
