//! Counter reconciler: rebuilds the materialized per-campaign domain
//! counters from the source-of-truth rows.
//!
//! Workers maintain the counters best-effort, so concurrent writes drift.
//! The reconciler periodically picks campaigns whose counters look stale,
//! aggregates `generated_domains` in one read-consistent pass, and either
//! corrects the row (AutoCorrect, or any bucket past the threshold) or
//! publishes a drift event for observation. Read paths call
//! `rebuild_counters` directly when the row is missing.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::CoreError;
use crate::events::{Event, EventBus};
use crate::metrics::RuntimeMetrics;
use crate::store::DbHandle;
use crate::store::models::DomainCounters;

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Counters untouched for longer than this are reconcile candidates.
    pub drift_window_secs: i64,
    /// Per-bucket drift percentage that forces a correction.
    pub drift_threshold_pct: f64,
    /// Correct every examined campaign, drifted or not.
    pub auto_correct: bool,
    /// Per-run correction budget.
    pub max_corrections: usize,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            drift_window_secs: 300,
            drift_threshold_pct: 5.0,
            auto_correct: true,
            max_corrections: 25,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub examined: usize,
    pub corrected: usize,
    pub drift_events: usize,
}

pub struct CounterReconciler {
    db: DbHandle,
    bus: EventBus,
    metrics: Arc<RuntimeMetrics>,
    policy: ReconcilePolicy,
}

impl CounterReconciler {
    pub fn new(
        db: DbHandle,
        bus: EventBus,
        metrics: Arc<RuntimeMetrics>,
        policy: ReconcilePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            metrics,
            policy,
        })
    }

    pub async fn run_once(&self) -> Result<ReconcileReport, CoreError> {
        let window = self.policy.drift_window_secs;
        let candidates = self
            .db
            .call(move |store| store.campaigns_with_stale_counters(window))
            .await
            .map_err(|e| CoreError::from_store(e, "domain counters"))?;

        let mut report = ReconcileReport::default();
        let ctx = RequestContext::internal();
        for campaign_id in candidates {
            if report.corrected >= self.policy.max_corrections {
                break;
            }
            report.examined += 1;

            let (materialized, snapshot) = self
                .db
                .call(move |store| {
                    let materialized = store.get_domain_counters(campaign_id)?;
                    let snapshot = store.aggregate_domain_counters(campaign_id)?;
                    Ok((materialized, snapshot))
                })
                .await
                .map_err(|e| CoreError::from_store(e, "domain counters"))?;

            let worst = materialized
                .as_ref()
                .map(|m| worst_drift(m, &snapshot))
                .unwrap_or((f64::MAX, "missing"));

            if self.policy.auto_correct || worst.0 > self.policy.drift_threshold_pct {
                let upsert = snapshot.clone();
                self.db
                    .call(move |store| store.upsert_domain_counters(&upsert))
                    .await
                    .map_err(|e| CoreError::from_store(e, "domain counters"))?;
                report.corrected += 1;
                self.metrics
                    .reconciler_corrections
                    .fetch_add(1, Ordering::Relaxed);
                if worst.0 > 0.0 {
                    info!(
                        campaign_id = %campaign_id,
                        bucket = worst.1,
                        drift_pct = worst.0,
                        "counters corrected"
                    );
                }
            } else if worst.0 > 0.0 {
                warn!(
                    campaign_id = %campaign_id,
                    bucket = worst.1,
                    drift_pct = worst.0,
                    "counter drift observed"
                );
                self.bus.publish(
                    &ctx,
                    Some(campaign_id),
                    Event::CounterDrift {
                        bucket: worst.1.to_string(),
                        drift_pct: worst.0,
                    },
                );
                report.drift_events += 1;
            }
        }
        Ok(report)
    }

    pub fn spawn(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "reconciler pass failed");
                        }
                    }
                }
            }
        })
    }
}

/// Largest per-bucket drift, in percent of the snapshot value.
fn worst_drift(materialized: &DomainCounters, snapshot: &DomainCounters) -> (f64, &'static str) {
    let buckets: [(&'static str, i64, i64); 14] = [
        ("total", materialized.total, snapshot.total),
        ("dns_pending", materialized.dns.pending, snapshot.dns.pending),
        ("dns_ok", materialized.dns.ok, snapshot.dns.ok),
        ("dns_error", materialized.dns.error, snapshot.dns.error),
        ("dns_timeout", materialized.dns.timeout, snapshot.dns.timeout),
        ("http_pending", materialized.http.pending, snapshot.http.pending),
        ("http_ok", materialized.http.ok, snapshot.http.ok),
        ("http_error", materialized.http.error, snapshot.http.error),
        ("http_timeout", materialized.http.timeout, snapshot.http.timeout),
        ("lead_pending", materialized.lead.pending, snapshot.lead.pending),
        ("lead_match", materialized.lead.matched, snapshot.lead.matched),
        ("lead_no_match", materialized.lead.no_match, snapshot.lead.no_match),
        ("lead_error", materialized.lead.error, snapshot.lead.error),
        ("lead_timeout", materialized.lead.timeout, snapshot.lead.timeout),
    ];
    let mut worst = (0.0_f64, "none");
    for (name, m, s) in buckets {
        let drift = ((m - s).abs() as f64) * 100.0 / (s.max(1) as f64);
        if drift > worst.0 {
            worst = (drift, name);
        }
    }
    worst
}

/// Rebuild-on-miss: aggregate and persist the counters for one campaign.
pub async fn rebuild_counters(
    db: &DbHandle,
    campaign_id: Uuid,
) -> Result<DomainCounters, CoreError> {
    db.call(move |store| {
        let counters = store.aggregate_domain_counters(campaign_id)?;
        store.upsert_domain_counters(&counters)?;
        Ok(counters)
    })
    .await
    .map_err(|e| CoreError::from_store(e, "domain counters"))
}

/// Read counters, rebuilding transparently when the row is missing.
pub async fn counters_or_rebuild(
    db: &DbHandle,
    campaign_id: Uuid,
) -> Result<DomainCounters, CoreError> {
    let existing = db
        .call(move |store| store.get_domain_counters(campaign_id))
        .await
        .map_err(|e| CoreError::from_store(e, "domain counters"))?;
    match existing {
        Some(counters) => Ok(counters),
        None => rebuild_counters(db, campaign_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::CampaignMode;
    use crate::store::domains::CounterColumn;
    use crate::store::{CampaignStore, seed_executions};
    use serde_json::json;

    async fn setup() -> (DbHandle, Uuid) {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = store
            .create_campaign(Uuid::new_v4(), "reconcile-test", None, &json!({}))
            .unwrap();
        store
            .create_campaign_state(campaign.id, CampaignMode::StepByStep, &json!({}))
            .unwrap();
        seed_executions(&store, campaign.id).unwrap();
        let batch: Vec<(i64, String)> = (0..10).map(|i| (i, format!("d{}.com", i))).collect();
        store
            .insert_generated_domains(campaign.id, &batch)
            .unwrap();
        (DbHandle::new(store), campaign.id)
    }

    fn reconciler(db: &DbHandle, policy: ReconcilePolicy) -> Arc<CounterReconciler> {
        CounterReconciler::new(db.clone(), EventBus::new(), RuntimeMetrics::new(), policy)
    }

    #[tokio::test]
    async fn test_rebuild_on_miss_matches_aggregation() {
        let (db, campaign_id) = setup().await;
        assert!(
            db.call(move |store| store.get_domain_counters(campaign_id))
                .await
                .unwrap()
                .is_none()
        );
        let counters = counters_or_rebuild(&db, campaign_id).await.unwrap();
        assert_eq!(counters.total, 10);
        assert_eq!(counters.dns.pending, 10);
        // The row is persisted now.
        assert!(
            db.call(move |store| store.get_domain_counters(campaign_id))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_run_once_corrects_drifted_counters() {
        let (db, campaign_id) = setup().await;
        rebuild_counters(&db, campaign_id).await.unwrap();
        // Inject drift and backdate the row so the window selects it.
        db.call(move |store| {
            store.bump_domain_counters(campaign_id, &[(CounterColumn::Total, 7)])?;
            store.conn.execute(
                "UPDATE campaign_domain_counters SET updated_at = '2000-01-01T00:00:00Z'
                 WHERE campaign_id = ?1",
                rusqlite::params![campaign_id.to_string()],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let reconciler = reconciler(&db, ReconcilePolicy::default());
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.corrected, 1);

        let counters = db
            .call(move |store| store.get_domain_counters(campaign_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counters.total, 10);
    }

    #[tokio::test]
    async fn test_observe_only_mode_emits_drift_event() {
        let (db, campaign_id) = setup().await;
        rebuild_counters(&db, campaign_id).await.unwrap();
        db.call(move |store| {
            store.bump_domain_counters(campaign_id, &[(CounterColumn::DnsPending, -1)])?;
            store.conn.execute(
                "UPDATE campaign_domain_counters SET updated_at = '2000-01-01T00:00:00Z'
                 WHERE campaign_id = ?1",
                rusqlite::params![campaign_id.to_string()],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reconciler = CounterReconciler::new(
            db.clone(),
            bus,
            RuntimeMetrics::new(),
            ReconcilePolicy {
                auto_correct: false,
                drift_threshold_pct: 50.0, // 10% drift stays under this
                ..Default::default()
            },
        );
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.corrected, 0);
        assert_eq!(report.drift_events, 1);
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.name(), "counter.drift");
        // The drifted row was left alone.
        let counters = db
            .call(move |store| store.get_domain_counters(campaign_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counters.dns.pending, 9);
    }

    #[tokio::test]
    async fn test_max_corrections_bounds_a_run() {
        let store = CampaignStore::in_memory().unwrap();
        let db = DbHandle::new(store);
        for _ in 0..3 {
            let (campaign_id, db2) = {
                let db = db.clone();
                let id = db
                    .call(move |store| {
                        let campaign = store.create_campaign(
                            Uuid::new_v4(),
                            "bounded",
                            None,
                            &json!({}),
                        )?;
                        store.create_campaign_state(
                            campaign.id,
                            CampaignMode::StepByStep,
                            &json!({}),
                        )?;
                        Ok(campaign.id)
                    })
                    .await
                    .unwrap();
                (id, db)
            };
            rebuild_counters(&db2, campaign_id).await.unwrap();
            db2.call(move |store| {
                store.conn.execute(
                    "UPDATE campaign_domain_counters SET updated_at = '2000-01-01T00:00:00Z'
                     WHERE campaign_id = ?1",
                    rusqlite::params![campaign_id.to_string()],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        }

        let reconciler = reconciler(
            &db,
            ReconcilePolicy {
                max_corrections: 2,
                ..Default::default()
            },
        );
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.corrected, 2);
    }
}
