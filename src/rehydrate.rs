//! Rehydration worker: re-enters phase executions left `running`/`paused`
//! by a previous process.
//!
//! Runs once at startup and then periodically, so phase services that died
//! silently also get picked back up. Each resume is guarded by an advisory
//! claim row keyed on (campaign, phase): whichever process inserts the
//! claim drives the resume, every other replica skips. Claims left by a
//! dead process age out and get taken over.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::errors::CoreError;
use crate::orchestrator::Orchestrator;
use crate::phase::Phase;
use crate::store::DbHandle;

pub struct RehydrationWorker {
    orchestrator: Arc<Orchestrator>,
    db: DbHandle,
    /// Claim owner id; unique per process.
    owner: String,
    claim_ttl_secs: i64,
    /// Executions this process already resumed and is still driving;
    /// periodic rescans skip them instead of stacking drivers.
    driving: Mutex<HashSet<(Uuid, Phase)>>,
}

#[derive(Debug, Default)]
pub struct RehydrationReport {
    pub scanned: usize,
    pub resumed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RehydrationWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, db: DbHandle, claim_ttl_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            db,
            owner: format!("leadforge-{}", Uuid::new_v4()),
            claim_ttl_secs,
            driving: Mutex::new(HashSet::new()),
        })
    }

    pub async fn run_once(&self) -> Result<RehydrationReport, CoreError> {
        let in_flight = self
            .db
            .call(|store| store.list_in_flight_executions())
            .await
            .map_err(|e| CoreError::from_store(e, "phase executions"))?;

        let mut report = RehydrationReport {
            scanned: in_flight.len(),
            ..Default::default()
        };
        let live: HashSet<(Uuid, Phase)> = in_flight
            .iter()
            .map(|e| (e.campaign_id, e.phase))
            .collect();
        {
            // Anything we were driving that is no longer in flight finished.
            let mut driving = self.driving.lock().await;
            driving.retain(|key| live.contains(key));
        }

        for execution in in_flight {
            let key = (execution.campaign_id, execution.phase);
            if self.driving.lock().await.contains(&key) {
                report.skipped += 1;
                continue;
            }
            let owner = self.owner.clone();
            let ttl = self.claim_ttl_secs;
            let claimed = self
                .db
                .call(move |store| store.try_claim_resume(key.0, key.1, &owner, ttl))
                .await
                .map_err(|e| CoreError::from_store(e, "resume claims"))?;
            if !claimed {
                // Another replica holds the resume for this execution.
                report.skipped += 1;
                continue;
            }

            let ctx = RequestContext::internal();
            match self
                .orchestrator
                .resume_phase(&ctx, execution.campaign_id, execution.phase)
                .await
            {
                Ok(_) => {
                    info!(
                        campaign_id = %execution.campaign_id,
                        phase = execution.phase.wire_name(),
                        "execution rehydrated"
                    );
                    self.driving.lock().await.insert(key);
                    report.resumed += 1;
                }
                Err(e) => {
                    // Tolerate individual failures and keep scanning; drop
                    // the claim so another pass (or replica) can retry.
                    warn!(
                        campaign_id = %execution.campaign_id,
                        phase = execution.phase.wire_name(),
                        error = %e,
                        "resume failed"
                    );
                    let owner = self.owner.clone();
                    let _ = self
                        .db
                        .call(move |store| store.release_resume_claim(key.0, key.1, &owner))
                        .await;
                    report.failed += 1;
                }
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
            // Startup pass first, then the periodic scan.
            match self.run_once().await {
                Ok(report) if report.scanned > 0 => {
                    info!(
                        scanned = report.scanned,
                        resumed = report.resumed,
                        "startup rehydration pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "startup rehydration pass failed"),
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick already covered above
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "rehydration pass failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::metrics::RuntimeMetrics;
    use crate::orchestrator::{CreateCampaignRequest, Orchestrator};
    use crate::services::probe::AcceptAllBackend;
    use crate::services::{ServiceRuntime, ServiceSet};
    use crate::store::CampaignStore;
    use serde_json::json;

    fn stack() -> (Arc<Orchestrator>, DbHandle) {
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
        (Orchestrator::new(db.clone(), bus, metrics, services), db)
    }

    /// Fake an execution left `running` by a dead process: configured row
    /// flipped to running with no live driver.
    async fn orphan_running_execution(orch: &Arc<Orchestrator>, db: &DbHandle) -> Uuid {
        let ctx = RequestContext::internal();
        let campaign = orch
            .create_campaign(
                &ctx,
                CreateCampaignRequest {
                    name: "orphan".into(),
                    user_id: None,
                    configuration: None,
                },
            )
            .await
            .unwrap();
        orch.configure_phase(
            &ctx,
            campaign.id,
            Phase::DomainGeneration,
            &json!({"characterSet": "ab", "tld": "com", "numDomains": 2, "variableLength": 1}),
        )
        .await
        .unwrap();
        let id = campaign.id;
        db.call(move |store| {
            store.try_mark_execution_running(id, Phase::DomainGeneration, false, "")?;
            Ok(())
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_rehydrates_orphaned_execution_once() {
        let (orch, db) = stack();
        let campaign_id = orphan_running_execution(&orch, &db).await;

        let worker = RehydrationWorker::new(Arc::clone(&orch), db.clone(), 300);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.resumed, 1);

        // Second pass in the same process skips what it already drives and
        // keeps exactly one execution row.
        let report = worker.run_once().await.unwrap();
        assert!(report.resumed == 0);
        let executions = db
            .call(move |store| store.list_executions(campaign_id))
            .await
            .unwrap();
        assert_eq!(
            executions
                .iter()
                .filter(|e| e.phase == Phase::DomainGeneration)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_second_process_skips_claimed_execution() {
        let (orch, db) = stack();
        let _campaign_id = orphan_running_execution(&orch, &db).await;

        let first = RehydrationWorker::new(Arc::clone(&orch), db.clone(), 300);
        let report = first.run_once().await.unwrap();
        assert_eq!(report.resumed, 1);

        // A second worker (different owner id) must not double-resume.
        let second = RehydrationWorker::new(Arc::clone(&orch), db.clone(), 300);
        let report = second.run_once().await.unwrap();
        assert_eq!(report.resumed, 0);
        assert!(report.skipped >= 1);
    }

    #[tokio::test]
    async fn test_nothing_in_flight_is_a_clean_pass() {
        let (orch, db) = stack();
        let worker = RehydrationWorker::new(orch, db, 300);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.resumed, 0);
    }
}
