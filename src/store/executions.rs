//! Phase-execution rows: the per-(campaign, phase) state machine records.
//!
//! Transitions are conditional updates; a `try_*` method returns `false`
//! when the row was not in a state the transition is allowed from, and the
//! orchestrator turns that into a `Conflict`.

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::CampaignStore;
use super::models::{PhaseExecution, PhaseExecutionRow};
use crate::errors::StoreError;
use crate::phase::Phase;

const EXECUTION_COLUMNS: &str = "id, campaign_id, phase, status, started_at, paused_at, \
     failed_at, completed_at, items_total, items_processed, items_successful, items_failed, \
     progress_pct, configuration, error_details, metrics, is_auto_start, correlation_id";

fn row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseExecutionRow> {
    Ok(PhaseExecutionRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        phase: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        paused_at: row.get(5)?,
        failed_at: row.get(6)?,
        completed_at: row.get(7)?,
        items_total: row.get(8)?,
        items_processed: row.get(9)?,
        items_successful: row.get(10)?,
        items_failed: row.get(11)?,
        progress_pct: row.get(12)?,
        configuration: row.get(13)?,
        error_details: row.get(14)?,
        metrics: row.get(15)?,
        is_auto_start: row.get::<_, i64>(16)? != 0,
        correlation_id: row.get(17)?,
    })
}

impl CampaignStore {
    pub fn get_execution(
        &self,
        campaign_id: Uuid,
        phase: Phase,
    ) -> Result<PhaseExecution, StoreError> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE campaign_id = ?1 AND phase = ?2",
            EXECUTION_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![campaign_id.to_string(), phase.as_str()],
                row_mapper,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        row.into_execution()
    }

    pub fn list_executions(&self, campaign_id: Uuid) -> Result<Vec<PhaseExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE campaign_id = ?1",
            EXECUTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![campaign_id.to_string()], row_mapper)?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?.into_execution()?);
        }
        executions.sort_by_key(|e| e.phase.index());
        Ok(executions)
    }

    /// All executions left in `running`/`paused`, across campaigns. The
    /// rehydration worker re-enters these after a restart.
    pub fn list_in_flight_executions(&self) -> Result<Vec<PhaseExecution>, StoreError> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE status IN ('running', 'paused')",
            EXECUTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_mapper)?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?.into_execution()?);
        }
        Ok(executions)
    }

    /// Configure (or re-configure) an execution. Allowed from any state
    /// except running/paused/completed; configuring a failed execution
    /// resets it. The canonical config snapshot is stored on the row and
    /// progress counters are zeroed.
    pub fn try_mark_execution_configured(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        config_snapshot: &Value,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'configured', configuration = ?1, error_details = NULL,
                 items_total = 0, items_processed = 0, items_successful = 0,
                 items_failed = 0, progress_pct = 0,
                 started_at = NULL, paused_at = NULL, failed_at = NULL, completed_at = NULL
             WHERE campaign_id = ?2 AND phase = ?3
               AND status IN ('not_started', 'configured', 'ready', 'failed')",
            params![
                config_snapshot.to_string(),
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// configured/ready → running. Records the start stamp, auto-start flag
    /// and correlation id of the start call.
    pub fn try_mark_execution_running(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        is_auto_start: bool,
        correlation_id: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'running', started_at = ?1, paused_at = NULL,
                 is_auto_start = ?2, correlation_id = ?3
             WHERE campaign_id = ?4 AND phase = ?5 AND status IN ('configured', 'ready')",
            params![
                Self::now(),
                is_auto_start as i64,
                correlation_id,
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// running/paused → running again; the resume path after a restart.
    pub fn try_mark_execution_resumed(
        &self,
        campaign_id: Uuid,
        phase: Phase,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'running', paused_at = NULL
             WHERE campaign_id = ?1 AND phase = ?2 AND status IN ('running', 'paused')",
            params![campaign_id.to_string(), phase.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn try_mark_execution_paused(
        &self,
        campaign_id: Uuid,
        phase: Phase,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'paused', paused_at = ?1
             WHERE campaign_id = ?2 AND phase = ?3 AND status = 'running'",
            params![Self::now(), campaign_id.to_string(), phase.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Progress write from the phase service; only lands while running.
    pub fn update_execution_progress(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        total: i64,
        processed: i64,
        successful: i64,
        failed: i64,
    ) -> Result<bool, StoreError> {
        let pct = if total > 0 {
            (processed as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET items_total = ?1, items_processed = ?2, items_successful = ?3,
                 items_failed = ?4, progress_pct = ?5
             WHERE campaign_id = ?6 AND phase = ?7 AND status = 'running'",
            params![
                total,
                processed,
                successful,
                failed,
                pct,
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// running → completed. Progress is forced to 100% of whatever total
    /// the service last reported.
    pub fn try_mark_execution_completed(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        metrics: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'completed', completed_at = ?1, progress_pct = 100.0,
                 metrics = COALESCE(?2, metrics)
             WHERE campaign_id = ?3 AND phase = ?4 AND status = 'running'",
            params![
                Self::now(),
                metrics.map(|m| m.to_string()),
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Move to failed from any non-terminal state. Used for both worker
    /// failures and cancellation (`reason = cancelled`); calling it on an
    /// already-terminal row is a no-op, which is what makes Cancel
    /// idempotent.
    pub fn try_mark_execution_failed(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        error_details: &Value,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE phase_executions
             SET status = 'failed', failed_at = ?1, error_details = ?2
             WHERE campaign_id = ?3 AND phase = ?4
               AND status NOT IN ('completed', 'failed')",
            params![
                Self::now(),
                error_details.to_string(),
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Explicit reset: deleting the row is the only way out of a terminal
    /// state. A fresh `not_started` row is seeded in its place.
    pub fn reset_execution(&self, campaign_id: Uuid, phase: Phase) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM phase_executions WHERE campaign_id = ?1 AND phase = ?2",
            params![campaign_id.to_string(), phase.as_str()],
        )?;
        self.conn.execute(
            "INSERT INTO phase_executions (id, campaign_id, phase) VALUES (?1, ?2, ?3)",
            params![
                Uuid::new_v4().to_string(),
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
        Ok(())
    }

    // ── Resume claims (advisory locks for rehydration) ────────────────

    /// Try to claim the resume of one (campaign, phase). Returns false if a
    /// live claim is held elsewhere; stale claims (older than `ttl_secs`)
    /// are taken over.
    pub fn try_claim_resume(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        owner: &str,
        ttl_secs: i64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let cutoff = (now - Duration::seconds(ttl_secs)).to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO phase_resume_claims (campaign_id, phase, claimed_by, claimed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                campaign_id.to_string(),
                phase.as_str(),
                owner,
                now.to_rfc3339()
            ],
        )?;
        if inserted > 0 {
            return Ok(true);
        }
        // Take over an expired claim, or refresh our own.
        let taken = self.conn.execute(
            "UPDATE phase_resume_claims SET claimed_by = ?1, claimed_at = ?2
             WHERE campaign_id = ?3 AND phase = ?4
               AND (claimed_at < ?5 OR claimed_by = ?1)",
            params![
                owner,
                now.to_rfc3339(),
                campaign_id.to_string(),
                phase.as_str(),
                cutoff
            ],
        )?;
        Ok(taken > 0)
    }

    pub fn release_resume_claim(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        owner: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM phase_resume_claims
             WHERE campaign_id = ?1 AND phase = ?2 AND claimed_by = ?3",
            params![campaign_id.to_string(), phase.as_str(), owner],
        )?;
        Ok(())
    }

    /// Drop claims older than the TTL; orphaned claims otherwise block
    /// resumes forever when a holder dies without releasing.
    pub fn sweep_expired_claims(&self, ttl_secs: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(ttl_secs)).to_rfc3339();
        let swept = self.conn.execute(
            "DELETE FROM phase_resume_claims WHERE claimed_at < ?1",
            params![cutoff],
        )?;
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{PHASE_ORDER, PhaseStatus};
    use crate::store::models::Campaign;
    use crate::store::{CampaignStore, seed_executions};
    use serde_json::json;

    fn fixture(store: &CampaignStore) -> Campaign {
        let campaign = store
            .create_campaign(Uuid::new_v4(), "exec-test", None, &json!({}))
            .unwrap();
        seed_executions(store, campaign.id).unwrap();
        campaign
    }

    #[test]
    fn test_seed_creates_one_row_per_phase() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let executions = store.list_executions(campaign.id).unwrap();
        assert_eq!(executions.len(), 5);
        for (execution, phase) in executions.iter().zip(PHASE_ORDER) {
            assert_eq!(execution.phase, phase);
            assert_eq!(execution.status, PhaseStatus::NotStarted);
        }
        // Seeding again must not create duplicates.
        seed_executions(&store, campaign.id).unwrap();
        assert_eq!(store.list_executions(campaign.id).unwrap().len(), 5);
    }

    #[test]
    fn test_lifecycle_configured_running_completed() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let phase = Phase::DomainGeneration;

        assert!(
            store
                .try_mark_execution_configured(campaign.id, phase, &json!({"numDomains": 3}))
                .unwrap()
        );
        assert!(
            store
                .try_mark_execution_running(campaign.id, phase, false, "req-1")
                .unwrap()
        );
        assert!(
            store
                .update_execution_progress(campaign.id, phase, 3, 2, 2, 0)
                .unwrap()
        );

        let execution = store.get_execution(campaign.id, phase).unwrap();
        assert_eq!(execution.status, PhaseStatus::Running);
        assert_eq!(execution.items_processed, 2);
        assert!((execution.progress_pct - 66.666).abs() < 1.0);
        assert!(!execution.is_auto_start);
        assert_eq!(execution.correlation_id, "req-1");

        assert!(
            store
                .try_mark_execution_completed(campaign.id, phase, None)
                .unwrap()
        );
        let execution = store.get_execution(campaign.id, phase).unwrap();
        assert_eq!(execution.status, PhaseStatus::Completed);
        assert_eq!(execution.progress_pct, 100.0);
        assert!(execution.completed_at.is_some());
    }

    #[test]
    fn test_start_requires_configured() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        assert!(
            !store
                .try_mark_execution_running(campaign.id, Phase::DnsValidation, false, "")
                .unwrap()
        );
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let phase = Phase::DomainGeneration;
        store
            .try_mark_execution_configured(campaign.id, phase, &json!({}))
            .unwrap();
        store
            .try_mark_execution_running(campaign.id, phase, false, "")
            .unwrap();
        store
            .try_mark_execution_completed(campaign.id, phase, None)
            .unwrap();

        // Neither fail nor progress can touch a completed row.
        assert!(
            !store
                .try_mark_execution_failed(campaign.id, phase, &json!({"reason": "late"}))
                .unwrap()
        );
        assert!(
            !store
                .update_execution_progress(campaign.id, phase, 10, 1, 1, 0)
                .unwrap()
        );
        // But configuring a failed row resets it.
        let phase2 = Phase::DnsValidation;
        store
            .try_mark_execution_configured(campaign.id, phase2, &json!({}))
            .unwrap();
        store
            .try_mark_execution_running(campaign.id, phase2, false, "")
            .unwrap();
        store
            .try_mark_execution_failed(campaign.id, phase2, &json!({"reason": "boom"}))
            .unwrap();
        assert!(
            store
                .try_mark_execution_configured(campaign.id, phase2, &json!({}))
                .unwrap()
        );
        let execution = store.get_execution(campaign.id, phase2).unwrap();
        assert_eq!(execution.status, PhaseStatus::Configured);
        assert!(execution.error_details.is_none());
    }

    #[test]
    fn test_cancel_is_idempotent_via_conditional_fail() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let phase = Phase::DomainGeneration;
        store
            .try_mark_execution_configured(campaign.id, phase, &json!({}))
            .unwrap();
        store
            .try_mark_execution_running(campaign.id, phase, false, "")
            .unwrap();

        let details = json!({"reason": "cancelled"});
        assert!(
            store
                .try_mark_execution_failed(campaign.id, phase, &details)
                .unwrap()
        );
        // Second cancel is a no-op, not an error.
        assert!(
            !store
                .try_mark_execution_failed(campaign.id, phase, &details)
                .unwrap()
        );
        let execution = store.get_execution(campaign.id, phase).unwrap();
        assert_eq!(execution.error_details.unwrap()["reason"], "cancelled");
    }

    #[test]
    fn test_in_flight_scan_finds_running_and_paused() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        store
            .try_mark_execution_configured(campaign.id, Phase::DomainGeneration, &json!({}))
            .unwrap();
        store
            .try_mark_execution_running(campaign.id, Phase::DomainGeneration, false, "")
            .unwrap();
        store
            .try_mark_execution_configured(campaign.id, Phase::DnsValidation, &json!({}))
            .unwrap();
        store
            .try_mark_execution_running(campaign.id, Phase::DnsValidation, false, "")
            .unwrap();
        store
            .try_mark_execution_paused(campaign.id, Phase::DnsValidation)
            .unwrap();

        let in_flight = store.list_in_flight_executions().unwrap();
        assert_eq!(in_flight.len(), 2);
    }

    #[test]
    fn test_resume_claims_exclude_second_owner() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let phase = Phase::DomainGeneration;

        assert!(
            store
                .try_claim_resume(campaign.id, phase, "proc-a", 300)
                .unwrap()
        );
        // Another process is refused while the claim is fresh.
        assert!(
            !store
                .try_claim_resume(campaign.id, phase, "proc-b", 300)
                .unwrap()
        );
        // The holder can refresh its own claim.
        assert!(
            store
                .try_claim_resume(campaign.id, phase, "proc-a", 300)
                .unwrap()
        );
        store
            .release_resume_claim(campaign.id, phase, "proc-a")
            .unwrap();
        assert!(
            store
                .try_claim_resume(campaign.id, phase, "proc-b", 300)
                .unwrap()
        );
    }

    #[test]
    fn test_stale_claims_taken_over_and_swept() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = fixture(&store);
        let phase = Phase::Analysis;
        assert!(
            store
                .try_claim_resume(campaign.id, phase, "proc-a", 300)
                .unwrap()
        );
        // With a zero TTL every claim is immediately stale.
        assert!(
            store
                .try_claim_resume(campaign.id, phase, "proc-b", 0)
                .unwrap()
        );
        assert_eq!(store.sweep_expired_claims(0).unwrap(), 1);
        assert_eq!(store.sweep_expired_claims(0).unwrap(), 0);
    }
}
