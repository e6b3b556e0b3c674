//! Durable campaign store over SQLite.
//!
//! One `CampaignStore` owns the connection; async callers go through
//! `DbHandle::call`, which moves the closure onto the blocking pool. All
//! public methods surface `StoreError` so callers never see raw SQLite
//! strings.

pub mod domains;
pub mod executions;
pub mod models;
pub mod offsets;

pub use domains::{DomainCursor, DomainFilters, DomainPage, DomainQuery, DomainSort};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::phase::{CampaignMode, CampaignStateTag, PHASE_ORDER, Phase, PhaseStatus};
use models::*;

pub struct CampaignStore {
    pub(crate) conn: Connection,
}

impl CampaignStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create database directory")
                .map_err(StoreError::Other)?;
        }
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(StoreError::Other)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(StoreError::Other)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 2000;")
            .map_err(StoreError::from)?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS campaigns (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    user_id TEXT REFERENCES users(id),
                    current_phase TEXT NOT NULL DEFAULT 'domain_generation',
                    phase_status TEXT NOT NULL DEFAULT 'not_started',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS campaign_state (
                    campaign_id TEXT PRIMARY KEY
                        REFERENCES campaigns(id) ON DELETE CASCADE,
                    current_state TEXT NOT NULL DEFAULT 'draft',
                    mode TEXT NOT NULL DEFAULT 'step_by_step',
                    configuration TEXT NOT NULL DEFAULT '{}',
                    version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_configurations (
                    campaign_id TEXT NOT NULL
                        REFERENCES campaigns(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    configuration TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (campaign_id, phase)
                );

                CREATE TABLE IF NOT EXISTS phase_executions (
                    id TEXT PRIMARY KEY,
                    campaign_id TEXT NOT NULL
                        REFERENCES campaigns(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'not_started',
                    started_at TEXT,
                    paused_at TEXT,
                    failed_at TEXT,
                    completed_at TEXT,
                    items_total INTEGER NOT NULL DEFAULT 0,
                    items_processed INTEGER NOT NULL DEFAULT 0,
                    items_successful INTEGER NOT NULL DEFAULT 0,
                    items_failed INTEGER NOT NULL DEFAULT 0,
                    progress_pct REAL NOT NULL DEFAULT 0,
                    configuration TEXT,
                    error_details TEXT,
                    metrics TEXT,
                    is_auto_start INTEGER NOT NULL DEFAULT 0,
                    correlation_id TEXT NOT NULL DEFAULT '',
                    UNIQUE(campaign_id, phase)
                );

                CREATE TABLE IF NOT EXISTS generated_domains (
                    id TEXT PRIMARY KEY,
                    campaign_id TEXT NOT NULL
                        REFERENCES campaigns(id) ON DELETE CASCADE,
                    domain_name TEXT NOT NULL,
                    offset_index INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    dns_status TEXT NOT NULL DEFAULT 'pending',
                    dns_reason TEXT,
                    http_status TEXT NOT NULL DEFAULT 'pending',
                    http_reason TEXT,
                    lead_status TEXT NOT NULL DEFAULT 'pending',
                    domain_score REAL,
                    features TEXT,
                    last_http_fetched_at TEXT,
                    UNIQUE(campaign_id, offset_index),
                    UNIQUE(campaign_id, domain_name)
                );

                CREATE TABLE IF NOT EXISTS campaign_domain_counters (
                    campaign_id TEXT PRIMARY KEY
                        REFERENCES campaigns(id) ON DELETE CASCADE,
                    total INTEGER NOT NULL DEFAULT 0,
                    dns_pending INTEGER NOT NULL DEFAULT 0,
                    dns_ok INTEGER NOT NULL DEFAULT 0,
                    dns_error INTEGER NOT NULL DEFAULT 0,
                    dns_timeout INTEGER NOT NULL DEFAULT 0,
                    http_pending INTEGER NOT NULL DEFAULT 0,
                    http_ok INTEGER NOT NULL DEFAULT 0,
                    http_error INTEGER NOT NULL DEFAULT 0,
                    http_timeout INTEGER NOT NULL DEFAULT 0,
                    lead_pending INTEGER NOT NULL DEFAULT 0,
                    lead_match INTEGER NOT NULL DEFAULT 0,
                    lead_no_match INTEGER NOT NULL DEFAULT 0,
                    lead_error INTEGER NOT NULL DEFAULT 0,
                    lead_timeout INTEGER NOT NULL DEFAULT 0,
                    campaign_version INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS domain_generation_phase_config_state (
                    config_hash TEXT PRIMARY KEY,
                    last_offset INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_resume_claims (
                    campaign_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    claimed_by TEXT NOT NULL,
                    claimed_at TEXT NOT NULL,
                    PRIMARY KEY (campaign_id, phase)
                );

                CREATE INDEX IF NOT EXISTS idx_campaigns_user ON campaigns(user_id);
                CREATE INDEX IF NOT EXISTS idx_executions_campaign
                    ON phase_executions(campaign_id);
                CREATE INDEX IF NOT EXISTS idx_executions_status
                    ON phase_executions(status);
                CREATE INDEX IF NOT EXISTS idx_domains_campaign
                    ON generated_domains(campaign_id, offset_index);
                CREATE INDEX IF NOT EXISTS idx_domains_dns
                    ON generated_domains(campaign_id, dns_status);
                CREATE INDEX IF NOT EXISTS idx_domains_http
                    ON generated_domains(campaign_id, http_status);
                CREATE INDEX IF NOT EXISTS idx_domains_score
                    ON generated_domains(campaign_id, domain_score);
                ",
            )
            .map_err(StoreError::from)
    }

    pub(crate) fn now() -> String {
        Utc::now().to_rfc3339()
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Minimal user record; campaigns reference it weakly. The user store
    /// itself is an external collaborator, this table only anchors the FK.
    pub fn create_user(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![id.to_string(), Self::now()],
        )?;
        Ok(())
    }

    // ── Campaign CRUD ─────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        id: Uuid,
        name: &str,
        user_id: Option<Uuid>,
        metadata: &Value,
    ) -> Result<Campaign, StoreError> {
        let now = Self::now();
        self.conn.execute(
            "INSERT INTO campaigns (id, name, user_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                name,
                user_id.map(|u| u.to_string()),
                metadata.to_string(),
                now
            ],
        )?;
        self.get_campaign(id)
    }

    pub fn get_campaign(&self, id: Uuid) -> Result<Campaign, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, user_id, current_phase, phase_status, metadata,
                        created_at, updated_at, started_at, completed_at
                 FROM campaigns WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(CampaignRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        user_id: row.get(2)?,
                        current_phase: row.get(3)?,
                        phase_status: row.get(4)?,
                        metadata: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                        started_at: row.get(8)?,
                        completed_at: row.get(9)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        row.into_campaign()
    }

    pub fn list_campaigns(&self, filter: &CampaignFilter) -> Result<Vec<Campaign>, StoreError> {
        let mut sql = String::from(
            "SELECT id, name, user_id, current_phase, phase_status, metadata,
                    created_at, updated_at, started_at, completed_at
             FROM campaigns WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.phase_status {
            sql.push_str(" AND phase_status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(phase) = filter.current_phase {
            sql.push_str(" AND current_phase = ?");
            args.push(Box::new(phase.as_str().to_string()));
        }
        if let Some(user_id) = filter.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Box::new(user_id.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
        args.push(Box::new(filter.limit));
        args.push(Box::new(filter.offset));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(CampaignRow {
                id: row.get(0)?,
                name: row.get(1)?,
                user_id: row.get(2)?,
                current_phase: row.get(3)?,
                phase_status: row.get(4)?,
                metadata: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
                started_at: row.get(8)?,
                completed_at: row.get(9)?,
            })
        })?;
        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row?.into_campaign()?);
        }
        Ok(campaigns)
    }

    pub fn update_campaign(
        &self,
        id: Uuid,
        name: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<Campaign, StoreError> {
        let now = Self::now();
        if let Some(n) = name {
            let changed = self.conn.execute(
                "UPDATE campaigns SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![n, now, id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
        }
        if let Some(m) = metadata {
            let changed = self.conn.execute(
                "UPDATE campaigns SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![m.to_string(), now, id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
        }
        self.get_campaign(id)
    }

    /// Move the campaign's phase cursor (current phase + its status tag).
    pub fn set_campaign_phase_position(
        &self,
        id: Uuid,
        phase: Phase,
        status: PhaseStatus,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE campaigns SET current_phase = ?1, phase_status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![phase.as_str(), status.as_str(), Self::now(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Stamp `started_at` on first phase start; later starts keep the original.
    pub fn mark_campaign_started(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE campaigns SET started_at = COALESCE(started_at, ?1), updated_at = ?1
             WHERE id = ?2",
            params![Self::now(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_campaign_completed(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE campaigns SET completed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![Self::now(), id.to_string()],
        )?;
        Ok(())
    }

    /// Delete a campaign; dependent rows cascade. Returns false if absent.
    pub fn delete_campaign(&self, id: Uuid) -> Result<bool, StoreError> {
        let count = self.conn.execute(
            "DELETE FROM campaigns WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(count > 0)
    }

    // ── Campaign state (1:1, optimistic locking) ──────────────────────

    pub fn create_campaign_state(
        &self,
        campaign_id: Uuid,
        mode: CampaignMode,
        configuration: &Value,
    ) -> Result<CampaignState, StoreError> {
        self.conn.execute(
            "INSERT INTO campaign_state (campaign_id, mode, configuration, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                campaign_id.to_string(),
                mode.as_str(),
                configuration.to_string(),
                Self::now()
            ],
        )?;
        self.get_campaign_state(campaign_id)
    }

    pub fn get_campaign_state(&self, campaign_id: Uuid) -> Result<CampaignState, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT campaign_id, current_state, mode, configuration, version, updated_at
                 FROM campaign_state WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| {
                    Ok(CampaignStateRow {
                        campaign_id: row.get(0)?,
                        current_state: row.get(1)?,
                        mode: row.get(2)?,
                        configuration: row.get(3)?,
                        version: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        row.into_state()
    }

    /// Compare-and-swap update of the state row. The write only lands if
    /// `version` still equals `expected_version`; the version is bumped on
    /// success.
    pub fn update_campaign_state_cas(
        &self,
        campaign_id: Uuid,
        expected_version: i64,
        patch: &StatePatch,
    ) -> Result<CampaignState, StoreError> {
        let current = self.get_campaign_state(campaign_id)?;
        let state = patch
            .current_state
            .unwrap_or(current.current_state)
            .as_str();
        let mode = patch.mode.unwrap_or(current.mode).as_str();
        let configuration = patch
            .configuration
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| current.configuration.to_string());

        let changed = self.conn.execute(
            "UPDATE campaign_state
             SET current_state = ?1, mode = ?2, configuration = ?3,
                 version = version + 1, updated_at = ?4
             WHERE campaign_id = ?5 AND version = ?6",
            params![
                state,
                mode,
                configuration,
                Self::now(),
                campaign_id.to_string(),
                expected_version
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::VersionConflict);
        }
        self.get_campaign_state(campaign_id)
    }

    pub fn delete_campaign_state(&self, campaign_id: Uuid) -> Result<bool, StoreError> {
        let count = self.conn.execute(
            "DELETE FROM campaign_state WHERE campaign_id = ?1",
            params![campaign_id.to_string()],
        )?;
        Ok(count > 0)
    }

    // ── Phase configurations ──────────────────────────────────────────

    pub fn upsert_phase_config(
        &self,
        campaign_id: Uuid,
        phase: Phase,
        configuration: &Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO phase_configurations (campaign_id, phase, configuration, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(campaign_id, phase) DO UPDATE SET
                configuration = ?3, updated_at = ?4",
            params![
                campaign_id.to_string(),
                phase.as_str(),
                configuration.to_string(),
                Self::now()
            ],
        )?;
        Ok(())
    }

    pub fn get_phase_config(
        &self,
        campaign_id: Uuid,
        phase: Phase,
    ) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT configuration FROM phase_configurations
                 WHERE campaign_id = ?1 AND phase = ?2",
                params![campaign_id.to_string(), phase.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .context("Malformed phase configuration JSON")
                .map_err(StoreError::Other)
        })
        .transpose()
    }

    pub fn list_phase_configs(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<(Phase, Value)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT phase, configuration FROM phase_configurations WHERE campaign_id = ?1",
        )?;
        let rows = stmt.query_map(params![campaign_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut configs = Vec::new();
        for row in rows {
            let (phase, raw) = row?;
            let phase =
                Phase::from_str(&phase).map_err(|e| StoreError::Other(anyhow!(e)))?;
            let value: Value = serde_json::from_str(&raw)
                .context("Malformed phase configuration JSON")
                .map_err(StoreError::Other)?;
            configs.push((phase, value));
        }
        configs.sort_by_key(|(p, _)| p.index());
        Ok(configs)
    }

    /// Which of the five phases have a stored configuration.
    pub fn configured_phases(&self, campaign_id: Uuid) -> Result<Vec<Phase>, StoreError> {
        Ok(self
            .list_phase_configs(campaign_id)?
            .into_iter()
            .map(|(p, _)| p)
            .collect())
    }
}

/// Filters for `list_campaigns`.
#[derive(Debug, Clone)]
pub struct CampaignFilter {
    pub phase_status: Option<PhaseStatus>,
    pub current_phase: Option<Phase>,
    pub user_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for CampaignFilter {
    fn default() -> Self {
        Self {
            phase_status: None,
            current_phase: None,
            user_id: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Partial update for the campaign state row.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub current_state: Option<CampaignStateTag>,
    pub mode: Option<CampaignMode>,
    pub configuration: Option<Value>,
}

// ── Async handle ─────────────────────────────────────────────────────

/// Shared handle that runs store closures on the blocking pool.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<CampaignStore>>,
}

impl DbHandle {
    pub fn new(store: CampaignStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&CampaignStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| StoreError::Other(anyhow!("store lock poisoned")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Other(anyhow!("store task join failed: {}", e)))?
    }

    /// Synchronous access for startup paths and tests.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, CampaignStore>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Other(anyhow!("store lock poisoned")))
    }
}

/// Seed the five execution rows for a fresh campaign.
pub fn seed_executions(store: &CampaignStore, campaign_id: Uuid) -> Result<(), StoreError> {
    for phase in PHASE_ORDER {
        store.conn.execute(
            "INSERT OR IGNORE INTO phase_executions (id, campaign_id, phase) VALUES (?1, ?2, ?3)",
            params![
                Uuid::new_v4().to_string(),
                campaign_id.to_string(),
                phase.as_str()
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn campaign_fixture(store: &CampaignStore) -> Campaign {
        let campaign = store
            .create_campaign(Uuid::new_v4(), "acme-outreach", None, &serde_json::json!({}))
            .unwrap();
        store
            .create_campaign_state(campaign.id, CampaignMode::StepByStep, &serde_json::json!({}))
            .unwrap();
        seed_executions(store, campaign.id).unwrap();
        campaign
    }

    #[test]
    fn test_migrations_create_tables() {
        let store = CampaignStore::in_memory().unwrap();
        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('campaigns', 'campaign_state', 'phase_configurations', 'phase_executions',
                  'generated_domains', 'campaign_domain_counters',
                  'domain_generation_phase_config_state', 'phase_resume_claims')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn test_create_and_get_campaign() {
        let store = CampaignStore::in_memory().unwrap();
        let id = Uuid::new_v4();
        let campaign = store
            .create_campaign(id, "spring-launch", None, &serde_json::json!({"note": "x"}))
            .unwrap();
        assert_eq!(campaign.id, id);
        assert_eq!(campaign.name, "spring-launch");
        assert_eq!(campaign.current_phase, Phase::DomainGeneration);
        assert_eq!(campaign.phase_status, PhaseStatus::NotStarted);
        assert_eq!(campaign.metadata["note"], "x");
        assert!(campaign.started_at.is_none());
    }

    #[test]
    fn test_get_missing_campaign_is_not_found() {
        let store = CampaignStore::in_memory().unwrap();
        let err = store.get_campaign(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_campaign_user_fk_enforced() {
        let store = CampaignStore::in_memory().unwrap();
        let err = store
            .create_campaign(
                Uuid::new_v4(),
                "bad-owner",
                Some(Uuid::new_v4()),
                &serde_json::json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey(_)));

        // With the user present the same insert succeeds.
        let user = Uuid::new_v4();
        store.create_user(user).unwrap();
        let campaign = store
            .create_campaign(Uuid::new_v4(), "good-owner", Some(user), &serde_json::json!({}))
            .unwrap();
        assert_eq!(campaign.user_id, Some(user));
    }

    #[test]
    fn test_state_cas_bumps_version_and_detects_conflict() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = campaign_fixture(&store);
        let state = store.get_campaign_state(campaign.id).unwrap();
        assert_eq!(state.version, 1);

        let updated = store
            .update_campaign_state_cas(
                campaign.id,
                state.version,
                &StatePatch {
                    mode: Some(CampaignMode::FullSequence),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.mode, CampaignMode::FullSequence);

        // Stale version loses.
        let err = store
            .update_campaign_state_cas(campaign.id, state.version, &StatePatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));
    }

    #[test]
    fn test_phase_config_upsert_overwrites() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = campaign_fixture(&store);
        store
            .upsert_phase_config(
                campaign.id,
                Phase::DnsValidation,
                &serde_json::json!({"batchSize": 100}),
            )
            .unwrap();
        store
            .upsert_phase_config(
                campaign.id,
                Phase::DnsValidation,
                &serde_json::json!({"batchSize": 250}),
            )
            .unwrap();
        let config = store
            .get_phase_config(campaign.id, Phase::DnsValidation)
            .unwrap()
            .unwrap();
        assert_eq!(config["batchSize"], 250);
        assert_eq!(
            store.configured_phases(campaign.id).unwrap(),
            vec![Phase::DnsValidation]
        );
    }

    #[test]
    fn test_delete_campaign_cascades() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign = campaign_fixture(&store);
        store
            .upsert_phase_config(campaign.id, Phase::DomainGeneration, &serde_json::json!({}))
            .unwrap();

        assert!(store.delete_campaign(campaign.id).unwrap());
        assert!(matches!(
            store.get_campaign_state(campaign.id).unwrap_err(),
            StoreError::NotFound
        ));
        assert!(
            store
                .get_phase_config(campaign.id, Phase::DomainGeneration)
                .unwrap()
                .is_none()
        );
        // Idempotent in the NotFound sense.
        assert!(!store.delete_campaign(campaign.id).unwrap());
    }

    #[test]
    fn test_list_campaigns_filters_by_phase() {
        let store = CampaignStore::in_memory().unwrap();
        let a = campaign_fixture(&store);
        let _b = campaign_fixture(&store);
        store
            .set_campaign_phase_position(a.id, Phase::DnsValidation, PhaseStatus::Running)
            .unwrap();

        let running = store
            .list_campaigns(&CampaignFilter {
                current_phase: Some(Phase::DnsValidation),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let all = store.list_campaigns(&CampaignFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }
}
