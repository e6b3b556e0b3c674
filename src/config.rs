//! Runtime configuration loaded from the environment.
//!
//! `AppConfig::from_env` reads the `DB_*` family, the server port, the
//! deployment environment, feature flags, and background-worker tuning.
//! Everything has a development-friendly default so `leadforge serve` works
//! out of the box.

use anyhow::{Context, Result, anyhow};

/// Deployment environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(anyhow!("Invalid ENVIRONMENT value: {}", other)),
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Connection settings for the relational store.
///
/// The engine itself is out of scope; the embedded SQLite backend uses
/// `name` as the database file path (`:memory:` is accepted for tests).
/// The remaining fields are parsed and kept so a server-backed store can be
/// swapped in without touching configuration call sites.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
}

impl DbConfig {
    /// Path of the SQLite backing file.
    pub fn database_path(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub server_port: u16,
    pub environment: Environment,

    // Feature flags for experimental domain-listing paths.
    pub enable_advanced_filters: bool,
    pub analysis_server_sort: bool,

    // Background-worker tuning (seconds).
    pub rehydration_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub aggregates_ttl_secs: u64,

    // Counter-reconciler policy.
    pub reconcile_drift_threshold_pct: f64,
    pub reconcile_auto_correct: bool,
    pub reconcile_max_corrections: usize,
}

impl AppConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an explicit lookup function. Lets tests supply values
    /// without mutating process-global environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let get_bool = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };

        let environment = Environment::from_str(&get("ENVIRONMENT", "development"))?;

        let db = DbConfig {
            host: get("DB_HOST", "localhost"),
            port: get("DB_PORT", "5432")
                .parse()
                .context("DB_PORT must be a port number")?,
            user: get("DB_USER", "leadforge"),
            password: get("DB_PASSWORD", ""),
            name: get("DB_NAME", ".leadforge/campaigns.db"),
            sslmode: get("DB_SSLMODE", "disable"),
        };

        Ok(Self {
            db,
            server_port: get("SERVER_PORT", "8090")
                .parse()
                .context("SERVER_PORT must be a port number")?,
            environment,
            enable_advanced_filters: get_bool("ENABLE_ADVANCED_FILTERS", false),
            analysis_server_sort: get_bool("ANALYSIS_SERVER_SORT", false),
            rehydration_interval_secs: get("REHYDRATION_INTERVAL_SECS", "60")
                .parse()
                .context("REHYDRATION_INTERVAL_SECS must be an integer")?,
            reconcile_interval_secs: get("RECONCILE_INTERVAL_SECS", "120")
                .parse()
                .context("RECONCILE_INTERVAL_SECS must be an integer")?,
            cleanup_interval_secs: get("CLEANUP_INTERVAL_SECS", "300")
                .parse()
                .context("CLEANUP_INTERVAL_SECS must be an integer")?,
            aggregates_ttl_secs: get("AGGREGATES_TTL_SECS", "30")
                .parse()
                .context("AGGREGATES_TTL_SECS must be an integer")?,
            reconcile_drift_threshold_pct: get("RECONCILE_DRIFT_THRESHOLD_PCT", "5.0")
                .parse()
                .context("RECONCILE_DRIFT_THRESHOLD_PCT must be a number")?,
            reconcile_auto_correct: get_bool("RECONCILE_AUTO_CORRECT", true),
            reconcile_max_corrections: get("RECONCILE_MAX_CORRECTIONS", "25")
                .parse()
                .context("RECONCILE_MAX_CORRECTIONS must be an integer")?,
        })
    }
}
