//! Typed error hierarchy for the campaign engine.
//!
//! Two layers:
//! - `StoreError` — what the campaign store surfaces (never leaks raw
//!   SQLite strings past the orchestrator)
//! - `CoreError` — the public taxonomy with stable codes, which the HTTP
//!   adapter maps onto status codes and `{code, message, timestamp,
//!   request_id}` bodies

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::phase::Phase;

/// Errors surfaced by the campaign store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("version conflict")]
    VersionConflict,

    #[error("transient store failure: {0}")]
    Retryable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Classify a raw SQLite error. Busy/locked are transient; constraint
    /// failures are split into duplicate-key vs foreign-key so the create
    /// path can self-heal weak references.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                let detail = msg.clone().unwrap_or_else(|| e.to_string());
                match e.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        StoreError::Retryable(detail)
                    }
                    ErrorCode::ConstraintViolation => {
                        if detail.contains("FOREIGN KEY") {
                            StoreError::ForeignKey(detail)
                        } else {
                            StoreError::DuplicateEntry(detail)
                        }
                    }
                    _ => StoreError::Other(err.into()),
                }
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            _ => StoreError::Other(err.into()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::from_sqlite(err)
    }
}

/// The public error taxonomy. Every variant has a stable code; the HTTP
/// adapter decides the status.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("missing phase configurations: {}", format_phases(.missing))]
    MissingPhaseConfigs { missing: Vec<Phase> },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Internal(String),
}

fn format_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(|p| p.wire_name())
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidConfig(_) => "invalid_config",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::MissingPhaseConfigs { .. } => "missing_phase_configs",
            Self::Unauthorized(_) => "unauthorized",
            Self::Retryable(_) => "retryable",
            Self::Internal(_) => "internal",
        }
    }

    /// Map a store failure onto the public taxonomy. `what` names the
    /// addressed entity for the NotFound message.
    pub fn from_store(err: StoreError, what: &str) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound(format!("{} not found", what)),
            StoreError::DuplicateEntry(_) => Self::Conflict(format!("{} already exists", what)),
            StoreError::ForeignKey(detail) => {
                Self::Conflict(format!("{}: referenced row missing ({})", what, detail))
            }
            StoreError::VersionConflict => {
                Self::Conflict(format!("{} was modified concurrently", what))
            }
            StoreError::Retryable(detail) => Self::Retryable(detail),
            StoreError::Other(e) => Self::Internal(e.to_string()),
        }
    }
}

/// Heuristic classification of error strings coming back from phase
/// services. Their messages are free-form, so validation-shaped wording is
/// surfaced as `InvalidConfig` and everything else as `Internal`.
pub fn classify_service_error(message: &str) -> CoreError {
    let lower = message.to_lowercase();
    if lower.contains("invalid") || lower.contains("cannot ") || lower.contains("must ") {
        CoreError::InvalidConfig(message.to_string())
    } else {
        CoreError::Internal(message.to_string())
    }
}

/// Wire shape for every public error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub timestamp: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_phases: Option<Vec<String>>,
}

impl ErrorBody {
    pub fn new(err: &CoreError, request_id: &str) -> Self {
        let missing_phases = match err {
            CoreError::MissingPhaseConfigs { missing } => Some(
                missing
                    .iter()
                    .map(|p| p.wire_name().to_string())
                    .collect(),
            ),
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: request_id.to_string(),
            missing_phases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err = CoreError::from_store(StoreError::NotFound, "campaign");
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(err.code(), "not_found");
        assert!(err.to_string().contains("campaign"));
    }

    #[test]
    fn store_duplicate_maps_to_conflict() {
        let err = CoreError::from_store(
            StoreError::DuplicateEntry("UNIQUE constraint failed".into()),
            "campaign",
        );
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn version_conflict_maps_to_conflict() {
        let err = CoreError::from_store(StoreError::VersionConflict, "campaign state");
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn missing_phase_configs_lists_wire_names() {
        let err = CoreError::MissingPhaseConfigs {
            missing: vec![Phase::DnsValidation, Phase::Enrichment],
        };
        assert_eq!(err.code(), "missing_phase_configs");
        assert!(err.to_string().contains("validation"));
        assert!(err.to_string().contains("enrichment"));

        let body = ErrorBody::new(&err, "req-1");
        assert_eq!(
            body.missing_phases.as_deref(),
            Some(&["validation".to_string(), "enrichment".to_string()][..])
        );
    }

    #[test]
    fn service_errors_classified_by_wording() {
        assert!(matches!(
            classify_service_error("invalid persona list"),
            CoreError::InvalidConfig(_)
        ));
        assert!(matches!(
            classify_service_error("value must be positive"),
            CoreError::InvalidConfig(_)
        ));
        assert!(matches!(
            classify_service_error("cannot start without config"),
            CoreError::InvalidConfig(_)
        ));
        assert!(matches!(
            classify_service_error("connection reset by peer"),
            CoreError::Internal(_)
        ));
    }

    #[test]
    fn error_body_carries_request_id_and_timestamp() {
        let err = CoreError::NotFound("campaign not found".into());
        let body = ErrorBody::new(&err, "abc-123");
        assert_eq!(body.request_id, "abc-123");
        assert_eq!(body.code, "not_found");
        assert!(!body.timestamp.is_empty());
        assert!(body.missing_phases.is_none());
    }
}
