//! Per-request context threaded explicitly through orchestrator operations.

use uuid::Uuid;

/// Identifies who asked for an operation and which log lines belong to it.
/// Passed as the first parameter to every orchestrator operation; there is
/// no ambient/thread-local fallback.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id connecting a user action to its downstream effects.
    pub request_id: String,
    /// Authenticated caller, when the adapter knows one. Authn itself is
    /// external; the core only forwards the id into events and logs.
    pub user_id: Option<Uuid>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, user_id: Option<Uuid>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
        }
    }

    /// Fresh context with a generated correlation id, for callers that have
    /// none (background workers, CLI entry points).
    pub fn internal() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            user_id: None,
        }
    }

    /// Context for chain-runner auto-starts: correlation id inherited from
    /// the completed phase's event, never synthesized from heuristics.
    pub fn chained(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::internal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_contexts_get_distinct_request_ids() {
        let a = RequestContext::internal();
        let b = RequestContext::internal();
        assert_ne!(a.request_id, b.request_id);
        assert!(a.user_id.is_none());
    }

    #[test]
    fn chained_context_inherits_request_id() {
        let ctx = RequestContext::chained("req-7");
        assert_eq!(ctx.request_id, "req-7");
    }
}
