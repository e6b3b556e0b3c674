//! Seam to the external phase workers (DNS resolver, HTTP fetcher,
//! enrichment lookups). The engine only depends on this trait; the real
//! resolver fleet lives outside the process and a permissive default keeps
//! the pipeline runnable without it.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::store::models::DomainResultStatus;

/// Result of probing one domain.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: DomainResultStatus,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn ok() -> Self {
        Self {
            status: DomainResultStatus::Ok,
            reason: None,
        }
    }
}

#[async_trait]
pub trait ProbeBackend: Send + Sync {
    /// Resolve a domain; `error`/`timeout` outcomes carry a reason.
    async fn probe_dns(&self, domain: &str) -> ProbeOutcome;

    /// Fetch a domain and scan for keywords.
    async fn probe_http(&self, domain: &str, keywords: &[String]) -> ProbeOutcome;

    /// Feature bag for a fetched domain (parked flag, contacts, ...).
    async fn enrich(&self, domain: &str) -> Value;
}

/// Default backend: every domain resolves and fetches cleanly. Production
/// wiring replaces this with the resolver/fetcher fleet.
pub struct AcceptAllBackend;

#[async_trait]
impl ProbeBackend for AcceptAllBackend {
    async fn probe_dns(&self, _domain: &str) -> ProbeOutcome {
        ProbeOutcome::ok()
    }

    async fn probe_http(&self, _domain: &str, _keywords: &[String]) -> ProbeOutcome {
        ProbeOutcome::ok()
    }

    async fn enrich(&self, _domain: &str) -> Value {
        json!({"parked": false})
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashSet;

    /// Scripted backend for tests: named domains fail DNS, the rest pass.
    pub struct ScriptedBackend {
        pub dns_failures: HashSet<String>,
    }

    #[async_trait]
    impl ProbeBackend for ScriptedBackend {
        async fn probe_dns(&self, domain: &str) -> ProbeOutcome {
            if self.dns_failures.contains(domain) {
                ProbeOutcome {
                    status: DomainResultStatus::Error,
                    reason: Some("NXDOMAIN".into()),
                }
            } else {
                ProbeOutcome::ok()
            }
        }

        async fn probe_http(&self, _domain: &str, _keywords: &[String]) -> ProbeOutcome {
            ProbeOutcome::ok()
        }

        async fn enrich(&self, _domain: &str) -> Value {
            json!({"parked": false, "contact_email": "owner@example.com"})
        }
    }
}
