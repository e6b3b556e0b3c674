//! DNS and HTTP+keyword validation phases. Both walk the pending portion
//! of the campaign's domains in batches, push each domain through the
//! probe backend, and fold the outcome into the domain row plus the
//! best-effort counters.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{BatchResult, JobSpec, PhaseJob, ServiceRuntime};
use crate::errors::CoreError;
use crate::orchestrator::validation::{DnsConfig, HttpConfig, PhaseConfig};
use crate::phase::Phase;
use crate::store::domains::CounterColumn;
use crate::store::models::DomainResultStatus;

// ── DNS ──────────────────────────────────────────────────────────────

pub(crate) struct DnsValidationSpec;

impl JobSpec for DnsValidationSpec {
    fn phase(&self) -> Phase {
        Phase::DnsValidation
    }

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError> {
        let PhaseConfig::Dns(config) = PhaseConfig::validate(Phase::DnsValidation, &config)?
        else {
            unreachable!("dns validator returns the dns variant");
        };
        Ok(Arc::new(DnsJob {
            runtime: Arc::clone(runtime),
            campaign_id,
            config,
        }))
    }
}

struct DnsJob {
    runtime: Arc<ServiceRuntime>,
    campaign_id: Uuid,
    config: DnsConfig,
}

#[async_trait]
impl PhaseJob for DnsJob {
    async fn total(&self) -> Result<i64, CoreError> {
        let campaign_id = self.campaign_id;
        self.runtime
            .db
            .call(move |store| store.count_pending_for_dns(campaign_id))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))
    }

    async fn step(&self) -> Result<BatchResult, CoreError> {
        let campaign_id = self.campaign_id;
        let batch_size = self.config.batch_size;
        let batch = self
            .runtime
            .db
            .call(move |store| store.pending_domains_for_dns(campaign_id, batch_size))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        if batch.is_empty() {
            return Ok(BatchResult {
                processed: 0,
                successful: 0,
                failed: 0,
                done: true,
            });
        }

        let mut successful = 0;
        let mut failed = 0;
        for domain in &batch {
            let outcome = self.runtime.backend.probe_dns(&domain.domain_name).await;
            if outcome.status == DomainResultStatus::Ok {
                successful += 1;
            } else {
                failed += 1;
            }
            let domain_id = domain.id;
            self.runtime
                .db
                .call(move |store| {
                    store.set_dns_result(domain_id, outcome.status, outcome.reason.as_deref())?;
                    store.bump_domain_counters(
                        campaign_id,
                        &[
                            (CounterColumn::DnsPending, -1),
                            (CounterColumn::for_dns(outcome.status), 1),
                        ],
                    )
                })
                .await
                .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        }

        let processed = batch.len() as i64;
        Ok(BatchResult {
            processed,
            successful,
            failed,
            done: processed < batch_size,
        })
    }
}

// ── HTTP + keyword ───────────────────────────────────────────────────

/// Batch size for HTTP fetches; the config carries no knob for it.
const HTTP_BATCH: i64 = 100;

pub(crate) struct HttpKeywordSpec;

impl JobSpec for HttpKeywordSpec {
    fn phase(&self) -> Phase {
        Phase::HttpKeywordValidation
    }

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError> {
        let PhaseConfig::Http(config) =
            PhaseConfig::validate(Phase::HttpKeywordValidation, &config)?
        else {
            unreachable!("http validator returns the http variant");
        };
        Ok(Arc::new(HttpJob {
            runtime: Arc::clone(runtime),
            campaign_id,
            config,
        }))
    }
}

struct HttpJob {
    runtime: Arc<ServiceRuntime>,
    campaign_id: Uuid,
    config: HttpConfig,
}

#[async_trait]
impl PhaseJob for HttpJob {
    async fn total(&self) -> Result<i64, CoreError> {
        let campaign_id = self.campaign_id;
        self.runtime
            .db
            .call(move |store| store.count_pending_for_http(campaign_id))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))
    }

    async fn step(&self) -> Result<BatchResult, CoreError> {
        let campaign_id = self.campaign_id;
        let batch = self
            .runtime
            .db
            .call(move |store| store.pending_domains_for_http(campaign_id, HTTP_BATCH))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        if batch.is_empty() {
            return Ok(BatchResult {
                processed: 0,
                successful: 0,
                failed: 0,
                done: true,
            });
        }

        let mut successful = 0;
        let mut failed = 0;
        for domain in &batch {
            let outcome = self
                .runtime
                .backend
                .probe_http(&domain.domain_name, &self.config.keywords)
                .await;
            if outcome.status == DomainResultStatus::Ok {
                successful += 1;
            } else {
                failed += 1;
            }
            let domain_id = domain.id;
            self.runtime
                .db
                .call(move |store| {
                    store.set_http_result(domain_id, outcome.status, outcome.reason.as_deref())?;
                    store.bump_domain_counters(
                        campaign_id,
                        &[
                            (CounterColumn::HttpPending, -1),
                            (CounterColumn::for_http(outcome.status), 1),
                        ],
                    )
                })
                .await
                .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        }

        let processed = batch.len() as i64;
        Ok(BatchResult {
            processed,
            successful,
            failed,
            done: processed < HTTP_BATCH,
        })
    }
}
