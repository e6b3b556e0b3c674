//! Enrichment and analysis phases. Enrichment attaches the feature bag to
//! fetched domains; analysis scores domains against the configured keyword
//! rules and classifies them as leads.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{BatchResult, JobSpec, PhaseJob, ServiceRuntime};
use crate::errors::CoreError;
use crate::orchestrator::validation::{AnalysisConfig, PhaseConfig};
use crate::phase::Phase;
use crate::store::domains::CounterColumn;
use crate::store::models::{GeneratedDomain, LeadStatus};

const BATCH: i64 = 100;

// ── Enrichment ───────────────────────────────────────────────────────

pub(crate) struct EnrichmentSpec;

impl JobSpec for EnrichmentSpec {
    fn phase(&self) -> Phase {
        Phase::Enrichment
    }

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError> {
        PhaseConfig::validate(Phase::Enrichment, &config)?;
        Ok(Arc::new(EnrichmentJob {
            runtime: Arc::clone(runtime),
            campaign_id,
        }))
    }
}

struct EnrichmentJob {
    runtime: Arc<ServiceRuntime>,
    campaign_id: Uuid,
}

#[async_trait]
impl PhaseJob for EnrichmentJob {
    async fn total(&self) -> Result<i64, CoreError> {
        let campaign_id = self.campaign_id;
        self.runtime
            .db
            .call(move |store| store.count_pending_for_enrichment(campaign_id))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))
    }

    async fn step(&self) -> Result<BatchResult, CoreError> {
        let campaign_id = self.campaign_id;
        let batch = self
            .runtime
            .db
            .call(move |store| store.pending_domains_for_enrichment(campaign_id, BATCH))
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

        for domain in &batch {
            let features = self.runtime.backend.enrich(&domain.domain_name).await;
            let domain_id = domain.id;
            self.runtime
                .db
                .call(move |store| store.set_domain_features(domain_id, &features))
                .await
                .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        }

        let processed = batch.len() as i64;
        Ok(BatchResult {
            processed,
            successful: processed,
            failed: 0,
            done: processed < BATCH,
        })
    }
}

// ── Analysis ─────────────────────────────────────────────────────────

pub(crate) struct AnalysisSpec;

impl JobSpec for AnalysisSpec {
    fn phase(&self) -> Phase {
        Phase::Analysis
    }

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError> {
        let PhaseConfig::Analysis(config) = PhaseConfig::validate(Phase::Analysis, &config)?
        else {
            unreachable!("analysis validator returns the analysis variant");
        };
        Ok(Arc::new(AnalysisJob {
            runtime: Arc::clone(runtime),
            campaign_id,
            config,
        }))
    }
}

struct AnalysisJob {
    runtime: Arc<ServiceRuntime>,
    campaign_id: Uuid,
    config: AnalysisConfig,
}

impl AnalysisJob {
    /// Weighted keyword score over the domain label. No rules means no
    /// signal: the domain is classified `no_match` with a zero score.
    fn score(&self, domain: &GeneratedDomain) -> (LeadStatus, f64) {
        let total_weight: f64 = self.config.keyword_rules.iter().map(|r| r.weight).sum();
        if total_weight <= 0.0 {
            return (LeadStatus::NoMatch, 0.0);
        }
        let label = domain
            .domain_name
            .split('.')
            .next()
            .unwrap_or(&domain.domain_name);
        let matched_weight: f64 = self
            .config
            .keyword_rules
            .iter()
            .filter(|rule| label.contains(rule.keyword.as_str()))
            .map(|rule| rule.weight)
            .sum();
        if matched_weight > 0.0 {
            (LeadStatus::Match, matched_weight / total_weight)
        } else {
            (LeadStatus::NoMatch, 0.0)
        }
    }
}

#[async_trait]
impl PhaseJob for AnalysisJob {
    async fn total(&self) -> Result<i64, CoreError> {
        let campaign_id = self.campaign_id;
        self.runtime
            .db
            .call(move |store| store.count_pending_for_analysis(campaign_id))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))
    }

    async fn step(&self) -> Result<BatchResult, CoreError> {
        let campaign_id = self.campaign_id;
        let batch = self
            .runtime
            .db
            .call(move |store| store.pending_domains_for_analysis(campaign_id, BATCH))
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
        for domain in &batch {
            let (status, score) = self.score(domain);
            if status == LeadStatus::Match {
                successful += 1;
            }
            let domain_id = domain.id;
            self.runtime
                .db
                .call(move |store| {
                    store.set_lead_result(domain_id, status, Some(score))?;
                    store.bump_domain_counters(
                        campaign_id,
                        &[
                            (CounterColumn::LeadPending, -1),
                            (CounterColumn::for_lead(status), 1),
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
            failed: processed - successful,
            done: processed < BATCH,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::validation::KeywordRule;

    fn domain_named(name: &str) -> GeneratedDomain {
        GeneratedDomain {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            domain_name: name.to_string(),
            offset_index: 0,
            created_at: String::new(),
            dns_status: crate::store::models::DomainResultStatus::Ok,
            dns_reason: None,
            http_status: crate::store::models::DomainResultStatus::Ok,
            http_reason: None,
            lead_status: LeadStatus::Pending,
            domain_score: None,
            features: None,
            last_http_fetched_at: None,
        }
    }

    fn job_with_rules(rules: Vec<KeywordRule>) -> AnalysisJob {
        use crate::events::EventBus;
        use crate::metrics::RuntimeMetrics;
        use crate::services::probe::AcceptAllBackend;
        use crate::store::{CampaignStore, DbHandle};
        AnalysisJob {
            runtime: ServiceRuntime::new(
                DbHandle::new(CampaignStore::in_memory().unwrap()),
                EventBus::new(),
                RuntimeMetrics::new(),
                Arc::new(AcceptAllBackend),
            ),
            campaign_id: Uuid::new_v4(),
            config: AnalysisConfig {
                persona_ids: vec![Uuid::new_v4()],
                keyword_rules: rules,
            },
        }
    }

    #[test]
    fn test_score_weights_matched_rules() {
        let job = job_with_rules(vec![
            KeywordRule {
                keyword: "shop".into(),
                weight: 3.0,
            },
            KeywordRule {
                keyword: "crm".into(),
                weight: 1.0,
            },
        ]);
        let (status, score) = job.score(&domain_named("myshop.com"));
        assert_eq!(status, LeadStatus::Match);
        assert!((score - 0.75).abs() < 1e-9);

        let (status, score) = job.score(&domain_named("plain.com"));
        assert_eq!(status, LeadStatus::NoMatch);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_score_without_rules_is_no_match() {
        let job = job_with_rules(vec![]);
        let (status, score) = job.score(&domain_named("anything.com"));
        assert_eq!(status, LeadStatus::NoMatch);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_score_ignores_tld() {
        let job = job_with_rules(vec![KeywordRule {
            keyword: "com".into(),
            weight: 1.0,
        }]);
        let (status, _) = job.score(&domain_named("example.com"));
        assert_eq!(status, LeadStatus::NoMatch);
    }
}
