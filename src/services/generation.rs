//! Domain-generation phase: reserves offset ranges from the allocator
//! stream and materializes domain rows.
//!
//! Generation is restart-safe by construction: the produced count is read
//! back from the store each batch, and offset collisions insert as no-ops,
//! so re-entering a half-finished execution continues where the rows end.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{BatchResult, JobSpec, PhaseJob, ServiceRuntime};
use crate::errors::CoreError;
use crate::orchestrator::validation::{GenerationConfig, PhaseConfig};
use crate::phase::Phase;
use crate::store::domains::CounterColumn;

pub(crate) struct GenerationSpec;

impl JobSpec for GenerationSpec {
    fn phase(&self) -> Phase {
        Phase::DomainGeneration
    }

    fn build_job(
        &self,
        runtime: &Arc<ServiceRuntime>,
        campaign_id: Uuid,
        config: Value,
    ) -> Result<Arc<dyn PhaseJob>, CoreError> {
        let PhaseConfig::Generation(config) =
            PhaseConfig::validate(Phase::DomainGeneration, &config)?
        else {
            unreachable!("generation validator returns the generation variant");
        };
        Ok(Arc::new(GenerationJob {
            runtime: Arc::clone(runtime),
            campaign_id,
            config,
        }))
    }
}

struct GenerationJob {
    runtime: Arc<ServiceRuntime>,
    campaign_id: Uuid,
    config: GenerationConfig,
}

#[async_trait]
impl PhaseJob for GenerationJob {
    async fn total(&self) -> Result<i64, CoreError> {
        Ok(self.config.num_domains)
    }

    async fn step(&self) -> Result<BatchResult, CoreError> {
        let campaign_id = self.campaign_id;
        let produced = self
            .runtime
            .db
            .call(move |store| store.count_domains(campaign_id))
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))?;
        let remaining = self.config.num_domains - produced;
        if remaining <= 0 {
            return Ok(BatchResult {
                processed: 0,
                successful: 0,
                failed: 0,
                done: true,
            });
        }

        let count = remaining.min(self.config.batch_size);
        let hash = self.config.pattern.config_hash();
        let start = self
            .runtime
            .db
            .call(move |store| store.reserve_offsets(&hash, count))
            .await
            .map_err(|e| CoreError::from_store(e, "pattern offset"))?;

        let batch: Vec<(i64, String)> = (start..start + count)
            .map(|offset| (offset, self.config.pattern.domain_at(offset)))
            .collect();
        let inserted = self
            .runtime
            .db
            .call(move |store| {
                let inserted = store.insert_generated_domains(campaign_id, &batch)?;
                let delta = inserted as i64;
                if delta > 0 {
                    store.bump_domain_counters(
                        campaign_id,
                        &[
                            (CounterColumn::Total, delta),
                            (CounterColumn::DnsPending, delta),
                            (CounterColumn::HttpPending, delta),
                            (CounterColumn::LeadPending, delta),
                        ],
                    )?;
                }
                Ok(inserted as i64)
            })
            .await
            .map_err(|e| CoreError::from_store(e, "generated domains"))?;

        Ok(BatchResult {
            processed: count,
            successful: inserted,
            failed: 0,
            done: produced + count >= self.config.num_domains,
        })
    }
}
