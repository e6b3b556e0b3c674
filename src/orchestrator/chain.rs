//! Chain runner: subscribes to the event bus and advances full-sequence
//! campaigns when phases complete. The orchestrator never polls phase
//! services; this task is the only listener that turns completion events
//! back into orchestrator calls.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Orchestrator;
use crate::context::RequestContext;
use crate::events::Event;
use crate::phase::Phase;

pub fn spawn(
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = orchestrator.bus().subscribe();
    tokio::spawn(async move {
        info!("chain runner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("chain runner stopping");
                    return;
                }
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        let Some(campaign_id) = envelope.campaign_id else {
                            continue;
                        };
                        // Auto-starts inherit the correlation id of the event
                        // that completed the previous phase.
                        let ctx = RequestContext::chained(envelope.request_id.clone());
                        match &envelope.event {
                            Event::PhaseCompleted { phase, .. } => {
                                if let Ok(phase) = Phase::from_wire_name(phase) {
                                    orchestrator
                                        .handle_phase_completed(&ctx, campaign_id, phase)
                                        .await;
                                }
                            }
                            Event::PhaseFailed { .. } => {
                                orchestrator.handle_phase_failed(&ctx, campaign_id).await;
                            }
                            _ => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "chain runner lagged behind the bus");
                        orchestrator
                            .metrics()
                            .events_dropped
                            .fetch_add(skipped, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}
