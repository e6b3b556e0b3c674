//! SSE event channel: subscribers receive every bus envelope as a JSON
//! `data:` frame. A slow client only loses its own events (the broadcast
//! ring drops its oldest entries); the producer never blocks.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::api::SharedState;
use crate::metrics::RuntimeMetrics;

pub async fn events_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let metrics = Arc::clone(&state.metrics);
    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(move |received| {
        envelope_frame(&metrics, received)
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn envelope_frame(
    metrics: &Arc<RuntimeMetrics>,
    received: Result<crate::events::EventEnvelope, BroadcastStreamRecvError>,
) -> Option<Result<SseEvent, Infallible>> {
    match received {
        Ok(envelope) => {
            let name = envelope.event.name();
            match SseEvent::default().event(name).json_data(&envelope) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    debug!(error = %e, "failed to serialize event envelope");
                    None
                }
            }
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            metrics.events_dropped.fetch_add(skipped, Ordering::Relaxed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::events::{Event, EventBus};

    #[tokio::test]
    async fn test_envelope_becomes_named_frame() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(
            &RequestContext::internal(),
            None,
            Event::ModeChanged {
                mode: "full_sequence",
            },
        );
        let envelope = rx.recv().await.unwrap();
        let metrics = RuntimeMetrics::new();
        let frame = envelope_frame(&metrics, Ok(envelope)).unwrap();
        assert!(frame.is_ok());
    }

    #[tokio::test]
    async fn test_lag_counts_dropped_events() {
        let metrics = RuntimeMetrics::new();
        let frame = envelope_frame(&metrics, Err(BroadcastStreamRecvError::Lagged(12)));
        assert!(frame.is_none());
        assert_eq!(metrics.events_dropped.load(Ordering::Relaxed), 12);
    }
}
