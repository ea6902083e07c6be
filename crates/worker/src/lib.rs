//! Event consume loop.
//!
//! [`EventConsumer`] subscribes to the [`EventBus`] and feeds every
//! received envelope to the [`EventProcessor`]. Transient failures are
//! re-published for redelivery (the idempotency guard makes that safe);
//! permanent failures are acknowledged and recorded on the iteration.

use std::sync::Arc;
use std::time::Duration;

use annotator_events::{EventBus, EventEnvelope};
use annotator_pipeline::{EventProcessor, Outcome};
use tokio::sync::broadcast;

/// Pause before re-publishing a transiently failed event.
const REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// Background service that drains the event bus into the processor.
pub struct EventConsumer;

impl EventConsumer {
    /// Run the consume loop.
    ///
    /// Subscribes via the provided `receiver` and processes every event
    /// it receives. The loop exits when the channel is closed (i.e. the
    /// [`EventBus`] is dropped).
    pub async fn run(
        processor: Arc<EventProcessor>,
        bus: Arc<EventBus>,
        mut receiver: broadcast::Receiver<EventEnvelope>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(event) => Self::handle(&processor, &bus, event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event consumer lagged, events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bus closed, consumer shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(processor: &EventProcessor, bus: &EventBus, event: EventEnvelope) {
        match processor.process(&event).await {
            Ok(Outcome::Applied) => {}
            Ok(Outcome::AlreadyProcessed | Outcome::IgnoredTerminal) => {
                tracing::debug!(
                    event_type = event.event_type(),
                    correlation_id = %event.correlation_id,
                    "event acknowledged without effects"
                );
            }
            Err(e) if e.should_redeliver() => {
                tracing::warn!(
                    error = %e,
                    event_type = event.event_type(),
                    correlation_id = %event.correlation_id,
                    "transient failure, redelivering event"
                );
                tokio::time::sleep(REDELIVERY_DELAY).await;
                bus.publish(event);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event_type = event.event_type(),
                    correlation_id = %event.correlation_id,
                    "permanent failure, failing iteration"
                );
                if let Err(fail_err) = processor
                    .fail_iteration(&event.project_iteration_id, &e.to_string())
                    .await
                {
                    tracing::error!(error = %fail_err, "could not record iteration failure");
                }
            }
        }
    }
}
