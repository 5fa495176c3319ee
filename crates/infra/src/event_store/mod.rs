//! Append-only event store boundary.

pub mod in_memory;
pub mod r#trait;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use gatekeep_core::{AggregateId, ExpectedVersion};
use gatekeep_events::{EventBus, EventEnvelope};

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Publish happens only after append succeeds. A failed publish is logged and
/// swallowed: the events are durable and projections can be rebuilt from the
/// store, so the command that produced them must not fail.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

#[async_trait]
impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(aggregate_id, expected_version, events).await?;

        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                warn!(
                    aggregate_id = %e.aggregate_id,
                    sequence_number = e.sequence_number,
                    error = ?err,
                    "event publication failed after commit"
                );
            }
        }

        Ok(committed)
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load(aggregate_id).await
    }
}
