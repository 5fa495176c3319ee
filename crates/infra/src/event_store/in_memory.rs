use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use gatekeep_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// In-memory append-only event store.
///
/// Validation and commit happen under one write lock with no `.await` in
/// between, so concurrent appends to the same stream are linearized and a
/// dropped future never leaves a partial batch behind.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Total number of stored events across all streams.
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn append_now(
        &self,
        aggregate_id: AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_type = events[0].aggregate_type.clone();
        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch targets another aggregate (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let current = streams
            .get(&aggregate_id)
            .map(|s| Self::current_version(s))
            .unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = streams.get(&aggregate_id).and_then(|s| s.first()) {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();

        streams
            .entry(aggregate_id)
            .or_default()
            .extend(committed.iter().cloned());

        Ok(committed)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_now(aggregate_id, expected_version, events)
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    fn event(aggregate_id: AggregateId, n: u64) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "test.counter".to_string(),
            event_type: "test.counter.bumped".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": n }),
        }
    }

    fn batch(aggregate_id: AggregateId, n: usize) -> Vec<UncommittedEvent> {
        (0..n as u64).map(|i| event(aggregate_id, i)).collect()
    }

    #[tokio::test]
    async fn append_assigns_gapless_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let first = store.append(id, ExpectedVersion::NoStream, batch(id, 2)).await.unwrap();
        let second = store.append(id, ExpectedVersion::Exact(2), batch(id, 3)).await.unwrap();

        assert_eq!(first.last().unwrap().stream_version(), 2);
        assert_eq!(second.last().unwrap().stream_version(), 5);
        let seqs: Vec<u64> = store.load(id).await.unwrap().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn mixed_batch_is_rejected_atomically() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let mut events = batch(id, 2);
        events.push(event(AggregateId::new(), 9));

        let err = store.append(id, ExpectedVersion::Any, events).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
        assert!(store.load(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store.append(id, ExpectedVersion::NoStream, batch(id, 1)).await.unwrap();

        let mut other = event(id, 1);
        other.aggregate_type = "test.other".to_string();
        let err = store.append(id, ExpectedVersion::Exact(1), vec![other]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[tokio::test]
    async fn concurrent_appends_with_same_expectation_have_one_winner() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.append(id, ExpectedVersion::NoStream, batch(id, 1)).await
                })
            })
            .collect();

        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.load(id).await.unwrap().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn stale_expectation_never_mutates(
            initial in 1usize..6,
            appended in 1usize..6,
            stale in 0u64..12,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let id = AggregateId::new();
                store.append(id, ExpectedVersion::NoStream, batch(id, initial)).await.unwrap();
                let current = initial as u64;

                if stale != current {
                    let err = store.append(id, ExpectedVersion::Exact(stale), batch(id, appended)).await;
                    prop_assert!(matches!(err, Err(EventStoreError::Concurrency(_))));
                    prop_assert_eq!(store.load(id).await.unwrap().len(), initial);
                } else {
                    let committed = store.append(id, ExpectedVersion::Exact(stale), batch(id, appended)).await.unwrap();
                    prop_assert_eq!(committed.last().unwrap().stream_version(), current + appended as u64);
                }
                Ok(())
            })?;
        }
    }
}
