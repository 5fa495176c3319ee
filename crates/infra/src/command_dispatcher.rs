//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the stream (bounded by the event-store timeout)
//!   ↓
//! 2. Validate it is gapless, then rehydrate (unknown events are fatal)
//!   ↓
//! 3. Handle the command (pure decision, inline or on the blocking pool)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓  on Concurrency: back to 1, up to `max_conflict_retries` times
//! 5. Return the new state and the committed events
//! ```
//!
//! Publication to the bus is the store's concern (`PublishingEventStore`).

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use gatekeep_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion};

use crate::context::{CallContext, CallError, Dependency, DependencyTimeouts};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Conflicts persisted through every retry.
    #[error("optimistic concurrency conflict persisted after {attempts} attempts")]
    Concurrency { attempts: u32 },

    /// The aggregate rejected the command.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Stored history could not be folded: unknown event type, undecodable
    /// payload, wrong aggregate type, or a gap.
    #[error("rehydration failed: {0}")]
    Rehydration(String),

    #[error(transparent)]
    Store(EventStoreError),

    #[error("timed out waiting for {}", .0.as_str())]
    Timeout(Dependency),

    #[error("cancelled")]
    Cancelled,

    /// A handler moved off the async executor panicked or was aborted.
    #[error("command handler failed: {0}")]
    Handler(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        DispatchError::Store(value)
    }
}

impl From<CallError> for DispatchError {
    fn from(value: CallError) -> Self {
        match value {
            CallError::Timeout(dep) => DispatchError::Timeout(dep),
            CallError::Cancelled => DispatchError::Cancelled,
        }
    }
}

/// Outcome of a dispatched command.
#[derive(Debug)]
pub struct Dispatched<A: Aggregate> {
    /// State after the new events were applied.
    pub state: A,
    /// Decided events, in commit order. Empty for an accepted no-op.
    pub events: Vec<A::Event>,
    pub committed: Vec<StoredEvent>,
}

impl<A: Aggregate> Dispatched<A> {
    pub fn version(&self) -> u64 {
        self.committed
            .last()
            .map(StoredEvent::stream_version)
            .unwrap_or_else(|| self.state.version())
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Commands on the same aggregate are serialized only by the store's
/// optimistic concurrency check; commands on different aggregates never
/// contend.
#[derive(Debug, Clone)]
pub struct CommandDispatcher<S> {
    store: S,
    max_conflict_retries: u32,
    timeouts: DependencyTimeouts,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_conflict_retries: 3,
            timeouts: DependencyTimeouts::default(),
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_timeouts(mut self, timeouts: DependencyTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Load and rehydrate an aggregate. A missing stream yields `A::empty(id)`.
    ///
    /// This is a strong read: it goes to the store, never to a projection.
    pub async fn load<A>(&self, ctx: &CallContext, id: A::Id) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Id: Into<AggregateId> + Clone,
        A::Event: DeserializeOwned,
    {
        let aggregate_id: AggregateId = id.clone().into();
        let history = self.load_stream(ctx, aggregate_id).await?;
        rehydrate::<A>(id, &history)
    }

    /// Dispatch a command, retrying on version conflicts.
    pub async fn dispatch<A>(
        &self,
        ctx: &CallContext,
        id: A::Id,
        command: A::Command,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Id: Into<AggregateId> + Clone,
        A::Event: gatekeep_events::Event + Serialize + DeserializeOwned,
    {
        self.run::<A, _, _>(ctx, id, |aggregate| {
            let decided = aggregate.handle(&command).map_err(DispatchError::from);
            std::future::ready(decided.map(|events| (aggregate, events)))
        })
        .await
    }

    /// [`dispatch`](Self::dispatch) with the decision moved onto tokio's
    /// blocking pool. For handlers that burn CPU, such as password checks.
    pub async fn dispatch_blocking<A>(
        &self,
        ctx: &CallContext,
        id: A::Id,
        command: A::Command,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Send + 'static,
        A::Id: Into<AggregateId> + Clone,
        A::Command: Send + 'static,
        A::Event: gatekeep_events::Event + Serialize + DeserializeOwned,
    {
        self.run::<A, _, _>(ctx, id, |aggregate| {
            let command = command.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let decided = aggregate.handle(&command);
                    decided.map(|events| (aggregate, events))
                })
                .await
                .map_err(|e| DispatchError::Handler(e.to_string()))?
                .map_err(DispatchError::from)
            }
        })
        .await
    }

    async fn run<A, D, F>(&self, ctx: &CallContext, id: A::Id, decide: D) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Id: Into<AggregateId> + Clone,
        A::Event: gatekeep_events::Event + Serialize + DeserializeOwned,
        D: Fn(A) -> F,
        F: Future<Output = Result<(A, Vec<A::Event>), DispatchError>>,
    {
        let aggregate_id: AggregateId = id.clone().into();
        let attempts = self.max_conflict_retries + 1;

        for attempt in 1..=attempts {
            // 1) Load + 2) rehydrate
            let history = self.load_stream(ctx, aggregate_id).await?;
            let aggregate = rehydrate::<A>(id.clone(), &history)?;
            let expected = ExpectedVersion::Exact(stream_version(&history));

            // 3) Decide
            let (mut aggregate, decided) = decide(aggregate).await?;
            if decided.is_empty() {
                return Ok(Dispatched {
                    state: aggregate,
                    events: vec![],
                    committed: vec![],
                });
            }

            // 4) Persist
            let uncommitted = decided
                .iter()
                .map(|ev| UncommittedEvent::from_typed(aggregate_id, A::AGGREGATE_TYPE, Uuid::now_v7(), ev))
                .collect::<Result<Vec<_>, _>>()?;

            let append = self.store.append(aggregate_id, expected, uncommitted);
            match ctx
                .guard(Dependency::EventStore, self.timeouts.event_store, append)
                .await?
            {
                Ok(committed) => {
                    for ev in &decided {
                        aggregate.apply(ev);
                    }
                    return Ok(Dispatched {
                        state: aggregate,
                        events: decided,
                        committed,
                    });
                }
                Err(EventStoreError::Concurrency(msg)) => {
                    debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        %aggregate_id,
                        attempt,
                        %msg,
                        "version conflict, re-reading"
                    );
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(DispatchError::Concurrency { attempts })
    }

    async fn load_stream(
        &self,
        ctx: &CallContext,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let load = self.store.load(aggregate_id);
        let history = ctx
            .guard(Dependency::EventStore, self.timeouts.event_store, load)
            .await??;
        validate_loaded_stream(aggregate_id, &history)?;
        Ok(history)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Rehydration(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(DispatchError::Rehydration(format!(
                "stream is not gapless (expected sequence {expected}, found {})",
                e.sequence_number
            )));
        }
    }
    Ok(())
}

/// Fold a validated history into aggregate state.
pub fn rehydrate<A>(id: A::Id, history: &[StoredEvent]) -> Result<A, DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let mut aggregate = A::empty(id);
    for stored in history {
        if stored.aggregate_type != A::AGGREGATE_TYPE {
            return Err(DispatchError::Rehydration(format!(
                "stream holds '{}' events, expected '{}'",
                stored.aggregate_type,
                A::AGGREGATE_TYPE
            )));
        }
        let ev: A::Event = serde_json::from_value(stored.payload.clone()).map_err(|e| {
            DispatchError::Rehydration(format!(
                "cannot decode '{}' at sequence {}: {e}",
                stored.event_type, stored.sequence_number
            ))
        })?;
        aggregate.apply(&ev);
    }
    Ok(aggregate)
}
