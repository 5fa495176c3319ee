//! Projection runner: per-stream cursors and deterministic replay.

use std::collections::HashMap;

use gatekeep_core::AggregateId;

use crate::{EventEnvelope, Projection};

/// Last applied version of one aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    aggregate_id: AggregateId,
    last_version: u64,
}

impl ProjectionCursor {
    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// Already applied; safe to ignore under at-least-once delivery.
    #[error("duplicate envelope for {aggregate_id} (last {last}, found {found})")]
    Duplicate {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
    /// An earlier envelope of the stream was never seen.
    #[error("gap in stream {aggregate_id} (last {last}, found {found})")]
    Gap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

/// Runs envelopes through a projection, tracking a cursor per stream.
#[derive(Debug)]
pub struct ProjectionRunner<P> {
    projection: P,
    cursors: HashMap<AggregateId, u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursors: HashMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    pub fn cursor(&self, aggregate_id: AggregateId) -> Option<ProjectionCursor> {
        self.cursors.get(&aggregate_id).map(|&last_version| ProjectionCursor {
            aggregate_id,
            last_version,
        })
    }

    /// Apply one envelope; versions within a stream must arrive gapless.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Payload>) -> Result<(), ProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let found = envelope.version();
        let last = self.cursors.get(&aggregate_id).copied().unwrap_or(0);

        if found <= last {
            return Err(ProjectionError::Duplicate {
                aggregate_id,
                last,
                found,
            });
        }
        if found != last + 1 {
            return Err(ProjectionError::Gap {
                aggregate_id,
                last,
                found,
            });
        }

        self.projection.apply(envelope);
        self.cursors.insert(aggregate_id, found);
        Ok(())
    }

    /// Apply many envelopes in order, skipping duplicates.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Payload>>,
    ) -> Result<(), ProjectionError>
    where
        P::Payload: 'a,
    {
        for env in envelopes {
            match self.apply(env) {
                Ok(()) | Err(ProjectionError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying full history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Payload>>,
    ) -> Result<P, ProjectionError>
    where
        P::Payload: 'a,
    {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok(runner.projection)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct Counter(u64);

    impl Projection for Counter {
        type Payload = ();

        fn apply(&mut self, _envelope: &EventEnvelope<()>) {
            self.0 += 1;
        }
    }

    fn env(id: AggregateId, version: u64) -> EventEnvelope<()> {
        EventEnvelope::new(Uuid::now_v7(), id, "test", version, "test.event", Utc::now(), ())
    }

    #[test]
    fn duplicates_are_skipped_and_gaps_rejected() {
        let id = AggregateId::new();
        let mut runner = ProjectionRunner::new(Counter::default());

        runner.apply(&env(id, 1)).unwrap();
        assert!(matches!(runner.apply(&env(id, 1)), Err(ProjectionError::Duplicate { .. })));
        assert!(matches!(runner.apply(&env(id, 3)), Err(ProjectionError::Gap { .. })));
        runner.apply(&env(id, 2)).unwrap();

        assert_eq!(runner.projection().0, 2);
        assert_eq!(runner.cursor(id).unwrap().last_version(), 2);
    }

    #[test]
    fn streams_are_tracked_independently() {
        let a = AggregateId::new();
        let b = AggregateId::new();
        let history = vec![env(a, 1), env(b, 1), env(a, 2), env(a, 2)];

        let rebuilt = ProjectionRunner::rebuild_from_scratch(Counter::default, &history).unwrap();
        assert_eq!(rebuilt.0, 3);
    }
}
