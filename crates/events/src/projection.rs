use crate::EventEnvelope;

/// A projection builds a disposable read model from committed envelopes.
///
/// Read models may lag the event store and can be thrown away and rebuilt by
/// replaying history. `apply` must be idempotent because the bus delivers at
/// least once; [`crate::ProjectionRunner`] filters duplicates by stream
/// version before they reach the projection.
pub trait Projection {
    type Payload;

    fn apply(&mut self, envelope: &EventEnvelope<Self::Payload>);
}
