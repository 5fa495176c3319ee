use chrono::{DateTime, Utc};

/// A domain event: an immutable fact appended to exactly one aggregate stream.
///
/// Each aggregate defines its events as a closed enum; `event_type` gives the
/// stable wire name of each variant so stored history stays readable.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "identity.user.registered").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time, from the injected clock).
    fn occurred_at(&self) -> DateTime<Utc>;
}
