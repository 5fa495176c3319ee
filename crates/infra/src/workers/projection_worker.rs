use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use gatekeep_events::{EventBus, EventEnvelope, Projection, ProjectionError, ProjectionRunner, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic bus consumer loop.
///
/// - Subscribes to an event bus before the thread starts, so nothing
///   published after `spawn` returns is missed
/// - Applies a handler to each message; handler errors are logged, never
///   propagated back to the committing command
/// - Stops on shutdown or when the bus is dropped
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<M, B, H, E>(name: &'static str, bus: &B, mut handler: H) -> io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M> + ?Sized,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &mut handler))?;

        info!(worker = name, "worker started");
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Run a projection on its own thread behind a [`ProjectionRunner`], so
/// redelivered envelopes are dropped and stream gaps are reported.
pub fn spawn_projection<P, B>(name: &'static str, bus: &B, projection: P) -> io::Result<WorkerHandle>
where
    P: Projection<Payload = JsonValue> + Send + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + ?Sized,
{
    let mut runner = ProjectionRunner::new(projection);
    ProjectionWorker::spawn(name, bus, move |envelope: EventEnvelope<JsonValue>| {
        match runner.apply(&envelope) {
            Err(ProjectionError::Duplicate { .. }) => {
                debug!(worker = name, aggregate_id = %envelope.aggregate_id(), "duplicate envelope skipped");
                Ok(())
            }
            other => other,
        }
    })
}

fn worker_loop<M, H, E>(name: &'static str, sub: Subscription<M>, shutdown_rx: mpsc::Receiver<()>, handler: &mut H)
where
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "worker handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use chrono::Utc;
    use gatekeep_core::AggregateId;
    use gatekeep_events::InMemoryEventBus;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct Counter(Arc<std::sync::atomic::AtomicUsize>);

    impl Projection for Counter {
        type Payload = JsonValue;

        fn apply(&mut self, _envelope: &EventEnvelope<JsonValue>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn env(id: AggregateId, version: u64) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(Uuid::now_v7(), id, "test", version, "test.happened", Utc::now(), JsonValue::Null)
    }

    #[test]
    fn projection_worker_applies_each_envelope_once() {
        let bus: InMemoryEventBus<EventEnvelope<JsonValue>> = InMemoryEventBus::new();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = spawn_projection("test-projection", &bus, Counter(seen.clone())).unwrap();

        let id = AggregateId::new();
        for e in [env(id, 1), env(id, 2), env(id, 2), env(id, 3)] {
            bus.publish(e).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(std::sync::atomic::Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
