//! Per-call deadline, cancellation and correlation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// External dependencies an engine call may block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    EventStore,
    Signer,
    IdentityProvider,
}

impl Dependency {
    pub fn as_str(self) -> &'static str {
        match self {
            Dependency::EventStore => "event_store",
            Dependency::Signer => "signer",
            Dependency::IdentityProvider => "identity_provider",
        }
    }
}

/// Per-dependency time limits applied to every blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyTimeouts {
    pub event_store: Duration,
    pub signer: Duration,
    pub identity_provider: Duration,
}

impl DependencyTimeouts {
    pub fn for_dependency(&self, dependency: Dependency) -> Duration {
        match dependency {
            Dependency::EventStore => self.event_store,
            Dependency::Signer => self.signer,
            Dependency::IdentityProvider => self.identity_provider,
        }
    }
}

impl Default for DependencyTimeouts {
    fn default() -> Self {
        Self {
            event_store: Duration::from_secs(2),
            signer: Duration::from_secs(2),
            identity_provider: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("timed out waiting for {}", .0.as_str())]
    Timeout(Dependency),
    #[error("call cancelled")]
    Cancelled,
}

/// Caller-supplied bounds for one engine operation.
///
/// Cloning shares the cancellation token, so cancelling the original cancels
/// every clone.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    correlation_id: Uuid,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// No deadline, fresh cancellation token and correlation id.
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancellation: CancellationToken::new(),
            correlation_id: Uuid::now_v7(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Run `fut` bounded by `min(deadline, now + limit)` and by cancellation.
    ///
    /// Cancellation wins ties so a cancelled caller never observes a late
    /// success.
    pub async fn guard<F, T>(&self, dependency: Dependency, limit: Duration, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let by_dependency = Instant::now() + limit;
        let deadline = match self.deadline {
            Some(d) if d < by_dependency => d,
            _ => by_dependency,
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(CallError::Cancelled),
            out = tokio::time::timeout_at(deadline, fut) => {
                out.map_err(|_| CallError::Timeout(dependency))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_limit() {
        let ctx = CallContext::new();
        let out = ctx
            .guard(Dependency::Signer, Duration::from_secs(1), async { 7 })
            .await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_limit_times_out() {
        let ctx = CallContext::new();
        let out = ctx
            .guard(Dependency::IdentityProvider, Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert_eq!(out, Err(CallError::Timeout(Dependency::IdentityProvider)));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_is_tighter_than_dependency_limit() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        let started = Instant::now();
        let out = ctx
            .guard(Dependency::EventStore, Duration::from_secs(60), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert!(out.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        token.cancel();
        let out = ctx
            .guard(Dependency::EventStore, Duration::from_secs(60), std::future::pending::<()>())
            .await;
        assert_eq!(out, Err(CallError::Cancelled));
    }
}
