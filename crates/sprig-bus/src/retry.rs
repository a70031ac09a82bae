use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sprig_store::FailedEvent;

/// What the failed-event loop should do with a dead-lettered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish now.
    Retry,
    /// Not yet; put it back in the store.
    Requeue,
    /// Give up permanently.
    Abandon,
}

/// Collaborator contract deciding the fate of dead-lettered events.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn decide(&self, failed: &FailedEvent) -> RetryDecision;
}

/// Default policy: exponential backoff from the first failure, capped at a
/// fixed number of attempts.
pub struct ExponentialBackoffRetry {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoffRetry {
    async fn decide(&self, failed: &FailedEvent) -> RetryDecision {
        if failed.attempts >= self.max_attempts {
            return RetryDecision::Abandon;
        }
        let waited = (Utc::now() - failed.first_failed_at)
            .to_std()
            .unwrap_or_default();
        let required = self.base * 2u32.saturating_pow(failed.attempts.saturating_sub(1));
        if waited >= required {
            RetryDecision::Retry
        } else {
            RetryDecision::Requeue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use sprig_domain::{DeviceId, Event, LifecycleState};

    fn failed(attempts: u32, age: Duration) -> FailedEvent {
        let mut f = FailedEvent::new(
            Event::lifecycle(DeviceId::new(), LifecycleState::Ready, None),
            "boom",
        );
        f.attempts = attempts;
        f.first_failed_at = Utc::now() - TimeDelta::from_std(age).unwrap();
        f
    }

    #[tokio::test]
    async fn abandons_past_max_attempts() {
        let policy = ExponentialBackoffRetry::default();
        assert_eq!(
            policy.decide(&failed(5, Duration::from_secs(3600))).await,
            RetryDecision::Abandon
        );
    }

    #[tokio::test]
    async fn requeues_inside_backoff_window() {
        let policy = ExponentialBackoffRetry {
            max_attempts: 5,
            base: Duration::from_secs(10),
        };
        assert_eq!(
            policy.decide(&failed(2, Duration::from_secs(1))).await,
            RetryDecision::Requeue
        );
    }

    #[tokio::test]
    async fn retries_after_backoff() {
        let policy = ExponentialBackoffRetry {
            max_attempts: 5,
            base: Duration::from_millis(10),
        };
        assert_eq!(
            policy.decide(&failed(1, Duration::from_secs(1))).await,
            RetryDecision::Retry
        );
    }
}
