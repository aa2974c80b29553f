//! Retry with exponential backoff for the reasoning agent.
//!
//! The delay schedule is a pure function of the attempt number; waiting goes
//! through an injected [`Clock`] so the schedule is testable without timers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use vigil_core::{AgentRequest, Finding, ReasoningAgent, ResilienceConfig, VigilError};

use crate::clock::{Clock, SystemClock};

/// Delay to wait after failed attempt `attempt` (1-based): `2^attempt` seconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_remote::backoff_delay;
///
/// assert_eq!(backoff_delay(1), Duration::from_secs(2));
/// assert_eq!(backoff_delay(2), Duration::from_secs(4));
/// assert_eq!(backoff_delay(3), Duration::from_secs(8));
/// ```
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// How many times to try a call before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying rate-limit and overload failures with backoff.
    ///
    /// Any other error, or the last error once attempts run out, is returned
    /// unchanged and without further delay. A server-provided `Retry-After`
    /// longer than the backoff delay is honored.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<F, Fut, T>(&self, clock: &dyn Clock, mut op: F) -> Result<T, VigilError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.max_attempts {
                        return Err(error);
                    }

                    let delay = delay_for(&error, attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying reasoning agent call"
                    );
                    clock.sleep(delay).await;
                }
            }
        }
    }
}

fn delay_for(error: &VigilError, attempt: u32) -> Duration {
    let backoff = backoff_delay(attempt);
    match error {
        VigilError::RateLimited {
            retry_after_secs: Some(secs),
        } => {
            let retry_after = Duration::from_secs(*secs);
            if retry_after > backoff {
                debug!(retry_after_secs = secs, "honoring Retry-After");
            }
            retry_after.max(backoff)
        }
        _ => backoff,
    }
}

/// A [`ReasoningAgent`] whose calls are retried under a [`RetryPolicy`].
///
/// # Examples
///
/// ```no_run
/// use vigil_core::AgentConfig;
/// use vigil_remote::{AgentClient, RetryPolicy, RetryingAgent};
///
/// let client = AgentClient::new(&AgentConfig::default()).unwrap();
/// let agent = RetryingAgent::new(client, RetryPolicy::default());
/// ```
pub struct RetryingAgent<A> {
    inner: A,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<A: ReasoningAgent> RetryingAgent<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self::with_clock(inner, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(inner: A, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            policy,
            clock,
        }
    }

    /// The wrapped agent.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: ReasoningAgent> ReasoningAgent for RetryingAgent<A> {
    async fn review(&self, request: &AgentRequest) -> Result<Vec<Finding>, VigilError> {
        self.policy
            .run(self.clock.as_ref(), move || self.inner.review(request))
            .await
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, VigilError> {
        self.policy
            .run(self.clock.as_ref(), move || {
                self.inner.complete(system, prompt, max_output_tokens)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn overloaded() -> VigilError {
        VigilError::Overloaded("529".into())
    }

    #[test]
    fn schedule_doubles() {
        let delays: Vec<u64> = (1..=4).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_and_four_seconds() {
        let clock = ManualClock::new();
        let calls = &AtomicU32::new(0);

        let result = RetryPolicy::default()
            .run(&clock, || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(VigilError::RateLimited {
                        retry_after_secs: None,
                    })
                } else {
                    Ok("findings")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "findings");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let clock = ManualClock::new();
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::default()
            .run(&clock, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VigilError::AgentRejected {
                    status: 401,
                    message: "invalid api key".into(),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(VigilError::AgentRejected { status: 401, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let clock = ManualClock::new();
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy { max_attempts: 3 }
            .run(&clock, || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(VigilError::Overloaded(format!("attempt {n}")))
            })
            .await;

        match result {
            Err(VigilError::Overloaded(msg)) => assert_eq!(msg, "attempt 3"),
            other => panic!("expected overload error, got {other:?}"),
        }
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn retry_after_longer_than_backoff_wins() {
        let clock = ManualClock::new();
        let calls = &AtomicU32::new(0);

        let _ = RetryPolicy::default()
            .run(&clock, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VigilError::RateLimited {
                        retry_after_secs: Some(30),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    struct FlakyAgent {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ReasoningAgent for FlakyAgent {
        async fn review(&self, _request: &AgentRequest) -> Result<Vec<Finding>, VigilError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(overloaded());
            }
            Ok(Vec::new())
        }

        async fn complete(&self, _: &str, _: &str, _: u32) -> Result<String, VigilError> {
            Err(VigilError::Agent("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn retrying_agent_wraps_both_calls() {
        let clock = Arc::new(ManualClock::new());
        let agent = RetryingAgent::with_clock(
            FlakyAgent {
                failures: AtomicU32::new(1),
            },
            RetryPolicy::default(),
            clock.clone(),
        );
        let request = AgentRequest {
            system_instructions: String::new(),
            files: Vec::new(),
            max_output_tokens: 100,
        };

        assert!(agent.review(&request).await.unwrap().is_empty());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);

        let err = agent.complete("sys", "prompt", 10).await.unwrap_err();
        assert!(matches!(err, VigilError::Agent(_)));
        assert_eq!(clock.sleeps().len(), 1);
    }
}
