use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vigil_core::{ResilienceConfig, VigilError};

use crate::clock::{Clock, SystemClock};

/// Snapshot of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Consecutive failures since the last success or reset.
    pub failure_count: u32,
    /// Whether calls are currently refused.
    pub is_open: bool,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    /// How long the circuit stays open.
    pub reset_timeout: Duration,
}

/// Fail-fast guard for one remote dependency.
///
/// After `threshold` consecutive failures the circuit opens and every call
/// fails with [`VigilError::CircuitOpen`] without running the operation.
/// Once the cool-down has elapsed the circuit closes again with a zero count.
/// Any success zeroes the count. Breakers share no state with each other.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_remote::CircuitBreaker;
///
/// let breaker = CircuitBreaker::new("semantic-search", 3, Duration::from_secs(60));
/// assert!(!breaker.is_open());
/// assert_eq!(breaker.state().failure_count, 0);
/// ```
pub struct CircuitBreaker {
    service: String,
    threshold: u32,
    state: Mutex<CircuitBreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self::with_clock(service, threshold, cooldown, Arc::new(SystemClock))
    }

    /// Breaker tuned by the `[resilience]` configuration section.
    pub fn from_config(service: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self::new(service, config.breaker_threshold, config.breaker_cooldown)
    }

    pub fn with_clock(
        service: impl Into<String>,
        threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service: service.into(),
            threshold: threshold.max(1),
            state: Mutex::new(CircuitBreakerState {
                failure_count: 0,
                is_open: false,
                opened_at: None,
                reset_timeout: cooldown,
            }),
            clock,
        }
    }

    /// Name of the guarded dependency.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state, after applying any elapsed cool-down.
    pub fn state(&self) -> CircuitBreakerState {
        let mut state = self.lock();
        self.close_if_cooled(&mut state);
        *state
    }

    /// Whether a call made now would be refused.
    pub fn is_open(&self) -> bool {
        self.state().is_open
    }

    /// Force the circuit closed with a zero count.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.failure_count = 0;
        state.is_open = false;
        state.opened_at = None;
    }

    /// Run `op` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::CircuitOpen`] without running `op` while the
    /// circuit is open; otherwise returns whatever `op` returns.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, VigilError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        {
            let mut state = self.lock();
            self.close_if_cooled(&mut state);
            if state.is_open {
                return Err(VigilError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
        }

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) => self.record_failure(error),
        }
        result
    }

    fn record_success(&self) {
        self.lock().failure_count = 0;
    }

    fn record_failure(&self, error: &VigilError) {
        let mut state = self.lock();
        state.failure_count += 1;
        if state.failure_count >= self.threshold && !state.is_open {
            state.is_open = true;
            state.opened_at = Some(self.clock.now());
            warn!(
                service = %self.service,
                failures = state.failure_count,
                cooldown_secs = state.reset_timeout.as_secs(),
                error = %error,
                "circuit opened"
            );
        }
    }

    fn close_if_cooled(&self, state: &mut CircuitBreakerState) {
        if !state.is_open {
            return;
        }
        let cooled = state
            .opened_at
            .map_or(true, |opened| {
                self.clock.now().duration_since(opened) >= state.reset_timeout
            });
        if cooled {
            state.is_open = false;
            state.opened_at = None;
            state.failure_count = 0;
            info!(service = %self.service, "circuit closed after cool-down");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
