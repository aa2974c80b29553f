//! Resilient calls to the remote services the engine depends on.
//!
//! The reasoning agent is called through [`RetryingAgent`], which retries
//! rate-limit and overload failures on a `2^attempt` second schedule. The
//! semantic search service is called through [`GuardedSearch`], which trips a
//! [`CircuitBreaker`] after repeated failures. Both wait on an injected
//! [`Clock`].

pub mod agent;
pub mod breaker;
pub mod clock;
pub mod retry;
pub mod search;

pub use agent::AgentClient;
pub use breaker::{CircuitBreaker, CircuitBreakerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{backoff_delay, RetryPolicy, RetryingAgent};
pub use search::{GuardedSearch, IndexReport, SearchClient};
