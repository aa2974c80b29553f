//! Context selection for review requests.
//!
//! Decides how much surrounding code accompanies each changed file, from the
//! bare patch up to dependents, related tests, or semantic search snippets,
//! and estimates the token cost so callers can batch agent requests.

pub mod budget;
pub mod selector;

pub use budget::{batch_by_budget, estimate_batch, estimate_tokens};
pub use selector::{excerpt, search_queries, ContextSelector, SubjectInfo};
