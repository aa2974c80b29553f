//! Boundaries to the systems the engine talks to but does not own.

use async_trait::async_trait;

use crate::error::VigilError;
use crate::types::{AgentRequest, ChangedFile, Finding, SearchHealth, SearchHit};

/// The source-control host holding the pull requests under review.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Files changed by the subject, with their patches.
    async fn changed_files(&self, subject: &str) -> Result<Vec<ChangedFile>, VigilError>;

    /// Complete content of `path` at `git_ref`.
    async fn file_content(
        &self,
        subject: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String, VigilError>;

    /// The commit the subject currently points at.
    async fn head_ref(&self, subject: &str) -> Result<String, VigilError>;

    /// Publish a top-level comment on the subject.
    async fn post_review_comment(&self, subject: &str, body: &str) -> Result<(), VigilError>;
}

/// The external reasoning agent that produces findings.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Review a batch of files and return structured findings.
    async fn review(&self, request: &AgentRequest) -> Result<Vec<Finding>, VigilError>;

    /// Free-form completion, used for one-off analysis calls.
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, VigilError>;
}

/// The optional semantic code search service.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Report service status and index size.
    async fn health(&self) -> Result<SearchHealth, VigilError>;

    /// Find snippets related to `query` inside `repo_path`.
    async fn search(
        &self,
        query: &str,
        repo_path: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SearchHit>, VigilError>;

    /// Whether `repo_path` has been indexed.
    async fn check_indexed(&self, repo_path: &str) -> Result<bool, VigilError>;
}
