use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use vigil_context::{batch_by_budget, estimate_batch, ContextSelector, SubjectInfo};
use vigil_core::{
    AgentRequest, ChangedFile, Finding, ReasoningAgent, Severity, SourceControl, VigilError,
};
use vigil_depscan::walk_repo;

use crate::prompt::PromptCache;

/// Result of a completed review.
///
/// # Examples
///
/// ```
/// use vigil_review::pipeline::{ReviewOutcome, ReviewStats};
///
/// let outcome = ReviewOutcome {
///     findings: vec![],
///     stats: ReviewStats::default(),
/// };
/// assert!(outcome.to_markdown().contains("No issues found."));
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    /// Findings, most severe first.
    pub findings: Vec<Finding>,
    /// Statistics about the run.
    pub stats: ReviewStats,
}

/// Statistics about a review run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    /// Changed files sent for review.
    pub files_reviewed: usize,
    /// Agent requests made.
    pub batches: usize,
    /// Estimated prompt tokens across all batches.
    pub estimated_tokens: usize,
}

/// Drives one review from changed files to findings.
///
/// Fetches the change set, selects context, splits it into batches under the
/// token ceiling, attaches cached static instructions, and asks the agent
/// for findings batch by batch.
pub struct ReviewPipeline {
    source: Arc<dyn SourceControl>,
    selector: ContextSelector,
    prompts: Arc<PromptCache>,
    agent: Arc<dyn ReasoningAgent>,
    max_output_tokens: u32,
    checkout: Option<PathBuf>,
}

impl ReviewPipeline {
    pub fn new(
        source: Arc<dyn SourceControl>,
        selector: ContextSelector,
        prompts: Arc<PromptCache>,
        agent: Arc<dyn ReasoningAgent>,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            source,
            selector,
            prompts,
            agent,
            max_output_tokens,
            checkout: None,
        }
    }

    /// Use a local checkout for dependency lookups and semantic search.
    pub fn with_checkout(mut self, checkout: PathBuf) -> Self {
        self.checkout = Some(checkout);
        self
    }

    /// Describe `subject` for context selection: head commit plus, when a
    /// checkout is configured, its path and file universe.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::SourceControl`] if the head commit cannot be read.
    pub async fn subject_info(&self, subject: &str) -> Result<SubjectInfo, VigilError> {
        let head = self.source.head_ref(subject).await?;
        let mut info = SubjectInfo::new(subject, head);

        if let Some(checkout) = &self.checkout {
            let root = checkout.clone();
            match tokio::task::spawn_blocking(move || walk_repo(&root)).await {
                Ok(Ok(universe)) => {
                    debug!(files = universe.len(), "walked checkout");
                    info = info
                        .with_repo_path(checkout.display().to_string())
                        .with_universe(universe);
                }
                Ok(Err(e)) => warn!(error = %e, "could not walk checkout"),
                Err(e) => warn!(error = %e, "checkout walk panicked"),
            }
        }
        Ok(info)
    }

    /// Review the given files.
    ///
    /// # Errors
    ///
    /// Returns the agent's error if any batch fails after retries.
    pub async fn review(
        &self,
        files: &[ChangedFile],
        info: &SubjectInfo,
    ) -> Result<ReviewOutcome, VigilError> {
        let contexts = self.selector.fetch_context(files, info).await;
        let batches = batch_by_budget(contexts, self.selector.config().max_batch_tokens);

        let mut stats = ReviewStats {
            files_reviewed: files.len(),
            batches: batches.len(),
            estimated_tokens: 0,
        };
        let mut findings = Vec::new();

        for (i, batch) in batches.into_iter().enumerate() {
            let tokens = estimate_batch(&batch);
            stats.estimated_tokens += tokens;

            let batch_files: Vec<ChangedFile> = batch.iter().map(|c| c.file.clone()).collect();
            let instructions = self.prompts.get_static_instructions(&batch_files).await;
            let request = AgentRequest {
                system_instructions: instructions.render(),
                files: batch,
                max_output_tokens: self.max_output_tokens,
            };

            debug!(batch = i + 1, files = batch_files.len(), tokens, "sending review batch");
            findings.extend(self.agent.review(&request).await?);
        }

        sort_findings(&mut findings);
        Ok(ReviewOutcome { findings, stats })
    }

    /// Review `subject` end to end and post the summary comment.
    ///
    /// # Errors
    ///
    /// Returns source-control errors from fetching or posting, and agent
    /// errors from reviewing.
    pub async fn run(&self, subject: &str) -> Result<ReviewOutcome, VigilError> {
        let info = self.subject_info(subject).await?;
        let files = self.source.changed_files(subject).await?;
        let outcome = self.review(&files, &info).await?;

        self.source
            .post_review_comment(subject, &outcome.to_markdown())
            .await?;
        info!(
            subject,
            files = outcome.stats.files_reviewed,
            findings = outcome.findings.len(),
            "review posted"
        );
        Ok(outcome)
    }
}

fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line.cmp(&b.line))
    });
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "\u{1f534}",
        Severity::Medium => "\u{1f7e0}",
        Severity::Low => "\u{1f535}",
    }
}

impl fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Review Results")?;
        writeln!(f, "==============")?;
        writeln!(
            f,
            "Files: {} | Batches: {} | Est. tokens: {} | Findings: {}\n",
            self.stats.files_reviewed,
            self.stats.batches,
            self.stats.estimated_tokens,
            self.findings.len(),
        )?;

        if self.findings.is_empty() {
            writeln!(f, "No issues found.")?;
        } else {
            for finding in &self.findings {
                writeln!(
                    f,
                    "[{}] {}:{} ({})",
                    finding.severity, finding.file, finding.line, finding.category
                )?;
                writeln!(f, "  {}", finding.message)?;
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl ReviewOutcome {
    /// Render the outcome as the markdown body of a pull request comment.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Review Results\n\n");
        out.push_str(&format!(
            "**Files:** {} | **Findings:** {}\n\n",
            self.stats.files_reviewed,
            self.findings.len(),
        ));

        if self.findings.is_empty() {
            out.push_str("No issues found.\n");
        } else {
            for finding in &self.findings {
                out.push_str(&format!(
                    "## {} {} `{}:{}` ({})\n\n",
                    severity_emoji(finding.severity),
                    finding.severity,
                    finding.file,
                    finding.line,
                    finding.category,
                ));
                out.push_str(&format!("{}\n\n", finding.message));
            }
        }
        out
    }
}
