use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A file touched by a pull request, as reported by the source-control host.
///
/// Immutable once fetched.
///
/// # Examples
///
/// ```
/// use vigil_core::{ChangedFile, FileStatus};
///
/// let file = ChangedFile::new("src/auth.ts", FileStatus::Modified, "@@ -1 +1 @@\n-a\n+b\n");
/// assert_eq!(file.stem(), "auth");
/// assert_eq!(file.extension(), Some("ts"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub path: String,
    /// How the file changed.
    pub status: FileStatus,
    /// Lines added.
    pub additions: u32,
    /// Lines removed.
    pub deletions: u32,
    /// Unified-diff patch text (empty for binary or oversized diffs).
    pub patch: String,
    /// Previous path for renamed files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

impl ChangedFile {
    /// Create a changed file, counting additions and deletions from the patch.
    pub fn new(path: impl Into<String>, status: FileStatus, patch: impl Into<String>) -> Self {
        let patch = patch.into();
        let (additions, deletions) = count_patch_lines(&patch);
        Self {
            path: path.into(),
            status,
            additions,
            deletions,
            patch,
            previous_path: None,
        }
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.path)
    }

    /// Extension without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.path).extension().and_then(|e| e.to_str())
    }
}

fn count_patch_lines(patch: &str) -> (u32, u32) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in patch.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

/// Change classification of a [`ChangedFile`].
///
/// # Examples
///
/// ```
/// use vigil_core::FileStatus;
///
/// let s: FileStatus = "renamed".parse().unwrap();
/// assert_eq!(s, FileStatus::Renamed);
/// assert_eq!(FileStatus::Removed.to_string(), "removed");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Added => write!(f, "added"),
            FileStatus::Modified => write!(f, "modified"),
            FileStatus::Removed => write!(f, "removed"),
            FileStatus::Renamed => write!(f, "renamed"),
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // GitHub also reports "copied" and "changed"; both carry a new version.
        match s.to_lowercase().as_str() {
            "added" => Ok(FileStatus::Added),
            "modified" | "changed" | "copied" => Ok(FileStatus::Modified),
            "removed" | "deleted" => Ok(FileStatus::Removed),
            "renamed" => Ok(FileStatus::Renamed),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

/// How much surrounding code is attached to a changed file.
///
/// Variants are ordered by cost, so `DiffOnly < FullFile < DependencyAware < SemanticSearch`.
///
/// # Examples
///
/// ```
/// use vigil_core::ContextStrategy;
///
/// assert_eq!(ContextStrategy::SemanticSearch.degrade(), ContextStrategy::DependencyAware);
/// assert_eq!(ContextStrategy::DiffOnly.degrade(), ContextStrategy::DiffOnly);
/// assert!(ContextStrategy::FullFile < ContextStrategy::DependencyAware);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Patch text only; no network fetch.
    DiffOnly,
    /// Patch plus the complete current file.
    #[default]
    FullFile,
    /// Full file plus dependents and related tests.
    DependencyAware,
    /// Full file plus snippets from the semantic search service.
    SemanticSearch,
}

impl ContextStrategy {
    /// The next cheaper strategy.
    pub fn degrade(self) -> Self {
        match self {
            ContextStrategy::SemanticSearch => ContextStrategy::DependencyAware,
            ContextStrategy::DependencyAware => ContextStrategy::FullFile,
            ContextStrategy::FullFile | ContextStrategy::DiffOnly => ContextStrategy::DiffOnly,
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextStrategy::DiffOnly => write!(f, "diff_only"),
            ContextStrategy::FullFile => write!(f, "full_file"),
            ContextStrategy::DependencyAware => write!(f, "dependency_aware"),
            ContextStrategy::SemanticSearch => write!(f, "semantic_search"),
        }
    }
}

impl FromStr for ContextStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "diff_only" | "diff" => Ok(ContextStrategy::DiffOnly),
            "full_file" | "full" => Ok(ContextStrategy::FullFile),
            "dependency_aware" | "dependencies" => Ok(ContextStrategy::DependencyAware),
            "semantic_search" | "semantic" => Ok(ContextStrategy::SemanticSearch),
            other => Err(format!("unknown context strategy: {other}")),
        }
    }
}

/// Why a related file was attached to a [`FileContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    /// Imports or references the changed file's exports.
    Dependent,
    /// Tests the changed file.
    Test,
    /// Returned by the semantic search service.
    Semantic,
}

/// A file attached as supporting context, truncated to an excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedFile {
    /// Path relative to the repository root.
    pub path: String,
    /// Why this file is relevant.
    pub relationship: Relationship,
    /// Truncated content.
    pub excerpt: String,
    /// Similarity score for semantic hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A changed file plus whatever context the selector attached to it.
///
/// Derived per request and never persisted.
///
/// # Examples
///
/// ```
/// use vigil_core::{ChangedFile, ContextStrategy, FileContext, FileStatus};
///
/// let ctx = FileContext::diff_only(ChangedFile::new("a.rs", FileStatus::Added, "+x"));
/// assert_eq!(ctx.strategy, ContextStrategy::DiffOnly);
/// assert!(ctx.full_content.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContext {
    /// The changed file.
    pub file: ChangedFile,
    /// Strategy that actually produced this context.
    pub strategy: ContextStrategy,
    /// Complete file content at the head ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    /// Supporting files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<RelatedFile>,
}

impl FileContext {
    /// Context consisting of the patch alone.
    pub fn diff_only(file: ChangedFile) -> Self {
        Self {
            file,
            strategy: ContextStrategy::DiffOnly,
            full_content: None,
            related_files: Vec::new(),
        }
    }

    /// Context with the full file content attached.
    pub fn full_file(file: ChangedFile, content: String) -> Self {
        Self {
            file,
            strategy: ContextStrategy::FullFile,
            full_content: Some(content),
            related_files: Vec::new(),
        }
    }
}

/// Import and export names found in one source file.
///
/// Both lists are sorted and de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Module paths and imported names.
    pub imports: Vec<String>,
    /// Top-level declared or exported names.
    pub exports: Vec<String>,
}

/// Severity of a review finding.
///
/// # Examples
///
/// ```
/// use vigil_core::Severity;
///
/// let s: Severity = serde_json::from_str("\"HIGH\"").unwrap();
/// assert_eq!(s, Severity::High);
/// assert!(Severity::High.meets_threshold(Severity::Medium));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" | "critical" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Severity {
    /// Returns `true` if `self` is at least as severe as `threshold`.
    pub fn meets_threshold(self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }

    /// Sort key, most severe first.
    pub fn rank(self) -> u8 {
        match self {
            Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }
}

/// A structured finding returned by the reasoning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Path of the file the finding is about.
    pub file: String,
    /// Line in the new version of the file.
    pub line: u32,
    /// How serious the issue is.
    pub severity: Severity,
    /// Free-form category (e.g. `security`, `correctness`).
    pub category: String,
    /// Explanation of the issue.
    pub message: String,
}

/// A review request sent to the reasoning agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Static instruction material (guidelines, pattern summary).
    pub system_instructions: String,
    /// Files under review with their context.
    pub files: Vec<FileContext>,
    /// Ceiling on the agent's response length.
    pub max_output_tokens: u32,
}

/// Health report from the semantic search service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHealth {
    /// `"ok"` or `"degraded"`.
    pub status: String,
    /// Number of repositories indexed.
    pub indexed_repo_count: u64,
    /// Total number of indexed chunks.
    pub chunk_count: u64,
}

impl SearchHealth {
    /// Whether the service reports itself fully operational.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// A snippet returned by the semantic search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Path of the file containing the snippet.
    pub path: String,
    /// The matching code.
    pub excerpt: String,
    /// Similarity score (0.0–1.0).
    pub score: f64,
}
