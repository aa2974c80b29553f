//! Strategy selection and per-file context assembly.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use vigil_core::{
    ChangedFile, ContextConfig, ContextStrategy, FileContext, FileStatus, RelatedFile,
    Relationship, SearchConfig, SemanticSearch, SourceControl, VigilError,
};
use vigil_depscan::{extract, DependencyIndex, SourceFile};

/// Added lines quoted in the change query.
const CHANGE_QUERY_LINES: usize = 5;
const CHANGE_QUERY_CHARS: usize = 200;

/// Where the files under review live.
#[derive(Debug, Clone, Default)]
pub struct SubjectInfo {
    /// Subject reference understood by the source-control host.
    pub subject: String,
    /// Commit to read full file contents at.
    pub head_ref: String,
    /// Repository path known to the search service.
    pub repo_path: Option<String>,
    /// Every known file in the repository, for dependency lookups.
    pub universe: Option<Vec<SourceFile>>,
}

impl SubjectInfo {
    pub fn new(subject: impl Into<String>, head_ref: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            head_ref: head_ref.into(),
            repo_path: None,
            universe: None,
        }
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<String>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    pub fn with_universe(mut self, universe: Vec<SourceFile>) -> Self {
        self.universe = Some(universe);
        self
    }
}

/// Builds [`FileContext`]s for a change set under the configured strategy.
///
/// The strategy is fixed per run. When its prerequisites are missing the
/// selector steps down one tier at a time, never below the configured
/// fallback, and individual files degrade further when their own fetches
/// fail. Nothing here returns an error to the caller.
pub struct ContextSelector {
    source: Arc<dyn SourceControl>,
    search: Option<Arc<dyn SemanticSearch>>,
    config: ContextConfig,
    search_config: SearchConfig,
    skip_patterns: Vec<glob::Pattern>,
}

impl ContextSelector {
    pub fn new(source: Arc<dyn SourceControl>, config: ContextConfig) -> Self {
        let mut skip_patterns = Vec::new();
        for pat in &config.skip_patterns {
            match glob::Pattern::new(pat) {
                Ok(p) => skip_patterns.push(p),
                Err(e) => warn!(pattern = %pat, error = %e, "ignoring invalid skip pattern"),
            }
        }

        Self {
            source,
            search: None,
            config,
            search_config: SearchConfig::default(),
            skip_patterns,
        }
    }

    /// Attach the semantic search service.
    pub fn with_search(mut self, search: Arc<dyn SemanticSearch>, config: SearchConfig) -> Self {
        self.search = Some(search);
        self.search_config = config;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The strategy a run for `info` would use, after checking prerequisites.
    pub async fn select_strategy(&self, info: &SubjectInfo) -> ContextStrategy {
        let universe = self.usable_universe(info);
        self.resolve(info, !universe.is_empty()).await
    }

    /// Build context for every file in `files`, in order.
    ///
    /// Per-file fetches run concurrently. A file whose content cannot be
    /// fetched falls back to its patch; a file whose search fails keeps its
    /// full content without snippets.
    pub async fn fetch_context(&self, files: &[ChangedFile], info: &SubjectInfo) -> Vec<FileContext> {
        self.select_context(files, info).await.1
    }

    /// Like [`fetch_context`](Self::fetch_context), also returning the
    /// run-level strategy that was resolved. Prerequisites are checked once.
    pub async fn select_context(
        &self,
        files: &[ChangedFile],
        info: &SubjectInfo,
    ) -> (ContextStrategy, Vec<FileContext>) {
        let universe = self.usable_universe(info);
        let strategy = self.resolve(info, !universe.is_empty()).await;
        info!(
            subject = %info.subject,
            strategy = %strategy,
            files = files.len(),
            "selected context strategy"
        );

        let index = if strategy == ContextStrategy::DependencyAware {
            DependencyIndex::build(&universe)
        } else {
            DependencyIndex::build(&[])
        };

        let index = &index;
        let contexts = join_all(
            files
                .iter()
                .map(|file| self.file_context(file, strategy, info, index)),
        )
        .await;
        (strategy, contexts)
    }

    async fn resolve(&self, info: &SubjectInfo, has_universe: bool) -> ContextStrategy {
        let floor = self.config.effective_fallback();
        let mut strategy = self.config.strategy;

        while strategy > floor {
            match self.check_prerequisites(strategy, info, has_universe).await {
                Ok(()) => return strategy,
                Err(reason) => {
                    let next = strategy.degrade();
                    warn!(
                        subject = %info.subject,
                        from = %strategy,
                        to = %next,
                        reason = %reason,
                        "context strategy degraded"
                    );
                    strategy = next;
                }
            }
        }
        strategy
    }

    async fn check_prerequisites(
        &self,
        strategy: ContextStrategy,
        info: &SubjectInfo,
        has_universe: bool,
    ) -> Result<(), String> {
        match strategy {
            ContextStrategy::SemanticSearch => {
                let Some(search) = &self.search else {
                    return Err("no search service configured".into());
                };
                if !self.search_config.enabled {
                    return Err("search disabled by configuration".into());
                }
                let Some(repo_path) = &info.repo_path else {
                    return Err("subject has no repository path".into());
                };
                let health = search.health().await.map_err(|e| e.to_string())?;
                if !health.is_ok() {
                    return Err(format!("search service reports {}", health.status));
                }
                match search.check_indexed(repo_path).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("{repo_path} is not indexed")),
                    Err(e) => Err(e.to_string()),
                }
            }
            ContextStrategy::DependencyAware if !has_universe => {
                Err("no file universe supplied".into())
            }
            _ => Ok(()),
        }
    }

    fn usable_universe(&self, info: &SubjectInfo) -> Vec<SourceFile> {
        info.universe
            .iter()
            .flatten()
            .filter(|file| {
                let path = file.path_str();
                !self.skip_patterns.iter().any(|p| p.matches(&path))
            })
            .cloned()
            .collect()
    }

    async fn file_context(
        &self,
        file: &ChangedFile,
        strategy: ContextStrategy,
        info: &SubjectInfo,
        index: &DependencyIndex<'_>,
    ) -> FileContext {
        if strategy == ContextStrategy::DiffOnly || file.status == FileStatus::Removed {
            return FileContext::diff_only(file.clone());
        }

        let content = match self
            .source
            .file_content(&info.subject, &file.path, &info.head_ref)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %file.path, error = %e, "content fetch failed, using diff only");
                return FileContext::diff_only(file.clone());
            }
        };

        let mut ctx = FileContext::full_file(file.clone(), content);
        match strategy {
            ContextStrategy::DependencyAware => {
                ctx.related_files = self.dependency_context(&ctx, index);
                ctx.strategy = ContextStrategy::DependencyAware;
            }
            ContextStrategy::SemanticSearch => match self.semantic_context(&ctx, info).await {
                Ok(related) => {
                    ctx.related_files = related;
                    ctx.strategy = ContextStrategy::SemanticSearch;
                }
                Err(e) => {
                    warn!(path = %file.path, error = %e, "semantic search failed, using full file");
                }
            },
            _ => {}
        }
        ctx
    }

    fn dependency_context(&self, ctx: &FileContext, index: &DependencyIndex<'_>) -> Vec<RelatedFile> {
        let target = SourceFile::new(&ctx.file.path, ctx.full_content.as_deref().unwrap_or_default());

        let tests: Vec<&SourceFile> = index
            .tests_of(&target)
            .into_iter()
            .take(self.config.max_tests)
            .collect();
        let test_paths: HashSet<&std::path::Path> = tests.iter().map(|t| t.path.as_path()).collect();

        let dependents = index
            .dependents_of(&target)
            .into_iter()
            .filter(|d| !test_paths.contains(d.path.as_path()))
            .take(self.config.max_dependents);

        let mut related: Vec<RelatedFile> = dependents
            .map(|d| self.related(d, Relationship::Dependent))
            .collect();
        related.extend(tests.into_iter().map(|t| self.related(t, Relationship::Test)));

        debug!(path = %ctx.file.path, related = related.len(), "attached dependency context");
        related
    }

    fn related(&self, file: &SourceFile, relationship: Relationship) -> RelatedFile {
        RelatedFile {
            path: file.path_str(),
            relationship,
            excerpt: excerpt(&file.content, self.config.excerpt_lines, self.config.excerpt_chars),
            score: None,
        }
    }

    async fn semantic_context(
        &self,
        ctx: &FileContext,
        info: &SubjectInfo,
    ) -> Result<Vec<RelatedFile>, VigilError> {
        let (Some(search), Some(repo_path)) = (&self.search, &info.repo_path) else {
            return Err(VigilError::Search("search service unavailable".into()));
        };

        let mut seen = HashSet::new();
        let mut related = Vec::new();
        for query in search_queries(ctx, self.search_config.queries_per_file) {
            let hits = match search
                .search(
                    &query,
                    repo_path,
                    self.search_config.limit,
                    self.search_config.threshold,
                )
                .await
            {
                Ok(hits) => hits,
                Err(e) if e.is_unavailable() && !related.is_empty() => {
                    debug!(path = %ctx.file.path, error = %e, "search went away, keeping earlier hits");
                    break;
                }
                Err(e) => return Err(e),
            };
            for hit in hits {
                if is_same_file(&hit.path, &ctx.file.path) || !seen.insert(hit.path.clone()) {
                    continue;
                }
                related.push(RelatedFile {
                    excerpt: excerpt(&hit.excerpt, self.config.excerpt_lines, self.config.excerpt_chars),
                    path: hit.path,
                    relationship: Relationship::Semantic,
                    score: Some(hit.score),
                });
            }
        }
        Ok(related)
    }
}

fn is_same_file(hit: &str, path: &str) -> bool {
    hit == path || hit.ends_with(&format!("/{path}"))
}

/// Natural-language queries describing a changed file.
///
/// The first names the file and its exported symbols; the second quotes the
/// added lines of the patch.
pub fn search_queries(ctx: &FileContext, limit: usize) -> Vec<String> {
    let mut queries = Vec::new();

    let exports = ctx
        .full_content
        .as_deref()
        .map(|content| extract(content, &ctx.file.path).exports)
        .unwrap_or_default();
    let mut symbol_query = ctx.file.stem().to_string();
    for name in exports.iter().take(5) {
        symbol_query.push(' ');
        symbol_query.push_str(name);
    }
    queries.push(symbol_query);

    let added: Vec<&str> = ctx
        .file
        .patch
        .lines()
        .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
        .map(|l| l[1..].trim())
        .filter(|l| !l.is_empty())
        .take(CHANGE_QUERY_LINES)
        .collect();
    if !added.is_empty() {
        queries.push(truncate_chars(&added.join(" "), CHANGE_QUERY_CHARS).to_string());
    }

    queries.dedup();
    queries.truncate(limit);
    queries
}

/// The first `max_lines` lines of `content`, cut to at most `max_chars` characters.
///
/// # Examples
///
/// ```
/// use vigil_context::excerpt;
///
/// assert_eq!(excerpt("a\nb\nc\n", 2, 100), "a\nb");
/// assert_eq!(excerpt("abcdef", 10, 3), "abc");
/// ```
pub fn excerpt(content: &str, max_lines: usize, max_chars: usize) -> String {
    let lines: Vec<&str> = content.lines().take(max_lines).collect();
    truncate_chars(&lines.join("\n"), max_chars).to_string()
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
