use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VigilError;
use crate::types::ContextStrategy;

/// Top-level configuration loaded from `.vigil.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use vigil_core::VigilConfig;
///
/// let config = VigilConfig::default();
/// assert_eq!(config.context.max_dependents, 5);
/// assert_eq!(config.resilience.breaker_threshold, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Reasoning-agent settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Job queue behaviour.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Context selection.
    #[serde(default)]
    pub context: ContextConfig,
    /// Auxiliary semantic search service.
    #[serde(default)]
    pub search: SearchConfig,
    /// Retry and circuit-breaker tuning.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Instruction cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// External runner command per agent name.
    #[serde(default)]
    pub runners: HashMap<String, RunnerConfig>,
}

impl VigilConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if the file cannot be read, or
    /// [`VigilError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, VigilError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use vigil_core::{ContextStrategy, VigilConfig};
    ///
    /// let toml = r#"
    /// [context]
    /// strategy = "dependency_aware"
    ///
    /// [resilience]
    /// breaker_cooldown = "2m"
    /// "#;
    /// let config = VigilConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.context.strategy, ContextStrategy::DependencyAware);
    /// assert_eq!(config.resilience.breaker_cooldown, Duration::from_secs(120));
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VigilError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill secrets that were left out of the file from the environment.
    ///
    /// `VIGIL_AGENT_API_KEY` supplies `agent.api_key` when unset.
    pub fn apply_env(&mut self) {
        if self.agent.api_key.is_none() {
            self.agent.api_key = std::env::var("VIGIL_AGENT_API_KEY").ok();
        }
    }

    /// Reject combinations that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), VigilError> {
        if self.context.fallback > ContextStrategy::FullFile {
            return Err(VigilError::Config(format!(
                "context.fallback must be diff_only or full_file, got {}",
                self.context.fallback
            )));
        }
        if self.queue.max_parallel == 0 {
            return Err(VigilError::Config(
                "queue.max_parallel must be at least 1".into(),
            ));
        }
        if self.resilience.retry_attempts == 0 {
            return Err(VigilError::Config(
                "resilience.retry_attempts must be at least 1".into(),
            ));
        }
        if self.resilience.breaker_threshold == 0 {
            return Err(VigilError::Config(
                "resilience.breaker_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Reasoning-agent configuration.
///
/// # Examples
///
/// ```
/// use vigil_core::AgentConfig;
///
/// let config = AgentConfig::default();
/// assert_eq!(config.model, "gpt-4o");
/// assert_eq!(config.max_output_tokens, 4096);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Ceiling on response tokens per request.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_agent_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            max_output_tokens: default_max_output_tokens(),
            timeout: default_agent_timeout(),
        }
    }
}

/// How a queue advances between jobs of the same agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One running job per agent; the next starts after completion is reported.
    #[default]
    Sequential,
    /// Jobs start on admission, up to `max_parallel` in flight.
    Parallel,
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Sequential or parallel dispatch.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Upper bound on concurrently running jobs in parallel mode.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Running jobs older than this are failed by the reaper.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
    /// Finished jobs kept for status lookups.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_parallel() -> usize {
    4
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_history_limit() -> usize {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_parallel: default_max_parallel(),
            stale_after: default_stale_after(),
            history_limit: default_history_limit(),
        }
    }
}

/// Context selection configuration.
///
/// # Examples
///
/// ```
/// use vigil_core::{ContextConfig, ContextStrategy};
///
/// let config = ContextConfig::default();
/// assert_eq!(config.strategy, ContextStrategy::FullFile);
/// assert_eq!(config.max_tests, 3);
/// assert!(config.skip_patterns.iter().any(|p| p.contains("node_modules")));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Strategy to attempt for every file in a run.
    #[serde(default)]
    pub strategy: ContextStrategy,
    /// Cheapest strategy the selector may degrade to before giving up on enrichment.
    #[serde(default)]
    pub fallback: ContextStrategy,
    /// Dependents attached per file.
    #[serde(default = "default_max_dependents")]
    pub max_dependents: usize,
    /// Related tests attached per file.
    #[serde(default = "default_max_tests")]
    pub max_tests: usize,
    /// Lines kept per related-file excerpt.
    #[serde(default = "default_excerpt_lines")]
    pub excerpt_lines: usize,
    /// Characters kept per related-file excerpt.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// Token ceiling per agent request.
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,
    /// Glob patterns excluded from the dependency universe.
    #[serde(default = "default_skip_patterns")]
    pub skip_patterns: Vec<String>,
}

fn default_max_dependents() -> usize {
    5
}

fn default_max_tests() -> usize {
    3
}

fn default_excerpt_lines() -> usize {
    60
}

fn default_excerpt_chars() -> usize {
    2000
}

fn default_max_batch_tokens() -> usize {
    60_000
}

fn default_skip_patterns() -> Vec<String> {
    [
        "**/node_modules/**",
        "**/dist/**",
        "**/build/**",
        "**/vendor/**",
        "**/target/**",
        "**/__pycache__/**",
        "**/*.min.js",
        "**/*.lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ContextConfig {
    /// The floor the selector degrades to, never richer than the strategy itself.
    pub fn effective_fallback(&self) -> ContextStrategy {
        self.fallback.min(self.strategy)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::default(),
            fallback: ContextStrategy::FullFile,
            max_dependents: default_max_dependents(),
            max_tests: default_max_tests(),
            excerpt_lines: default_excerpt_lines(),
            excerpt_chars: default_excerpt_chars(),
            max_batch_tokens: default_max_batch_tokens(),
            skip_patterns: default_skip_patterns(),
        }
    }
}

/// Semantic search service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Whether the selector may use the service at all.
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the service.
    #[serde(default = "default_search_url")]
    pub base_url: String,
    /// Maximum hits per query.
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    /// Minimum similarity score.
    #[serde(default = "default_search_threshold")]
    pub threshold: f64,
    /// Queries issued per changed file.
    #[serde(default = "default_queries_per_file")]
    pub queries_per_file: usize,
    /// Per-request HTTP timeout.
    #[serde(default = "default_search_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_search_url() -> String {
    "http://localhost:5000".into()
}

fn default_search_limit() -> usize {
    10
}

fn default_search_threshold() -> f64 {
    0.7
}

fn default_queries_per_file() -> usize {
    2
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_search_url(),
            limit: default_search_limit(),
            threshold: default_search_threshold(),
            queries_per_file: default_queries_per_file(),
            timeout: default_search_timeout(),
        }
    }
}

/// Retry and circuit-breaker tuning.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil_core::ResilienceConfig;
///
/// let config = ResilienceConfig::default();
/// assert_eq!(config.retry_attempts, 3);
/// assert_eq!(config.breaker_cooldown, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Total attempts for reasoning-agent calls, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Consecutive failures that open a circuit.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// How long an open circuit stays open.
    #[serde(default = "default_breaker_cooldown", with = "humantime_serde")]
    pub breaker_cooldown: Duration,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(60)
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
        }
    }
}

/// Instruction cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of an assembled instruction bundle.
    #[serde(default = "default_instructions_ttl", with = "humantime_serde")]
    pub instructions_ttl: Duration,
    /// Directory holding `<platform>.md` guideline files.
    pub guidelines_dir: Option<PathBuf>,
}

fn default_instructions_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instructions_ttl: default_instructions_ttl(),
            guidelines_dir: None,
        }
    }
}

/// External command that performs a review for one agent.
///
/// `{subject}` and `{agent}` in `args` are replaced at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Program to execute.
    pub command: String,
    /// Arguments, with placeholders.
    #[serde(default)]
    pub args: Vec<String>,
}
