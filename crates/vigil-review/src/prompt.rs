//! Static instruction material for review requests.
//!
//! Two caches with independent lifetimes live here. The assembled
//! [`InstructionBundle`] expires after `cache.instructions_ttl`. The derived
//! pattern summary is computed over the whole guideline library, keyed by the
//! SHA-256 of that text, and reused for as long as the text is unchanged, no
//! matter which platforms a batch touches.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use vigil_core::{CacheConfig, ChangedFile, ReasoningAgent};
use vigil_remote::{Clock, SystemClock};

const PATTERN_SYSTEM_PROMPT: &str = "\
You summarize code review guidelines. Reduce the guidelines you are given to \
a short checklist of the concrete patterns a reviewer should look for. \
Respond with plain text, one pattern per line.";

const PATTERN_MAX_TOKENS: u32 = 1024;

const GENERAL_GUIDELINES: &str = "\
- Report only issues you can point to in the diff: bugs, security problems, \
data loss, race conditions, resource leaks.
- Reference the line in the new version of the file.
- Skip style and naming unless they cause a defect.";

const IOS_GUIDELINES: &str = "\
- Main-thread UI updates; retain cycles in closures and delegates.
- Force unwraps on data that comes from the network or disk.
- Keychain rather than UserDefaults for secrets.";

const ANDROID_GUIDELINES: &str = "\
- Work on the main thread; leaked Context or Activity references.
- Lifecycle-aware collection of flows and LiveData.
- Exported components and intents carrying sensitive data.";

const WEB_GUIDELINES: &str = "\
- Unescaped user input reaching the DOM; unsafe HTML injection.
- Missing dependency arrays and stale closures in hooks.
- Unhandled promise rejections and missing loading or error states.";

const BACKEND_GUIDELINES: &str = "\
- Injection through string-built queries or shell commands.
- Missing authorization checks and unvalidated input at boundaries.
- Unbounded queries, missing timeouts, swallowed errors.";

/// Platform a changed file belongs to, used to pick guideline sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    General,
    Ios,
    Android,
    Web,
    Backend,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::General,
        Platform::Ios,
        Platform::Android,
        Platform::Web,
        Platform::Backend,
    ];

    /// Tag used for guideline file names.
    pub fn tag(self) -> &'static str {
        match self {
            Platform::General => "general",
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
            Platform::Backend => "backend",
        }
    }

    /// Platform implied by a file path, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_review::prompt::Platform;
    ///
    /// assert_eq!(Platform::from_path("App/LoginView.swift"), Some(Platform::Ios));
    /// assert_eq!(Platform::from_path("android/app/Main.java"), Some(Platform::Android));
    /// assert_eq!(Platform::from_path("server/Main.java"), Some(Platform::Backend));
    /// assert_eq!(Platform::from_path("README.md"), None);
    /// ```
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_lowercase();
        let ext = Path::new(&lower)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let in_android_tree = lower.starts_with("android/") || lower.contains("/android/");

        match ext {
            "swift" | "m" | "mm" | "xib" | "storyboard" => Some(Platform::Ios),
            "kt" | "kts" | "gradle" => Some(Platform::Android),
            "java" if in_android_tree => Some(Platform::Android),
            "xml" if in_android_tree => Some(Platform::Android),
            "ts" | "tsx" | "js" | "jsx" | "mjs" | "vue" | "svelte" | "css" | "scss" | "html" => {
                Some(Platform::Web)
            }
            "rs" | "go" | "py" | "rb" | "java" | "php" | "cs" | "sql" | "ex" | "exs" | "scala" => {
                Some(Platform::Backend)
            }
            _ => None,
        }
    }

    fn builtin_guidelines(self) -> &'static str {
        match self {
            Platform::General => GENERAL_GUIDELINES,
            Platform::Ios => IOS_GUIDELINES,
            Platform::Android => ANDROID_GUIDELINES,
            Platform::Web => WEB_GUIDELINES,
            Platform::Backend => BACKEND_GUIDELINES,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Platforms touched by a batch. `General` is always present.
pub fn detect_platforms(files: &[ChangedFile]) -> BTreeSet<Platform> {
    let mut platforms: BTreeSet<Platform> =
        files.iter().filter_map(|f| Platform::from_path(&f.path)).collect();
    platforms.insert(Platform::General);
    platforms
}

/// Guideline text per platform, read from a directory with built-in fallbacks.
#[derive(Debug, Clone, Default)]
pub struct GuidelineLibrary {
    dir: Option<PathBuf>,
}

impl GuidelineLibrary {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Text for `platform`: `<dir>/<tag>.md` when present, built-in otherwise.
    pub async fn load(&self, platform: Platform) -> String {
        let Some(dir) = &self.dir else {
            return platform.builtin_guidelines().to_string();
        };
        let path = dir.join(format!("{}.md", platform.tag()));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                platform.builtin_guidelines().to_string()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable guideline file, using built-in text");
                platform.builtin_guidelines().to_string()
            }
        }
    }

    /// One section per platform, `General` first.
    pub async fn assemble(&self, platforms: &BTreeSet<Platform>) -> String {
        let mut out = String::new();
        for platform in platforms {
            let text = self.load(*platform).await;
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("## {} guidelines\n\n{}", platform.tag(), text.trim_end()));
        }
        out
    }

    /// Every platform's section; the input to pattern analysis.
    pub async fn assemble_all(&self) -> String {
        self.assemble(&Platform::ALL.into_iter().collect()).await
    }
}

/// Cached static instructions for one batch composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBundle {
    /// Platforms the guidelines cover.
    pub platforms: BTreeSet<Platform>,
    /// Assembled guideline sections.
    pub guidelines: String,
    /// SHA-256 of `guidelines`, hex encoded.
    pub guidelines_hash: String,
    /// Agent-derived pattern checklist over the whole library, when analysis succeeded.
    pub pattern_summary: Option<String>,
}

impl InstructionBundle {
    /// Instruction text sent as the agent's system material.
    pub fn render(&self) -> String {
        match &self.pattern_summary {
            Some(summary) => format!(
                "{}\n\n## Patterns to check\n\n{}",
                self.guidelines,
                summary.trim_end()
            ),
            None => self.guidelines.clone(),
        }
    }
}

struct TimedEntry<T> {
    value: T,
    created_at: Instant,
    ttl: Duration,
}

impl<T> TimedEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) < self.ttl
    }
}

/// Memoized instruction bundles and pattern summaries.
pub struct PromptCache {
    library: GuidelineLibrary,
    agent: Arc<dyn ReasoningAgent>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    bundle: Mutex<Option<TimedEntry<Arc<InstructionBundle>>>>,
    summaries: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl PromptCache {
    pub fn new(config: &CacheConfig, agent: Arc<dyn ReasoningAgent>) -> Self {
        Self::with_clock(config, agent, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, agent: Arc<dyn ReasoningAgent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            library: GuidelineLibrary::new(config.guidelines_dir.clone()),
            agent,
            ttl: config.instructions_ttl,
            clock,
            bundle: Mutex::new(None),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    /// Instructions covering every platform in `files`.
    ///
    /// Served from cache while the bundle is younger than the TTL and covers
    /// the batch. Otherwise the bundle is rebuilt; a still-fresh bundle keeps
    /// its platforms so alternating batches do not thrash. The pattern
    /// summary is recomputed only when the guideline library changes, and
    /// concurrent callers share a single analysis.
    pub async fn get_static_instructions(&self, files: &[ChangedFile]) -> Arc<InstructionBundle> {
        let needed = detect_platforms(files);
        let now = self.clock.now();

        let mut platforms = needed.clone();
        {
            let cached = lock(&self.bundle);
            if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(now)) {
                if needed.is_subset(&entry.value.platforms) {
                    debug!("instruction bundle served from cache");
                    return Arc::clone(&entry.value);
                }
                platforms.extend(entry.value.platforms.iter().copied());
            }
        }

        let guidelines = self.library.assemble(&platforms).await;
        let guidelines_hash = sha256_hex(&guidelines);
        let pattern_summary = self.pattern_summary().await;

        let tags: Vec<&str> = platforms.iter().map(|p| p.tag()).collect();
        info!(platforms = ?tags, summary = pattern_summary.is_some(), "built instruction bundle");

        let bundle = Arc::new(InstructionBundle {
            platforms,
            guidelines,
            guidelines_hash,
            pattern_summary,
        });
        *lock(&self.bundle) = Some(TimedEntry {
            value: Arc::clone(&bundle),
            created_at: self.clock.now(),
            ttl: self.ttl,
        });
        bundle
    }

    /// Drop the cached bundle, and the derived summary too when `include_derived`.
    pub fn clear_cache(&self, include_derived: bool) {
        *lock(&self.bundle) = None;
        if include_derived {
            lock(&self.summaries).clear();
        }
        debug!(include_derived, "instruction cache cleared");
    }

    async fn pattern_summary(&self) -> Option<String> {
        let library = self.library.assemble_all().await;
        let hash = sha256_hex(&library);
        let cell = Arc::clone(lock(&self.summaries).entry(hash.clone()).or_default());

        let analysis = cell
            .get_or_try_init(|| async {
                debug!(hash = %hash, "analyzing guideline patterns");
                let prompt = format!("Guidelines:\n\n{library}");
                self.agent
                    .complete(PATTERN_SYSTEM_PROMPT, &prompt, PATTERN_MAX_TOKENS)
                    .await
            })
            .await;

        match analysis {
            Ok(summary) => Some(summary.clone()),
            Err(e) => {
                warn!(error = %e, "pattern analysis failed, continuing without summary");
                None
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use vigil_core::{AgentRequest, FileStatus, Finding, VigilError};
    use vigil_remote::ManualClock;

    #[derive(Default)]
    struct CountingAgent {
        analyses: AtomicU32,
        fail: AtomicBool,
        delay: Duration,
    }

    async fn join_bundles(
        tasks: Vec<tokio::task::JoinHandle<Arc<InstructionBundle>>>,
    ) -> Vec<Arc<InstructionBundle>> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.unwrap());
        }
        out
    }

    #[async_trait]
    impl ReasoningAgent for CountingAgent {
        async fn review(&self, _request: &AgentRequest) -> Result<Vec<Finding>, VigilError> {
            Ok(Vec::new())
        }

        async fn complete(&self, _: &str, prompt: &str, _: u32) -> Result<String, VigilError> {
            let n = self.analyses.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(VigilError::Overloaded("529".into()));
            }
            Ok(format!("summary #{n} of {} bytes", prompt.len()))
        }
    }

    fn file(path: &str) -> ChangedFile {
        ChangedFile::new(path, FileStatus::Modified, "+x")
    }

    fn cache(agent: &Arc<CountingAgent>, clock: &Arc<ManualClock>) -> PromptCache {
        PromptCache::with_clock(&CacheConfig::default(), agent.clone(), clock.clone())
    }

    fn analyses(agent: &CountingAgent) -> u32 {
        agent.analyses.load(Ordering::SeqCst)
    }

    #[test]
    fn platforms_always_include_general() {
        let platforms = detect_platforms(&[file("web/src/App.tsx"), file("api/handler.go")]);
        assert_eq!(
            platforms.into_iter().collect::<Vec<_>>(),
            vec![Platform::General, Platform::Web, Platform::Backend]
        );
        assert_eq!(
            detect_platforms(&[file("docs/intro.md")]),
            BTreeSet::from([Platform::General])
        );
    }

    #[tokio::test]
    async fn bundle_is_reused_within_ttl() {
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);
        let batch = [file("src/App.tsx")];

        let first = cache.get_static_instructions(&batch).await;
        clock.advance(Duration::from_secs(299));
        let second = cache.get_static_instructions(&batch).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(analyses(&agent), 1);
        assert!(first.render().contains("## web guidelines"));
        assert!(first.render().contains("## Patterns to check"));
    }

    #[tokio::test]
    async fn expired_bundle_rebuilds_but_summary_is_reused() {
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);
        let batch = [file("src/App.tsx")];

        let first = cache.get_static_instructions(&batch).await;
        clock.advance(Duration::from_secs(300));
        let second = cache.get_static_instructions(&batch).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.pattern_summary, second.pattern_summary);
        assert_eq!(analyses(&agent), 1);
    }

    #[tokio::test]
    async fn new_platform_rebuilds_without_reanalysis() {
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);

        let web = cache.get_static_instructions(&[file("src/App.tsx")]).await;
        let mixed = cache.get_static_instructions(&[file("ios/Login.swift")]).await;

        assert_ne!(web.guidelines_hash, mixed.guidelines_hash);
        assert!(mixed.platforms.contains(&Platform::Web));
        assert!(mixed.platforms.contains(&Platform::Ios));
        assert_eq!(web.pattern_summary, mixed.pattern_summary);
        assert_eq!(analyses(&agent), 1);

        // A web-only batch is now covered by the combined bundle.
        let again = cache.get_static_instructions(&[file("src/App.tsx")]).await;
        assert!(Arc::ptr_eq(&mixed, &again));
    }

    #[tokio::test]
    async fn alternating_batches_across_expiries_analyze_once() {
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);

        for round in 0..4 {
            let batch = if round % 2 == 0 {
                file("src/App.tsx")
            } else {
                file("ios/Login.swift")
            };
            let bundle = cache.get_static_instructions(&[batch]).await;
            assert!(bundle.pattern_summary.is_some());
            clock.advance(Duration::from_secs(301));
        }
        assert_eq!(analyses(&agent), 1);
    }

    #[tokio::test]
    async fn concurrent_cold_callers_share_one_analysis() {
        let agent = Arc::new(CountingAgent {
            delay: Duration::from_millis(50),
            ..CountingAgent::default()
        });
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(cache(&agent, &clock));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_static_instructions(&[file("main.py")]).await })
            })
            .collect();
        let bundles: Vec<Arc<InstructionBundle>> = join_bundles(tasks).await;

        assert_eq!(analyses(&agent), 1);
        assert!(bundles
            .iter()
            .all(|b| b.pattern_summary == bundles[0].pattern_summary && b.pattern_summary.is_some()));
    }

    #[tokio::test]
    async fn edited_guidelines_are_reanalyzed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("web.md"), "Prefer strict equality.\n").unwrap();
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            guidelines_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let cache = PromptCache::with_clock(&config, agent.clone(), clock.clone());
        let batch = [file("src/App.tsx")];

        let before = cache.get_static_instructions(&batch).await;
        std::fs::write(dir.path().join("web.md"), "Prefer strict equality and optional chaining.\n").unwrap();
        clock.advance(Duration::from_secs(301));
        let after = cache.get_static_instructions(&batch).await;

        assert_eq!(analyses(&agent), 2);
        assert_ne!(before.pattern_summary, after.pattern_summary);
        assert!(after.guidelines.contains("optional chaining"));
    }

    #[tokio::test]
    async fn clear_cache_respects_include_derived() {
        let agent = Arc::new(CountingAgent::default());
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);
        let batch = [file("main.py")];

        cache.get_static_instructions(&batch).await;
        cache.clear_cache(false);
        cache.get_static_instructions(&batch).await;
        assert_eq!(analyses(&agent), 1);

        cache.clear_cache(true);
        cache.get_static_instructions(&batch).await;
        assert_eq!(analyses(&agent), 2);
    }

    #[tokio::test]
    async fn failed_analysis_is_not_cached() {
        let agent = Arc::new(CountingAgent::default());
        agent.fail.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&agent, &clock);
        let batch = [file("main.py")];

        let bundle = cache.get_static_instructions(&batch).await;
        assert!(bundle.pattern_summary.is_none());
        assert_eq!(bundle.render(), bundle.guidelines);

        agent.fail.store(false, Ordering::SeqCst);
        cache.clear_cache(false);
        let bundle = cache.get_static_instructions(&batch).await;
        assert!(bundle.pattern_summary.is_some());
        assert_eq!(analyses(&agent), 2);
    }

    #[tokio::test]
    async fn guideline_files_override_builtin_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("web.md"), "Always use strict null checks.\n").unwrap();
        let library = GuidelineLibrary::new(Some(dir.path().to_path_buf()));

        assert_eq!(library.load(Platform::Web).await, "Always use strict null checks.\n");
        assert_eq!(library.load(Platform::Backend).await, BACKEND_GUIDELINES);

        let text = library
            .assemble(&BTreeSet::from([Platform::General, Platform::Web]))
            .await;
        assert!(text.starts_with("## general guidelines"));
        assert!(text.ends_with("Always use strict null checks."));
    }

    #[test]
    fn hash_is_stable_hex() {
        let hash = sha256_hex("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
