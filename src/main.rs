use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vigil_context::{estimate_tokens, ContextSelector};
use vigil_core::{ContextStrategy, ReasoningAgent, SemanticSearch, SourceControl, VigilConfig};
use vigil_remote::{AgentClient, GuardedSearch, RetryPolicy, RetryingAgent, SearchClient};
use vigil_review::github::GitHubClient;
use vigil_review::{
    JobQueueManager, PipelineHandler, ProcessHandler, PromptCache, ReviewHandler, ReviewPipeline,
};

const CONFIG_FILE: &str = ".vigil.toml";

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Review orchestration for automated pull request review",
    long_about = "Vigil queues pull request reviews per agent, picks how much surrounding\n\
                   code each reviewer sees, and calls the reasoning agent and search\n\
                   service with retries and circuit breaking.\n\n\
                   Examples:\n  \
                     vigil review acme/shop#42                 Review a pull request\n  \
                     vigil review acme/shop#42 --post          Review and post the summary\n  \
                     vigil context acme/shop#42 --checkout .   Show selected context\n  \
                     vigil queue -a reviewer-a acme/shop#41 acme/shop#42\n  \
                     vigil search-health --repo .              Check the search service"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .vigil.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Review a GitHub pull request
    #[command(long_about = "Review a GitHub pull request.\n\n\
        Fetches the changed files, selects context, batches them under the\n\
        token ceiling, and prints the findings. Requires GITHUB_TOKEN and an\n\
        agent API key (agent.api_key or VIGIL_AGENT_API_KEY).\n\n\
        Examples:\n  \
          vigil review acme/shop#42\n  \
          vigil review acme/shop#42 --checkout ../shop --strategy dependency_aware\n  \
          vigil review acme/shop#42 --post")]
    Review {
        /// Pull request reference (owner/repo#number)
        subject: String,
        /// Local checkout used for dependency lookups and semantic search
        #[arg(long)]
        checkout: Option<PathBuf>,
        /// Override context.strategy
        #[arg(long)]
        strategy: Option<ContextStrategy>,
        /// Post the summary as a pull request comment
        #[arg(long)]
        post: bool,
    },
    /// Show the context that would be sent for a pull request
    #[command(long_about = "Show the context that would be sent for a pull request.\n\n\
        Runs strategy selection and context fetching without calling the\n\
        reasoning agent. Useful for tuning [context] settings.")]
    Context {
        /// Pull request reference (owner/repo#number)
        subject: String,
        /// Local checkout used for dependency lookups and semantic search
        #[arg(long)]
        checkout: Option<PathBuf>,
        /// Override context.strategy
        #[arg(long)]
        strategy: Option<ContextStrategy>,
    },
    /// Run reviews through the job queue and wait for them
    #[command(long_about = "Run reviews through the job queue and wait for them.\n\n\
        Every subject is enqueued for every agent. Agents with a [runners.<agent>]\n\
        entry run that command; others run the built-in review pipeline and post\n\
        their summary. Duplicate subjects are rejected per agent.")]
    Queue {
        /// Agent names to enqueue for
        #[arg(long = "agent", short = 'a', required = true)]
        agents: Vec<String>,
        /// Pull request references (owner/repo#number)
        #[arg(required = true)]
        subjects: Vec<String>,
        /// Local checkout for the built-in pipeline
        #[arg(long)]
        checkout: Option<PathBuf>,
    },
    /// Check the semantic search service
    SearchHealth {
        /// Also report whether this repository is indexed
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Create a default .vigil.toml configuration file
    #[command(long_about = "Create a default .vigil.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .vigil.toml already exists.")]
    Init,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable summaries
    Text,
    /// Machine-readable JSON with camelCase keys
    Json,
    /// GitHub-flavored Markdown
    Markdown,
}

const DEFAULT_CONFIG: &str = r#"# Vigil Configuration

[agent]
# provider = "openai"
# model = "gpt-4o"
# base_url = "https://api.openai.com/v1"
# api_key is read from VIGIL_AGENT_API_KEY when unset
# max_output_tokens = 4096
# timeout = "120s"

[queue]
# mode = "sequential"  # or "parallel"
# max_parallel = 4
# stale_after = "30m"
# history_limit = 100

[context]
# strategy = "full_file"  # diff_only, full_file, dependency_aware, semantic_search
# fallback = "full_file"
# max_dependents = 5
# max_tests = 3
# excerpt_lines = 60
# excerpt_chars = 2000
# max_batch_tokens = 60000
# skip_patterns = ["**/node_modules/**", "**/dist/**", "**/*.lock"]

[search]
# enabled = false
# base_url = "http://localhost:5000"
# limit = 10
# threshold = 0.7
# queries_per_file = 2
# timeout = "10s"

[resilience]
# retry_attempts = 3
# breaker_threshold = 3
# breaker_cooldown = "60s"

[cache]
# instructions_ttl = "5m"
# guidelines_dir = ".vigil/guidelines"

# External review command per agent
# [runners.reviewer-a]
# command = "review-bot"
# args = ["--pr", "{subject}", "--as", "{agent}"]
"#;

fn load_config(path: Option<&Path>) -> Result<VigilConfig> {
    let mut config = match path {
        Some(path) => VigilConfig::from_file(path)?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                VigilConfig::from_file(default_path)?
            } else {
                VigilConfig::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn search_service(config: &VigilConfig) -> Result<Arc<dyn SemanticSearch>> {
    let client = SearchClient::new(&config.search)?;
    Ok(Arc::new(GuardedSearch::from_config(client, &config.resilience)))
}

fn build_selector(config: &VigilConfig, source: Arc<dyn SourceControl>) -> Result<ContextSelector> {
    let mut selector = ContextSelector::new(source, config.context.clone());
    if config.search.enabled {
        selector = selector.with_search(search_service(config)?, config.search.clone());
    }
    Ok(selector)
}

fn build_pipeline(
    config: &VigilConfig,
    source: Arc<dyn SourceControl>,
    checkout: Option<PathBuf>,
) -> Result<ReviewPipeline> {
    let client = AgentClient::new(&config.agent)?;
    let agent: Arc<dyn ReasoningAgent> = Arc::new(RetryingAgent::new(
        client,
        RetryPolicy::from(&config.resilience),
    ));
    let prompts = Arc::new(PromptCache::new(&config.cache, Arc::clone(&agent)));
    let selector = build_selector(config, Arc::clone(&source))?;

    let pipeline = ReviewPipeline::new(
        source,
        selector,
        prompts,
        agent,
        config.agent.max_output_tokens,
    );
    Ok(match checkout {
        Some(path) => pipeline.with_checkout(path),
        None => pipeline,
    })
}

async fn run_queue(
    config: &VigilConfig,
    agents: &[String],
    subjects: &[String],
    checkout: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let manager = JobQueueManager::new(config.queue.clone());
    let completions = manager.completion_sender();

    let mut pipeline: Option<Arc<ReviewPipeline>> = None;
    for agent in agents {
        let handler: Arc<dyn ReviewHandler> = match config.runners.get(agent) {
            Some(runner) => {
                debug!(agent = %agent, command = %runner.command, "using external runner");
                Arc::new(ProcessHandler::new(runner.clone(), completions.clone()))
            }
            None => {
                let shared = match &pipeline {
                    Some(p) => Arc::clone(p),
                    None => {
                        let source: Arc<dyn SourceControl> = Arc::new(GitHubClient::new(None)?);
                        let built = Arc::new(build_pipeline(config, source, checkout.clone())?);
                        pipeline = Some(Arc::clone(&built));
                        built
                    }
                };
                Arc::new(PipelineHandler::new(shared, completions.clone()))
            }
        };
        manager.register_handler(agent.clone(), handler);
    }

    let listener = manager.spawn_completion_listener();
    let reap_every = (config.queue.stale_after / 4).max(Duration::from_secs(1));
    let reaper = manager.spawn_reaper(reap_every);

    for subject in subjects {
        for agent in agents {
            let admission = manager.enqueue(agent, subject)?;
            match admission.position {
                Some(0) => info!(agent = %agent, subject = %subject, "review started"),
                Some(position) => {
                    info!(agent = %agent, subject = %subject, position, "review queued")
                }
                None => info!(agent = %agent, subject = %subject, "already queued, skipped"),
            }
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticker.tick().await;
        let status = manager.status();
        let active: usize = status.queues.values().map(|q| q.pending + q.running).sum();
        if active == 0 {
            break;
        }
    }
    reaper.abort();
    if let Some(listener) = listener {
        listener.abort();
    }

    let jobs: Vec<_> = agents
        .iter()
        .flat_map(|agent| subjects.iter().filter_map(|s| manager.job(agent, s)))
        .collect();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs).into_diagnostic()?);
        }
        OutputFormat::Text | OutputFormat::Markdown => {
            for job in &jobs {
                println!(
                    "{:<8} {:<20} {}",
                    job.status.to_string(),
                    job.agent_name,
                    job.subject_ref
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Init = cli.command {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            miette::bail!("{CONFIG_FILE} already exists");
        }
        std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
        println!("Created {CONFIG_FILE} with default configuration");
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Review {
            ref subject,
            ref checkout,
            strategy,
            post,
        } => {
            if let Some(strategy) = strategy {
                config.context.strategy = strategy;
            }
            let source: Arc<dyn SourceControl> = Arc::new(GitHubClient::new(None)?);
            let pipeline = build_pipeline(&config, Arc::clone(&source), checkout.clone())?;

            let outcome = if post {
                pipeline.run(subject).await?
            } else {
                let info = pipeline.subject_info(subject).await?;
                let files = source.changed_files(subject).await?;
                pipeline.review(&files, &info).await?
            };

            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&outcome).into_diagnostic()?);
                }
                OutputFormat::Markdown => print!("{}", outcome.to_markdown()),
                OutputFormat::Text => print!("{outcome}"),
            }
        }
        Command::Context {
            ref subject,
            ref checkout,
            strategy,
        } => {
            if let Some(strategy) = strategy {
                config.context.strategy = strategy;
            }
            let source: Arc<dyn SourceControl> = Arc::new(GitHubClient::new(None)?);
            let selector = build_selector(&config, Arc::clone(&source))?;
            let mut info = vigil_context::SubjectInfo::new(
                subject.as_str(),
                source.head_ref(subject).await?,
            );
            if let Some(path) = checkout {
                let root = path.clone();
                let universe = tokio::task::spawn_blocking(move || vigil_depscan::walk_repo(&root))
                    .await
                    .into_diagnostic()??;
                info = info
                    .with_repo_path(path.display().to_string())
                    .with_universe(universe);
            }

            let files = source.changed_files(subject).await?;
            let (strategy, contexts) = selector.select_context(&files, &info).await;

            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&contexts).into_diagnostic()?);
                }
                OutputFormat::Text | OutputFormat::Markdown => {
                    println!("Strategy: {strategy}\n");
                    for ctx in &contexts {
                        println!(
                            "{} [{}] ~{} tokens",
                            ctx.file.path,
                            ctx.strategy,
                            estimate_tokens(ctx)
                        );
                        for related in &ctx.related_files {
                            println!("  {:?}: {}", related.relationship, related.path);
                        }
                    }
                }
            }
        }
        Command::Queue {
            ref agents,
            ref subjects,
            ref checkout,
        } => {
            run_queue(&config, agents, subjects, checkout.clone(), cli.format).await?;
        }
        Command::SearchHealth { ref repo } => {
            let search = search_service(&config)?;
            let health = search.health().await?;
            let indexed = match repo {
                Some(path) => Some(search.check_indexed(&path.display().to_string()).await?),
                None => None,
            };

            match cli.format {
                OutputFormat::Json => {
                    let value = serde_json::json!({
                        "status": health.status,
                        "indexedRepoCount": health.indexed_repo_count,
                        "chunkCount": health.chunk_count,
                        "indexed": indexed,
                    });
                    println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
                }
                OutputFormat::Text | OutputFormat::Markdown => {
                    println!("Search service: {}", config.search.base_url);
                    println!("  status:  {}", health.status);
                    println!("  repos:   {}", health.indexed_repo_count);
                    println!("  chunks:  {}", health.chunk_count);
                    if let Some(indexed) = indexed {
                        println!("  indexed: {}", if indexed { "yes" } else { "no" });
                    }
                }
            }
        }
        Command::Init => unreachable!("handled before config loading"),
    }

    Ok(())
}
