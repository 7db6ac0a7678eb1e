use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mergegate_core::{
    render_report, resolve, Aggregator, ChangeSet, CommentPublisher, FuzzAdapter, LlmReviewAdapter,
    LlmSettings, ManualOverrides, OutputFormat, RunConfig, Scheduler, SemgrepAdapter, Severity,
    ToolKind,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mergegate",
    author,
    version,
    about = "Security-scan orchestration and merge gating"
)]
struct Cli {
    /// TOML run configuration file
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run applicable scanners against a change-set and gate on findings
    Run(RunArgs),
    /// Show the scan targets a change-set resolves to
    Resolve(ChangeSetArgs),
    /// List known tools and their effective configuration
    ListTools,
}

#[derive(Args, Debug)]
struct ChangeSetArgs {
    /// Git commit range, e.g. origin/main..HEAD
    #[arg(long, value_name = "RANGE")]
    range: Option<String>,

    /// Repository directory for git-based change-sets
    #[arg(long, value_name = "DIR", default_value = ".")]
    repo: PathBuf,

    /// JSON descriptor of changed files (code-host "files" payload shape)
    #[arg(long = "changed-files", value_name = "FILE", conflicts_with = "range")]
    changed_files: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    changeset: ChangeSetArgs,

    /// Manual override: time budget for bounded tools (e.g. 90s, 5m)
    #[arg(long, value_name = "DURATION")]
    duration: Option<humantime::Duration>,

    /// Manual override: explicit target file (repeatable)
    #[arg(long = "target", value_name = "PATH")]
    targets: Vec<PathBuf>,

    /// Bounded degree of parallelism for the invocation pool
    #[arg(long, value_name = "N")]
    max_parallel: Option<usize>,

    /// Severity threshold that fails the gate (info|low|medium|high|critical)
    #[arg(long, value_name = "SEVERITY")]
    fail_on: Option<String>,

    /// Report format: markdown or json
    #[arg(long, value_name = "FORMAT", default_value = "markdown")]
    format: String,

    /// Write the report to a file instead of stdout
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Post the report as a review comment, e.g. acme/widgets#42
    #[arg(long = "post-comment", value_name = "SLUG")]
    post_comment: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = load_run_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Resolve(args) => {
            let changeset = load_changeset(&args).await?;
            let targets = resolve(&changeset, &config);
            for target in &targets {
                println!("{}\t{}", target.tool, target.path.display());
            }
            println!("{} target(s) from {} changed file(s)", targets.len(), changeset.len());
            Ok(0)
        }
        Commands::ListTools => {
            list_tools(&config);
            Ok(0)
        }
    }
}

async fn run(mut config: RunConfig, args: RunArgs) -> Result<i32> {
    let overrides = ManualOverrides {
        duration_secs: args.duration.map(|d| d.as_secs()),
        targets: if args.targets.is_empty() {
            None
        } else {
            Some(args.targets.clone())
        },
    };
    config.apply_overrides(overrides);
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel = max_parallel;
    }
    let threshold = match &args.fail_on {
        Some(label) => Severity::parse_lenient(label)
            .with_context(|| format!("unknown severity `{label}` for --fail-on"))?,
        None => config.fail_on,
    };
    let format = parse_format(&args.format)?;
    config.validate().context("invalid run configuration")?;

    let changeset = load_changeset(&args.changeset).await?;
    let targets = resolve(&changeset, &config);
    tracing::info!(
        files = changeset.len(),
        targets = targets.len(),
        "starting orchestration run"
    );

    let mut scheduler = Scheduler::new(config.clone());
    for tool in config.enabled_tools() {
        match tool {
            ToolKind::Semgrep => scheduler.register(Arc::new(SemgrepAdapter::new())),
            ToolKind::Fuzz => scheduler.register(Arc::new(FuzzAdapter::new())),
            ToolKind::Llm => {
                let settings = LlmSettings::from_env()
                    .context("llm tool is enabled but its settings are incomplete")?;
                scheduler.register(Arc::new(LlmReviewAdapter::new(&settings)?));
            }
        }
    }

    let (cancel_tx, cancel_rx) = Scheduler::cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested; stopping in-flight tools");
            let _ = cancel_tx.send(true);
        }
    });

    let outcomes = scheduler.run(targets, cancel_rx).await;
    let mut aggregator = Aggregator::new(config.dedup.clone());
    for outcome in outcomes {
        aggregator.record(outcome);
    }
    let report = aggregator.finalize().context("failed to finalize run report")?;

    let rendered = render_report(&report, format)?;
    match &args.output {
        Some(path) => tokio::fs::write(path, &rendered)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?,
        None => println!("{rendered}"),
    }

    if let Some(slug) = &args.post_comment {
        let (repo, number) = parse_comment_slug(slug)?;
        let publisher = CommentPublisher::from_env()?;
        let comment = render_report(&report, OutputFormat::Markdown)?;
        publisher.post_comment(&repo, number, &comment).await?;
    }

    Ok(report.exit_code(threshold))
}

fn list_tools(config: &RunConfig) {
    for tool in ToolKind::all() {
        let Some(cfg) = config.tool(tool) else {
            println!("- {tool:<8} not configured");
            continue;
        };
        let state = if cfg.enabled { "enabled" } else { "disabled" };
        println!(
            "- {tool:<8} [{state:>8}] timeout {timeout}s, retries {retries}, extensions: {exts}",
            tool = tool,
            state = state,
            timeout = cfg.timeout_secs,
            retries = cfg.max_retries,
            exts = config.extensions_for(tool).join(","),
        );
    }
}

async fn load_changeset(args: &ChangeSetArgs) -> Result<ChangeSet> {
    if let Some(path) = &args.changed_files {
        return Ok(ChangeSet::from_descriptor_file(path).await?);
    }
    let Some(range) = &args.range else {
        bail!("either --range or --changed-files must be provided");
    };
    Ok(ChangeSet::from_commit_range(&args.repo, range).await?)
}

fn load_run_config(path: Option<&Path>) -> Result<RunConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    let settings = builder
        .add_source(config::Environment::with_prefix("MERGEGATE").separator("__"))
        .build()
        .context("failed to load configuration")?;
    settings
        .try_deserialize::<RunConfig>()
        .context("invalid run configuration")
}

fn parse_format(raw: &str) -> Result<OutputFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "markdown" | "md" => Ok(OutputFormat::Markdown),
        "json" => Ok(OutputFormat::Json),
        other => bail!("unknown report format `{other}` (expected markdown or json)"),
    }
}

fn parse_comment_slug(slug: &str) -> Result<(String, u64)> {
    let (repo, number) = slug
        .split_once('#')
        .with_context(|| format!("expected owner/repo#number, got `{slug}`"))?;
    if !repo.contains('/') {
        bail!("expected owner/repo#number, got `{slug}`");
    }
    let number = number
        .parse::<u64>()
        .with_context(|| format!("invalid issue number in `{slug}`"))?;
    Ok((repo.to_string(), number))
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_accepts_known_values() {
        assert_eq!(parse_format("markdown").unwrap(), OutputFormat::Markdown);
        assert_eq!(parse_format("MD").unwrap(), OutputFormat::Markdown);
        assert_eq!(parse_format("json").unwrap(), OutputFormat::Json);
        assert!(parse_format("yaml").is_err());
    }

    #[test]
    fn parse_comment_slug_splits_repo_and_number() {
        let (repo, number) = parse_comment_slug("acme/widgets#42").unwrap();
        assert_eq!(repo, "acme/widgets");
        assert_eq!(number, 42);
        assert!(parse_comment_slug("acme-widgets#42").is_err());
        assert!(parse_comment_slug("acme/widgets").is_err());
        assert!(parse_comment_slug("acme/widgets#abc").is_err());
    }
}
