use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use concord_core::{CheckState, ConcordConfig, FileResult, FileStatus, OutputFormat, Severity};
use concord_review::{
    CheckOutcome, CheckRunner, Collaborators, LlmClient, ProgressEvent, ProgressSink, ProgressStore,
    RuleSet, StopHandle,
};

#[derive(Parser)]
#[command(
    name = "concord",
    version,
    about = "Consensus-based LLM code review for large file sets",
    long_about = "Concord checks source files against natural language rules.\n\n\
                   Files are split into overlapping chunks, every chunk is reviewed several\n\
                   times, and only findings enough attempts agree on are reported. Progress is\n\
                   checkpointed so an interrupted check can be resumed.\n\n\
                   Examples:\n  \
                     concord init                         Write a default .concord.toml\n  \
                     concord check src/                   Check every file under src/\n  \
                     concord check . --repeat 3 --consensus-ratio 0.67\n  \
                     concord resume 20260101-120000-ab12cd34\n  \
                     concord status                       List stored checks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .concord.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text  Human-readable summaries (default)\n  \
                         json  Machine-readable JSON with camelCase keys"
    )]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Check files against the configured rules
    #[command(long_about = "Check files against the configured rules.\n\n\
        Directories are walked recursively, honouring .gitignore. Flags override\n\
        the [check] section of the configuration file.\n\n\
        Examples:\n  concord check src/main.rs src/lib.rs\n  concord check . --include '*.rs' --fail-on error")]
    Check {
        /// Files or directories to check
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Markdown rule file (overrides rules_file)
        #[arg(long)]
        rules: Option<PathBuf>,

        /// LLM attempts per chunk
        #[arg(long)]
        repeat: Option<usize>,

        /// Fraction of attempts that must agree on a finding, in (0, 1]
        #[arg(long)]
        consensus_ratio: Option<f64>,

        /// Files checked concurrently
        #[arg(long)]
        max_workers: Option<usize>,

        /// Token budget per chunk
        #[arg(long)]
        chunk_tokens: Option<usize>,

        /// Wall-clock budget per file, in seconds
        #[arg(long)]
        file_timeout: Option<u64>,

        /// Timeout for a single LLM call, in seconds
        #[arg(long)]
        llm_timeout: Option<u64>,

        /// Only check files matching these glob patterns
        #[arg(long)]
        include: Vec<String>,

        /// Exit with non-zero code if findings meet severity threshold
        #[arg(
            long,
            long_help = "Exit with non-zero code if findings of this severity or higher are found.\n\n\
                Severity ranking: error > warning > info."
        )]
        fail_on: Option<Severity>,
    },
    /// Continue an interrupted check
    Resume {
        /// Id printed when the check was started
        check_id: String,

        /// Exit with non-zero code if findings meet severity threshold
        #[arg(long)]
        fail_on: Option<Severity>,
    },
    /// Show stored checks, or one check in detail
    Status {
        /// Check to describe (default: list all)
        check_id: Option<String>,
    },
    /// Create a default .concord.toml in the current directory
    Init,
}

const DEFAULT_CONFIG: &str = r#"# Concord Configuration

# Markdown rule file, relative to this file
# rules_file = "RULES.md"

[llm]
# OpenAI-compatible endpoint; the key falls back to CONCORD_API_KEY or OPENAI_API_KEY
# provider = "openai"
# model = "gpt-4o"
# base_url = "https://api.openai.com"

[check]
# chunk_token_limit = 20000
# repeat = 1
# consensus_ratio = 1.0
# llm_timeout_secs = 120
# file_timeout_secs = 600
# max_workers = 5
# overlap_lines = 10
# overlap_multiplier = 1.0

[check.sampling]
# temperature = 0.0
# top_p = 1.0
# seed = 42

[progress]
# dir = ".concord/progress"

# Inline rules
# [[rules]]
# id = "fn-length"
# severity = "warning"
# description = "Functions must not exceed 50 lines"
# applies_to = ["*.rs"]
"#;

/// Drives the progress bar from engine events.
struct BarProgress(ProgressBar);

impl ProgressSink for BarProgress {
    fn on_event(&self, event: &ProgressEvent) {
        if let ProgressEvent::ChunkStart {
            file, index, total, ..
        } = event
        {
            self.0
                .set_message(format!("{} [{}/{}]", file.display(), index + 1, total));
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,concord=debug,concord_review=debug,concord_chunk=debug")
    } else {
        EnvFilter::try_from_env("CONCORD_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Config file and the directory its relative paths resolve against.
fn load_config(path: Option<&Path>) -> Result<(ConcordConfig, PathBuf)> {
    let (mut config, base) = match path {
        Some(path) => (
            ConcordConfig::from_file(path).into_diagnostic()?,
            path.parent().map(Path::to_path_buf),
        ),
        None => {
            let default_path = Path::new(".concord.toml");
            if default_path.exists() {
                (ConcordConfig::from_file(default_path).into_diagnostic()?, None)
            } else {
                (ConcordConfig::default(), None)
            }
        }
    };
    config.apply_env();
    let base = base
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((config, base))
}

/// Expand `paths` into a sorted, deduplicated list of files.
fn collect_files(paths: &[PathBuf], include: &[String]) -> Result<Vec<PathBuf>> {
    let patterns = include
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| miette::miette!("invalid --include pattern {p:?}: {e}")))
        .collect::<Result<Vec<_>>>()?;
    let wanted = |path: &Path| {
        patterns.is_empty()
            || patterns.iter().any(|p| {
                p.matches_path(path)
                    || path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| p.matches(n))
            })
    };

    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            if wanted(path) {
                files.push(path.clone());
            }
            continue;
        }
        if !path.is_dir() {
            miette::bail!("no such file or directory: {}", path.display());
        }
        for entry in ignore::WalkBuilder::new(path).build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_some_and(|t| t.is_file()) && wanted(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn progress_bar(len: usize, hidden: bool) -> ProgressBar {
    if hidden || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30}] {pos}/{len} {wide_msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb
}

/// Build a runner whose Ctrl-C handler stops dispatching new files.
fn build_runner(config: &ConcordConfig, base: &Path, pb: &ProgressBar) -> Result<CheckRunner> {
    let rules = RuleSet::from_config(config, base).into_diagnostic()?;
    if rules.is_empty() {
        miette::bail!(miette::miette!(
            help = "add [[rules]] entries or a rules_file to .concord.toml, or pass --rules",
            "no rules configured"
        ));
    }
    tracing::debug!(rules = rules.rules().len(), "rules loaded");

    let client = LlmClient::new(&config.llm).into_diagnostic()?;
    tracing::debug!(model = client.model(), "LLM client ready");
    let collaborators = Collaborators::new(Arc::new(client), Arc::new(rules))
        .with_progress(Arc::new(BarProgress(pb.clone())));

    let stop = StopHandle::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: finishing files in flight");
            on_signal.stop();
        }
    });

    let store = ProgressStore::new(&config.progress.dir);
    Ok(CheckRunner::new(collaborators, store).with_stop(stop))
}

fn on_result(pb: &ProgressBar) -> impl FnMut(&FileResult) + '_ {
    move |result| {
        pb.inc(1);
        if result.status != FileStatus::Success {
            tracing::debug!(path = %result.file_path.display(), status = %result.status, "file not checked");
        }
    }
}

fn print_outcome(outcome: &CheckOutcome, format: OutputFormat) -> Result<()> {
    let mut results: Vec<&FileResult> = outcome.results.iter().collect();
    results.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "checkId": outcome.check_id,
                "status": outcome.status,
                "results": results,
            });
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
        }
        OutputFormat::Text => {
            for result in &results {
                match result.status {
                    FileStatus::Success if result.findings.is_empty() => continue,
                    FileStatus::Success => {
                        println!(
                            "{} ({} error, {} warning, {} info)",
                            result.file_path.display(),
                            result.error_count,
                            result.warning_count,
                            result.info_count
                        );
                    }
                    _ => {
                        println!(
                            "{} [{}] {}",
                            result.file_path.display(),
                            result.status,
                            result.error_message.as_deref().unwrap_or("")
                        );
                    }
                }
                for f in &result.findings {
                    println!(
                        "  {}-{} [{}] {}: {}",
                        f.line_start, f.line_end, f.severity, f.rule_id, f.description
                    );
                    if !f.suggestion.is_empty() {
                        println!("      suggestion: {}", f.suggestion);
                    }
                }
                if result.failed_chunks > 0 {
                    println!(
                        "  ({} of {} chunks failed)",
                        result.failed_chunks, result.chunk_count
                    );
                }
            }
            println!(
                "\nCheck {}: {} ({} files: {} ok, {} skipped, {} failed, {} timed out; {} findings)",
                outcome.check_id,
                outcome.status,
                results.len(),
                outcome.count(FileStatus::Success),
                outcome.count(FileStatus::Skipped),
                outcome.count(FileStatus::Failed),
                outcome.count(FileStatus::Timeout),
                outcome.total_findings()
            );
            if outcome.status != concord_core::CheckStatus::Completed {
                println!("Resume with: concord resume {}", outcome.check_id);
            }
        }
    }
    Ok(())
}

fn print_states(states: &[CheckState], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(states).into_diagnostic()?);
        }
        OutputFormat::Text => {
            if states.is_empty() {
                println!("No checks found.");
            }
            for state in states {
                println!(
                    "{}  {:<11}  {}/{} files  started {}",
                    state.check_id,
                    state.status.to_string(),
                    state.completed_files.len(),
                    state.total_files.len(),
                    state.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

fn print_state(state: &CheckState, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(state).into_diagnostic()?);
        }
        OutputFormat::Text => {
            println!("Check:     {}", state.check_id);
            println!("Status:    {}", state.status);
            println!("Started:   {}", state.start_time.format("%Y-%m-%d %H:%M:%S"));
            println!("Updated:   {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
            println!(
                "Progress:  {}/{} files",
                state.completed_files.len(),
                state.total_files.len()
            );
            if !state.remaining_files.is_empty() {
                println!("Remaining:");
                for file in &state.remaining_files {
                    println!("  {}", file.display());
                }
            }
        }
    }
    Ok(())
}

fn exit_on_findings(outcome: &CheckOutcome, fail_on: Option<Severity>) {
    if let Some(threshold) = fail_on {
        if outcome.has_findings_at(threshold) {
            std::process::exit(1);
        }
    }
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

    match cli.command {
        Command::Init => {
            let path = Path::new(".concord.toml");
            if path.exists() {
                miette::bail!(".concord.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .concord.toml with default configuration");
        }
        Command::Status { check_id } => {
            let (config, _) = load_config(cli.config.as_deref())?;
            let store = ProgressStore::new(&config.progress.dir);
            match check_id {
                Some(id) => match store.load(&id).into_diagnostic()? {
                    Some(state) => print_state(&state, cli.format)?,
                    None => miette::bail!("no such check: {id}"),
                },
                None => print_states(&store.list().into_diagnostic()?, cli.format)?,
            }
        }
        Command::Check {
            paths,
            rules,
            repeat,
            consensus_ratio,
            max_workers,
            chunk_tokens,
            file_timeout,
            llm_timeout,
            include,
            fail_on,
        } => {
            let (mut config, base) = load_config(cli.config.as_deref())?;
            if let Some(rules) = rules {
                config.rules_file = Some(std::env::current_dir().into_diagnostic()?.join(rules));
            }
            let settings = &mut config.check;
            if let Some(v) = repeat {
                settings.repeat = v;
            }
            if let Some(v) = consensus_ratio {
                settings.consensus_ratio = v;
            }
            if let Some(v) = max_workers {
                settings.max_workers = v;
            }
            if let Some(v) = chunk_tokens {
                settings.chunk_token_limit = v;
            }
            if let Some(v) = file_timeout {
                settings.file_timeout_secs = v;
            }
            if let Some(v) = llm_timeout {
                settings.llm_timeout_secs = v;
            }
            config.check.validate().into_diagnostic()?;

            let files = collect_files(&paths, &include)?;
            if files.is_empty() {
                miette::bail!("no files to check");
            }

            let pb = progress_bar(files.len(), cli.verbose);
            let runner = build_runner(&config, &base, &pb)?;
            let check_id = runner
                .start(files, config.check.clone())
                .await
                .into_diagnostic()?;
            if pb.is_hidden() {
                eprintln!("Started check {check_id}");
            } else {
                pb.println(format!("Started check {check_id}"));
            }
            tracing::info!(check_id = %check_id, "check started");

            let outcome = runner
                .execute(&check_id, on_result(&pb))
                .await
                .into_diagnostic()?;
            pb.finish_and_clear();

            print_outcome(&outcome, cli.format)?;
            exit_on_findings(&outcome, fail_on);
        }
        Command::Resume { check_id, fail_on } => {
            let (config, base) = load_config(cli.config.as_deref())?;
            let store = ProgressStore::new(&config.progress.dir);
            let pending = store.pending_files(&check_id).into_diagnostic()?;

            let pb = progress_bar(pending.len(), cli.verbose);
            let runner = build_runner(&config, &base, &pb)?;
            let outcome = runner
                .resume(&check_id, on_result(&pb))
                .await
                .into_diagnostic()?;
            pb.finish_and_clear();

            print_outcome(&outcome, cli.format)?;
            exit_on_findings(&outcome, fail_on);
        }
    }

    Ok(())
}
