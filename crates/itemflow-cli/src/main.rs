use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use itemflow_core::config::{load_effective_config, ItemflowConfig, DEFAULT_ID_WIDTH};
use itemflow_core::done::{run_done, DoneOptions, DoneOutcome, DoneReport};
use itemflow_core::github::GitHubClient;
use itemflow_core::item::normalize_item_id;
use itemflow_core::pr::{PrError, PullRequestProvider};
use itemflow_core::runner::ProcessRunner;
use itemflow_core::start::{discover_repo_root, run_start, StartOptions, StartReport};
use itemflow_core::FlowError;

#[derive(Parser)]
#[command(
    name = "itemflow",
    version,
    about = "Start and finish work items on their own branch and worktree"
)]
struct Cli {
    /// Directory inside the repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Log at debug level unless ITEMFLOW_LOG or RUST_LOG say otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the branch and worktree for a work item and mark it in progress
    Start {
        /// Work item id, e.g. 14, 014 or #14
        item: String,
        #[arg(long)]
        dry_run: bool,
        /// Replace an existing worktree at the target path
        #[arg(long = "override")]
        override_worktree: bool,
        #[arg(long)]
        skip_status_check: bool,
        /// Continue on an existing branch that already has commits
        #[arg(long)]
        reuse_branch: bool,
        #[arg(long)]
        no_ide: bool,
        #[arg(long)]
        trunk: Option<String>,
        /// none, commit_only, commit_only_branch or commit_and_push
        #[arg(long)]
        status_action: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Merge the work item's pull request, clean up and archive the item
    Done {
        item: String,
        #[arg(long)]
        dry_run: bool,
        /// merge, squash or rebase
        #[arg(long)]
        strategy: Option<String>,
        /// Merge even when checks or review comments would block it
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_cleanup: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print version information
    Version,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = std::env::var("ITEMFLOW_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Runner for the repository containing `cwd`, carrying the configured git
/// environment. Malformed ids are rejected before git is consulted.
fn runner_for(cwd: &Path, item: &str, dry_run: bool) -> Result<ProcessRunner> {
    normalize_item_id(item, DEFAULT_ID_WIDTH).map_err(FlowError::from)?;
    let discovery = ProcessRunner::new(false);
    let repo_root = discover_repo_root(&discovery, cwd)?;
    let config = load_effective_config(&repo_root).map_err(FlowError::from)?;
    tracing::debug!(repo_root = %repo_root.display(), dry_run, "resolved repository");
    Ok(ProcessRunner::new(dry_run).with_env(&config.git_env()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize report")?
    );
    Ok(())
}

fn print_start(report: &StartReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    println!(
        "{prefix}{} {}: branch {} in {}",
        report.id,
        report.title,
        report.branch,
        report.worktree.display()
    );
    println!("  trunk: {}/{}", report.remote, report.trunk);
    for checkout in &report.projects {
        println!(
            "  {}: {} ({})",
            checkout.projects.join(", "),
            checkout.path.display(),
            checkout.repository.display()
        );
    }
    if report.status.skipped {
        println!("  status: {} (unchanged)", report.status.from);
    } else {
        println!("  status: {} -> {}", report.status.from, report.status.to);
    }
    if !report.setup.is_empty() {
        println!("  setup: {} command(s)", report.setup.len());
    }
}

fn print_done(report: &DoneReport) {
    let pr = report
        .pull_request
        .as_ref()
        .map(|pr| format!(" (#{})", pr.number))
        .unwrap_or_default();
    let headline = match report.outcome {
        DoneOutcome::Merged => "merged",
        DoneOutcome::AlreadyMerged => "already merged",
        DoneOutcome::AlreadyComplete => "already complete",
        DoneOutcome::Preview => "ready to merge",
    };
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    println!("{prefix}{} {}: {headline}{pr}", report.id, report.title);
    if let Some(checks) = &report.checks {
        for overridden in &checks.overridden {
            println!("  forced past: {overridden}");
        }
    }
    if !report.cleanup.skipped {
        for path in &report.cleanup.worktrees_removed {
            println!("  removed {}", path.display());
        }
    }
    if report.outcome != DoneOutcome::Preview {
        println!("  item: {}", report.item_path.display());
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
}

fn connect_github(
    config: &ItemflowConfig,
    dry_run: bool,
) -> Result<Box<dyn PullRequestProvider>, PrError> {
    Ok(Box::new(GitHubClient::from_config(config, dry_run)?))
}

fn run(cli: Cli) -> Result<()> {
    let cwd = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Some(Command::Start {
            item,
            dry_run,
            override_worktree,
            skip_status_check,
            reuse_branch,
            no_ide,
            trunk,
            status_action,
            json,
        }) => {
            let runner = runner_for(&cwd, &item, dry_run)?;
            let options = StartOptions {
                item,
                dry_run,
                override_worktree,
                skip_status_check,
                reuse_branch,
                no_ide,
                trunk,
                status_action,
            };
            let report = run_start(&runner, &cwd, options)?;
            if json {
                print_json(&report)?;
            } else {
                print_start(&report);
            }
        }
        Some(Command::Done {
            item,
            dry_run,
            strategy,
            force,
            skip_cleanup,
            json,
        }) => {
            let runner = runner_for(&cwd, &item, dry_run)?;
            let options = DoneOptions {
                item,
                dry_run,
                strategy,
                force,
                skip_cleanup,
            };
            let report = run_done(&runner, &cwd, options, connect_github)?;
            if json {
                print_json(&report)?;
            } else {
                print_done(&report);
            }
        }
        Some(Command::Version) => {
            println!("itemflow {}", itemflow_core::version());
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<FlowError>()
                .map(FlowError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}
