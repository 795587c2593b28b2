//! Workspace completion: merge the item's pull request, tear down its branch
//! and worktree, and archive the item with its merge record.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::behavior::{resolve_workspace_behavior, WorkspaceBehavior};
use crate::branch::{
    checkout, delete_local_branch, determine_trunk_branch, pull_trunk, resolve_remote_name,
};
use crate::config::{load_effective_config, ItemflowConfig, DEFAULT_ID_WIDTH};
use crate::error::FlowError;
use crate::git::Git;
use crate::item::{
    find_work_item, items_root, locate_work_items, normalize_item_id, now_rfc3339, MergeRecord,
    WorkItem,
};
use crate::polyrepo::{remove_polyrepo_checkouts, resolve_polyrepo_projects};
use crate::pr::{
    build_done_commit_message, delete_branch, merge_pull_request, parse_remote_url,
    run_pr_checks, update_work_item_done_metadata, MergeStrategy, PrCheckOptions, PrCheckReport,
    PrError, PullRequest, PullRequestProvider, RepoSlug,
};
use crate::runner::CommandRunner;
use crate::start::discover_repo_root;
use crate::status::move_work_item_without_commit;
use crate::worktree::{
    check_worktree_exists, remove_worktree, resolve_worktree_root, WorktreeState,
};

#[derive(Debug, Clone, Default)]
pub struct DoneOptions {
    pub item: String,
    pub dry_run: bool,
    pub strategy: Option<String>,
    /// Merge even when readiness checks fail.
    pub force: bool,
    pub skip_cleanup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneOutcome {
    /// The pull request was merged by this invocation.
    Merged,
    /// The pull request had already been merged; cleanup and archival ran (or,
    /// in dry-run, nothing did).
    AlreadyMerged,
    /// The item already carries a merge record.
    AlreadyComplete,
    /// Dry-run: checks evaluated, nothing merged.
    Preview,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub skipped: bool,
    pub worktrees_removed: Vec<PathBuf>,
    pub remote_branch_deleted: Option<bool>,
    pub local_branch_deleted: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoneReport {
    pub id: String,
    pub title: String,
    pub branch: String,
    pub outcome: DoneOutcome,
    pub dry_run: bool,
    pub pull_request: Option<PullRequest>,
    pub checks: Option<PrCheckReport>,
    pub merge: Option<MergeRecord>,
    pub cleanup: CleanupReport,
    pub item_path: PathBuf,
    /// Best-effort steps that failed without failing the command.
    pub warnings: Vec<String>,
}

impl DoneReport {
    fn new(item: &WorkItem, outcome: DoneOutcome, dry_run: bool) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            branch: item.branch_name(),
            outcome,
            dry_run,
            pull_request: None,
            checks: None,
            merge: item.merge.clone(),
            cleanup: CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            },
            item_path: item.file_path.clone(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Owner/repo from `[github]`, else parsed from the remote's URL.
pub fn resolve_repo_slug(
    git: &Git<'_>,
    config: &ItemflowConfig,
    remote: &str,
) -> Result<RepoSlug, FlowError> {
    if let (Some(owner), Some(repo)) = (
        config.github.owner.as_deref(),
        config.github.repo.as_deref(),
    ) {
        if !owner.trim().is_empty() && !repo.trim().is_empty() {
            return Ok(RepoSlug {
                owner: owner.trim().to_string(),
                repo: repo.trim().to_string(),
            });
        }
    }
    let url = git.remote_url(remote)?;
    parse_remote_url(&url).ok_or_else(|| PrError::UnknownRepository(url).into())
}

/// Completes the work item. `connect` builds the PR host client once the
/// configuration is known; it is not called when the item is already complete.
pub fn run_done<'p, F>(
    runner: &dyn CommandRunner,
    cwd: &Path,
    options: DoneOptions,
    connect: F,
) -> Result<DoneReport, FlowError>
where
    F: FnOnce(&ItemflowConfig, bool) -> Result<Box<dyn PullRequestProvider + 'p>, PrError>,
{
    normalize_item_id(&options.item, DEFAULT_ID_WIDTH)?;
    let repo_root = discover_repo_root(runner, cwd)?;
    let config = load_effective_config(&repo_root)?;
    let git = Git::new(runner, &repo_root);
    let dry_run = options.dry_run;
    let strategy: MergeStrategy = options
        .strategy
        .as_deref()
        .unwrap_or(config.merge_strategy())
        .parse()?;

    let item_root = items_root(&repo_root, &config);
    let item = find_work_item(&item_root, &config, &options.item)?;
    if item.is_merged() {
        info!(id = %item.id, "work item already carries a merge record");
        return Ok(DoneReport::new(&item, DoneOutcome::AlreadyComplete, dry_run));
    }

    let remote = resolve_remote_name(&config, None);
    let slug = resolve_repo_slug(&git, &config, &remote)?;
    let provider = connect(&config, dry_run)?;
    let branch = item.branch_name();
    let pr = provider
        .find_pull_request(&slug, &branch)?
        .ok_or_else(|| FlowError::NoPullRequest {
            branch: branch.clone(),
        })?;

    let mut report = DoneReport::new(&item, DoneOutcome::Merged, dry_run);
    let record = match pr.merged_at.clone() {
        Some(merged_at) => {
            info!(number = pr.number, %merged_at, "pull request already merged");
            report.outcome = DoneOutcome::AlreadyMerged;
            if dry_run {
                report.pull_request = Some(pr);
                return Ok(report);
            }
            MergeRecord {
                merged_at,
                merge_commit_sha: pr.merge_commit_sha.clone().unwrap_or_default(),
                pr_number: pr.number,
                merge_strategy: strategy.as_str().to_string(),
            }
        }
        None => {
            let check_options = PrCheckOptions {
                require_checks: config.require_checks(),
                require_no_comments: config.require_no_comments(),
                force: options.force,
            };
            let checks = run_pr_checks(provider.as_ref(), &slug, &pr, &check_options)?;
            report.checks = Some(checks);
            if dry_run {
                eprintln!(
                    "[dry-run] merge pull request #{} for {} using {}",
                    pr.number, branch, strategy
                );
                report.outcome = DoneOutcome::Preview;
                report.pull_request = Some(pr);
                return Ok(report);
            }
            let message =
                build_done_commit_message(config.done_commit_template(), &item.id, &item.title);
            let outcome =
                merge_pull_request(provider.as_ref(), &slug, Some(&pr), strategy, &message)?;
            MergeRecord {
                merged_at: now_rfc3339(),
                merge_commit_sha: outcome.sha.unwrap_or_default(),
                pr_number: pr.number,
                merge_strategy: strategy.as_str().to_string(),
            }
        }
    };
    report.pull_request = Some(pr);

    let trunk = determine_trunk_branch(&config, None, None, &git)?;
    if !options.skip_cleanup {
        report.cleanup = cleanup(
            &git,
            &config,
            &repo_root,
            &item,
            provider.as_ref(),
            &slug,
            &trunk,
            &mut report.warnings,
        )?;
    }

    // Trunk is updated before archiving: the pull may bring the feature
    // branch's copy of the item, which has to end up in the done folder too.
    match git.current_branch() {
        Ok(Some(current)) if current == trunk => {}
        _ => {
            if let Err(err) = checkout(&git, &trunk) {
                report.warn(format!("could not check out {trunk}: {err}"));
            }
        }
    }
    if let Err(err) = pull_trunk(&git, &remote, &trunk) {
        report.warn(format!("could not pull {trunk} from {remote}: {err}"));
    }

    let current = match find_work_item(&item_root, &config, &item.id) {
        Ok(found) => found,
        Err(err) => {
            report.warn(format!("could not re-read work item {}: {err}", item.id));
            item.clone()
        }
    };
    if let Some(existing) = current.merge.clone() {
        info!(id = %current.id, "merge record already written");
        report.item_path = current.file_path.clone();
        report.merge = Some(existing);
        remove_stale_copies(&config, &item_root, &current.id, &current.file_path, &mut report);
        return Ok(report);
    }
    report.item_path = archive(&config, &item_root, &current, &record, &mut report)?;
    report.merge = Some(record);
    Ok(report)
}

/// Removes worktrees, then the remote branch, then the local branch. Only a
/// failed remote deletion is fatal.
#[allow(clippy::too_many_arguments)]
fn cleanup(
    git: &Git<'_>,
    config: &ItemflowConfig,
    repo_root: &Path,
    item: &WorkItem,
    provider: &dyn PullRequestProvider,
    slug: &RepoSlug,
    trunk: &str,
    warnings: &mut Vec<String>,
) -> Result<CleanupReport, FlowError> {
    let mut report = CleanupReport::default();
    let branch = item.branch_name();
    let mut note = |message: String| {
        warn!("{message}");
        warnings.push(message);
    };

    match resolve_worktree_root(git, config, repo_root) {
        Ok(root) => {
            let path = root.join(&branch);
            if resolve_workspace_behavior(config.workspace.as_ref(), repo_root)
                == WorkspaceBehavior::Polyrepo
            {
                match resolve_polyrepo_projects(config, repo_root, git) {
                    Ok(projects) => report.worktrees_removed.extend(remove_polyrepo_checkouts(
                        git,
                        &projects.unwrap_or_default(),
                        &path,
                        &branch,
                    )),
                    Err(err) => note(format!("could not resolve projects: {err}")),
                }
            }
            match check_worktree_exists(&path, &item.id) {
                WorktreeState::ValidSameItem => match remove_worktree(git, &path) {
                    Ok(true) => report.worktrees_removed.push(path),
                    Ok(false) => {}
                    Err(err) => note(format!("could not remove worktree {}: {err}", path.display())),
                },
                WorktreeState::NotExists => {}
                other => note(format!(
                    "left {} in place: {:?} is not this item's worktree",
                    path.display(),
                    other
                )),
            }
        }
        Err(err) => note(format!("could not resolve worktree root: {err}")),
    }

    report.remote_branch_deleted = Some(delete_branch(provider, slug, &branch)?);

    if let Ok(Some(current)) = git.current_branch() {
        if current == branch {
            if let Err(err) = checkout(git, trunk) {
                note(format!("could not leave {branch}: {err}"));
            }
        }
    }
    match delete_local_branch(git, &branch) {
        Ok(deleted) => report.local_branch_deleted = Some(deleted),
        Err(err) => note(format!("could not delete local branch {branch}: {err}")),
    }
    Ok(report)
}

/// Moves the item into the done status with the merge record, then drops
/// stale copies left in other folders.
fn archive(
    config: &ItemflowConfig,
    item_root: &Path,
    item: &WorkItem,
    record: &MergeRecord,
    report: &mut DoneReport,
) -> Result<PathBuf, FlowError> {
    let done_status = config.done_status();
    let dest = if item.status.eq_ignore_ascii_case(done_status) {
        update_work_item_done_metadata(&item.file_path, record)?;
        item.file_path.clone()
    } else {
        move_work_item_without_commit(
            item,
            item_root,
            done_status,
            config,
            &record.fields(),
            false,
        )?
    };
    info!(id = %item.id, path = %dest.display(), "archived work item");

    remove_stale_copies(config, item_root, &item.id, &dest, report);
    Ok(dest)
}

/// Best-effort removal of copies of `id` outside `keep`.
fn remove_stale_copies(
    config: &ItemflowConfig,
    item_root: &Path,
    id: &str,
    keep: &Path,
    report: &mut DoneReport,
) {
    let copies = match locate_work_items(item_root, config, id) {
        Ok(copies) => copies,
        Err(err) => {
            report.warn(format!("could not scan for stale copies of {id}: {err}"));
            return;
        }
    };
    for stale in copies {
        if stale.file_path == keep {
            continue;
        }
        if let Err(err) = fs::remove_file(&stale.file_path) {
            report.warn(format!(
                "could not remove stale copy {}: {err}",
                stale.file_path.display()
            ));
        }
    }
}
