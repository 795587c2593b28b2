//! Workspace provisioning: branch, worktree, sibling checkouts, status move,
//! setup and IDE for one work item.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::behavior::{resolve_workspace_behavior, WorkspaceBehavior};
use crate::branch::{branch_state, determine_trunk_branch, resolve_remote_name, BranchState};
use crate::config::{load_effective_config, ItemflowConfig, DEFAULT_ID_WIDTH};
use crate::error::FlowError;
use crate::git::Git;
use crate::item::{find_work_item, items_root, normalize_item_id, WorkItem};
use crate::polyrepo::{
    checkout_polyrepo_projects, resolve_polyrepo_projects, validate_polyrepo_projects,
    PolyrepoCheckout,
};
use crate::runner::CommandRunner;
use crate::setup::{launch_ide, plan_setup, run_setup, SetupStep};
use crate::status::{
    build_status_commit_message, commit_status_change, get_effective_status_action,
    move_work_item_without_commit, perform_status_check, CommitOutcome, StatusAction,
};
use crate::worktree::{
    check_worktree_exists, create_worktree, handle_existing_worktree, resolve_worktree_root,
    WorktreeState,
};

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub item: String,
    pub dry_run: bool,
    /// Replace whatever already sits at the worktree path.
    pub override_worktree: bool,
    pub skip_status_check: bool,
    /// Reuse a branch that already has commits, or a worktree already bound to the item.
    pub reuse_branch: bool,
    pub no_ide: bool,
    pub trunk: Option<String>,
    pub status_action: Option<String>,
}

/// Everything resolved for one start invocation.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub repo_root: PathBuf,
    pub config: ItemflowConfig,
    pub item: WorkItem,
    pub title_slug: String,
    pub branch: String,
    pub behavior: WorkspaceBehavior,
    pub worktree_root: PathBuf,
    pub worktree_path: PathBuf,
    pub trunk: String,
    pub remote: String,
    pub status_action: StatusAction,
    pub options: StartOptions,
    /// Set when the item already sits in the start status.
    pub skip_status_update: bool,
}

impl StartContext {
    pub fn items_root(&self) -> PathBuf {
        items_root(&self.repo_root, &self.config)
    }

    pub fn target_status(&self) -> &str {
        self.config.start_status()
    }

    pub fn perform_status_check(&mut self) -> Result<(), FlowError> {
        if self.status_action == StatusAction::None {
            return Ok(());
        }
        self.skip_status_update = perform_status_check(
            &self.item,
            self.config.start_status(),
            self.options.skip_status_check,
        )?;
        Ok(())
    }

    pub fn build_status_commit_message(&self) -> String {
        build_status_commit_message(
            self.config.commit_template(),
            &self.item,
            self.target_status(),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub from: String,
    pub to: String,
    pub skipped: bool,
    pub path: Option<PathBuf>,
    pub commit: Option<CommitOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub id: String,
    pub title: String,
    pub branch: String,
    pub worktree: PathBuf,
    pub trunk: String,
    pub remote: String,
    pub behavior: WorkspaceBehavior,
    pub dry_run: bool,
    pub worktree_state: WorktreeState,
    pub branch_state: BranchState,
    pub worktree_created: bool,
    pub projects: Vec<PolyrepoCheckout>,
    pub status: StatusReport,
    pub setup: Vec<SetupStep>,
    pub ide_launched: bool,
}

/// Top level of the git checkout containing `cwd`.
pub fn discover_repo_root(runner: &dyn CommandRunner, cwd: &Path) -> Result<PathBuf, FlowError> {
    Git::new(runner, cwd).show_toplevel().map_err(|err| {
        FlowError::Precondition(format!(
            "{} is not inside a git repository ({err}); run from a checkout or pass --root",
            cwd.display()
        ))
    })
}

/// Resolves the item and workspace and runs the pre-mutation checks.
pub fn prepare_start(
    runner: &dyn CommandRunner,
    cwd: &Path,
    options: StartOptions,
) -> Result<StartContext, FlowError> {
    normalize_item_id(&options.item, DEFAULT_ID_WIDTH)?;
    let repo_root = discover_repo_root(runner, cwd)?;
    let config = load_effective_config(&repo_root)?;
    let git = Git::new(runner, &repo_root);

    let item = find_work_item(&items_root(&repo_root, &config), &config, &options.item)?;
    let status_action = get_effective_status_action(options.status_action.as_deref(), &config)?;
    let behavior = resolve_workspace_behavior(config.workspace.as_ref(), &repo_root);
    let trunk = determine_trunk_branch(&config, None, options.trunk.as_deref(), &git)?;
    let remote = resolve_remote_name(&config, None);
    let worktree_root = resolve_worktree_root(&git, &config, &repo_root)?;
    let branch = item.branch_name();
    let worktree_path = worktree_root.join(&branch);

    let mut ctx = StartContext {
        title_slug: item.slug(),
        repo_root,
        config,
        item,
        branch,
        behavior,
        worktree_root,
        worktree_path,
        trunk,
        remote,
        status_action,
        options,
        skip_status_update: false,
    };
    ctx.perform_status_check()?;
    Ok(ctx)
}

pub fn run_start(
    runner: &dyn CommandRunner,
    cwd: &Path,
    options: StartOptions,
) -> Result<StartReport, FlowError> {
    let ctx = prepare_start(runner, cwd, options)?;
    let git = Git::new(runner, &ctx.repo_root);
    let dry_run = ctx.options.dry_run;
    info!(
        id = %ctx.item.id,
        branch = %ctx.branch,
        worktree = %ctx.worktree_path.display(),
        behavior = %ctx.behavior,
        "starting work item"
    );

    let mut worktree_state = check_worktree_exists(&ctx.worktree_path, &ctx.item.id);
    let reuse_worktree =
        worktree_state == WorktreeState::ValidSameItem && ctx.options.reuse_branch;
    if !reuse_worktree {
        worktree_state = handle_existing_worktree(
            &git,
            &ctx.worktree_path,
            &ctx.item.id,
            ctx.options.override_worktree,
        )?;
    }

    let state = branch_state(&git, &ctx.branch, &ctx.trunk)?;
    let mut worktree_created = false;
    if !reuse_worktree {
        match state {
            BranchState::NotExists => {
                create_worktree(&git, &ctx.worktree_path, &ctx.branch, Some(&ctx.trunk))?
            }
            BranchState::PointsToTrunk => {
                create_worktree(&git, &ctx.worktree_path, &ctx.branch, None)?
            }
            BranchState::HasCommits if ctx.options.reuse_branch => {
                create_worktree(&git, &ctx.worktree_path, &ctx.branch, None)?
            }
            BranchState::HasCommits => {
                return Err(FlowError::Precondition(format!(
                    "branch {} already has commits not on {}; pass --reuse-branch to continue on it",
                    ctx.branch, ctx.trunk
                )))
            }
        }
        worktree_created = !dry_run;
    }

    let mut projects = Vec::new();
    let mut checkouts = Vec::new();
    if ctx.behavior == WorkspaceBehavior::Polyrepo {
        projects = resolve_polyrepo_projects(&ctx.config, &ctx.repo_root, &git)?.unwrap_or_default();
        validate_polyrepo_projects(&projects, dry_run)?;
        checkouts = checkout_polyrepo_projects(
            &git,
            &projects,
            &ctx.worktree_path,
            &ctx.branch,
        )?;
    }

    let status = transition_status(&ctx, &git)?;

    let steps = plan_setup(
        &ctx.config,
        ctx.behavior,
        &ctx.worktree_path,
        Some(projects.as_slice()),
    );
    run_setup(runner, &steps, ctx.config.setup_timeout())?;

    let mut ide_launched = false;
    match ctx.config.ide_command() {
        Some(command) if !ctx.options.no_ide => {
            match launch_ide(runner, command, &ctx.worktree_path) {
                Ok(()) => ide_launched = true,
                Err(err) => warn!(%err, "failed to launch IDE"),
            }
        }
        _ => {}
    }

    Ok(StartReport {
        id: ctx.item.id.clone(),
        title: ctx.item.title.clone(),
        branch: ctx.branch.clone(),
        worktree: ctx.worktree_path.clone(),
        trunk: ctx.trunk.clone(),
        remote: ctx.remote.clone(),
        behavior: ctx.behavior,
        dry_run,
        worktree_state,
        branch_state: state,
        worktree_created,
        projects: checkouts,
        status,
        setup: steps,
        ide_launched,
    })
}

/// Moves the item to the start status. The move is made in the new worktree
/// when the item file is present there, so it lands on the feature branch;
/// otherwise in the primary checkout.
fn transition_status(ctx: &StartContext, git: &Git<'_>) -> Result<StatusReport, FlowError> {
    let target = ctx.target_status().to_string();
    let mut report = StatusReport {
        from: ctx.item.status.clone(),
        to: target.clone(),
        skipped: true,
        path: None,
        commit: None,
    };
    if ctx.status_action == StatusAction::None || ctx.skip_status_update {
        return Ok(report);
    }

    let in_worktree = ctx
        .item
        .file_path
        .strip_prefix(&ctx.repo_root)
        .map(|relative| ctx.worktree_path.join(relative).is_file())
        .unwrap_or(false);
    let (checkout_root, checkout_branch) = if in_worktree {
        (ctx.worktree_path.clone(), ctx.branch.clone())
    } else {
        let current = git.current_branch()?.unwrap_or_else(|| ctx.trunk.clone());
        (ctx.repo_root.clone(), current)
    };
    let checkout_git = git.at(&checkout_root);
    let (checkout_items, item) = if in_worktree {
        let root = items_root(&checkout_root, &ctx.config);
        let item = find_work_item(&root, &ctx.config, &ctx.item.id)?;
        (root, item)
    } else {
        (ctx.items_root(), ctx.item.clone())
    };

    let dest = move_work_item_without_commit(
        &item,
        &checkout_items,
        &target,
        &ctx.config,
        &[],
        ctx.options.dry_run,
    )?;
    let commit = commit_status_change(
        &checkout_git,
        &ctx.config,
        ctx.status_action,
        &ctx.build_status_commit_message(),
        &checkout_branch,
        &ctx.trunk,
        &ctx.remote,
    )?;
    report.skipped = false;
    report.path = Some(dest);
    report.commit = Some(commit);
    Ok(report)
}
