use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::behavior::resolve_project_path;
use crate::branch::{
    delete_local_branch, determine_trunk_branch, resolve_remote_name, DEFAULT_TRUNK,
};
use crate::config::ItemflowConfig;
use crate::git::{Git, GitError};
use crate::worktree::{
    create_worktree, is_external_git_repo, remove_worktree, GitDirKind, WorktreeError,
};

#[derive(Debug, Error)]
pub enum PolyrepoError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error("project {name}: path {path} does not exist")]
    MissingProject { name: String, path: PathBuf },
    #[error("project {name}: {path} is not a git repository")]
    NotARepository { name: String, path: PathBuf },
    #[error("project checkout {path} is on {found}, not {branch}; pass --override to replace it")]
    CheckoutConflict {
        path: PathBuf,
        branch: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedProject {
    pub name: String,
    pub path: Option<PathBuf>,
    pub mount: String,
    /// Declared shared repository root, resolved.
    pub repo_root: Option<PathBuf>,
    pub trunk: String,
    pub remote: String,
    pub setup: Vec<String>,
}

impl ResolvedProject {
    /// The git repository this project lives in.
    pub fn repository(&self) -> Option<&Path> {
        self.repo_root.as_deref().or(self.path.as_deref())
    }
}

/// Resolves every declared project against the primary checkout. `None` when
/// no projects are configured.
pub fn resolve_polyrepo_projects(
    config: &ItemflowConfig,
    primary_root: &Path,
    git: &Git<'_>,
) -> Result<Option<Vec<ResolvedProject>>, PolyrepoError> {
    let projects = config.projects();
    if projects.is_empty() {
        return Ok(None);
    }
    let mut resolved = Vec::with_capacity(projects.len());
    for project in projects {
        let path = project
            .path
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(|value| resolve_project_path(primary_root, value));
        let repo_root = project
            .repo_root
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(|value| resolve_project_path(primary_root, value));
        let repository = repo_root.clone().or_else(|| path.clone());
        let trunk = match repository.as_deref() {
            Some(dir) if dir.is_dir() => {
                determine_trunk_branch(config, Some(project), None, &git.at(dir))?
            }
            // Nothing to inspect yet; configured values or the default.
            _ => project
                .trunk_branch
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .or(config.trunk_branch())
                .unwrap_or(DEFAULT_TRUNK)
                .to_string(),
        };
        resolved.push(ResolvedProject {
            name: project.name.clone(),
            path,
            mount: project.mount_name().to_string(),
            repo_root,
            trunk,
            remote: resolve_remote_name(config, Some(project)),
            setup: project.setup.clone(),
        });
    }
    Ok(Some(resolved))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoGroup {
    pub root: PathBuf,
    pub projects: Vec<ResolvedProject>,
}

impl RepoGroup {
    /// Mount of the first project; the whole group is checked out there.
    pub fn mount(&self) -> &str {
        self.projects
            .first()
            .map(|project| project.mount.as_str())
            .unwrap_or_default()
    }

    pub fn trunk(&self) -> &str {
        self.projects
            .first()
            .map(|project| project.trunk.as_str())
            .unwrap_or(DEFAULT_TRUNK)
    }
}

/// Groups projects by shared repository root (or their own path), in order of
/// first appearance. Projects with neither are logical and left out.
pub fn group_projects_by_repo_root(projects: &[ResolvedProject]) -> Vec<RepoGroup> {
    let mut groups: Vec<RepoGroup> = Vec::new();
    for project in projects {
        let Some(root) = project.repository() else {
            continue;
        };
        match groups.iter_mut().find(|group| group.root == root) {
            Some(group) => group.projects.push(project.clone()),
            None => groups.push(RepoGroup {
                root: root.to_path_buf(),
                projects: vec![project.clone()],
            }),
        }
    }
    groups
}

/// Directory in which `project`'s setup should run, or `None` when a project
/// sharing its repository root was already handled.
pub fn get_project_setup_path(
    project: &ResolvedProject,
    processed: &mut HashSet<PathBuf>,
) -> Option<PathBuf> {
    match &project.repo_root {
        Some(root) => {
            if processed.insert(root.clone()) {
                Some(root.clone())
            } else {
                None
            }
        }
        None => project.path.clone(),
    }
}

/// Every project with a path must exist and live in a git repository. Dry-run
/// never touches the filesystem.
pub fn validate_polyrepo_projects(
    projects: &[ResolvedProject],
    dry_run: bool,
) -> Result<(), PolyrepoError> {
    if dry_run {
        return Ok(());
    }
    for project in projects {
        let Some(path) = project.path.as_deref() else {
            continue;
        };
        if !path.exists() {
            return Err(PolyrepoError::MissingProject {
                name: project.name.clone(),
                path: path.to_path_buf(),
            });
        }
        let repository = project.repository().unwrap_or(path);
        if is_external_git_repo(repository) == GitDirKind::Missing {
            return Err(PolyrepoError::NotARepository {
                name: project.name.clone(),
                path: repository.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolyrepoCheckout {
    pub repository: PathBuf,
    pub path: PathBuf,
    pub projects: Vec<String>,
    pub created: bool,
}

/// Returns whether `target` is already a linked checkout of `branch`. A
/// checkout of any other branch is a conflict.
fn existing_project_checkout(
    git: &Git<'_>,
    target: &Path,
    branch: &str,
) -> Result<bool, PolyrepoError> {
    if is_external_git_repo(target) != GitDirKind::WorktreeLink {
        return Ok(false);
    }
    match git.at(target).current_branch()? {
        Some(current) if current == branch => Ok(true),
        other => Err(PolyrepoError::CheckoutConflict {
            path: target.to_path_buf(),
            branch: branch.to_string(),
            found: other.unwrap_or_else(|| "a detached HEAD".to_string()),
        }),
    }
}

/// Checks each repository group out at `<worktree>/<mount>` on `branch`,
/// creating the branch from the group's trunk when it does not exist yet.
/// Checkouts left by an earlier run on the same branch are reused.
pub fn checkout_polyrepo_projects(
    git: &Git<'_>,
    projects: &[ResolvedProject],
    worktree: &Path,
    branch: &str,
) -> Result<Vec<PolyrepoCheckout>, PolyrepoError> {
    let mut checkouts = Vec::new();
    for group in group_projects_by_repo_root(projects) {
        let target = worktree.join(group.mount());
        let names = group.projects.iter().map(|p| p.name.clone()).collect();
        if existing_project_checkout(git, &target, branch)? {
            debug!(path = %target.display(), "project checkout already present");
            checkouts.push(PolyrepoCheckout {
                repository: group.root.clone(),
                path: target,
                projects: names,
                created: false,
            });
            continue;
        }
        let repo = git.at(&group.root);
        if group.root.is_dir() {
            // A replaced parent worktree leaves stale registrations behind.
            let prune = repo.mutate_raw(&["worktree", "prune"])?;
            if !prune.success() {
                warn!(detail = %prune.detail(), "git worktree prune failed");
            }
        }
        let branch_exists = group.root.is_dir() && repo.local_branch_exists(branch)?;
        info!(repository = %group.root.display(), path = %target.display(), "checking out project");
        if branch_exists {
            create_worktree(&repo, &target, branch, None)?;
        } else {
            create_worktree(&repo, &target, branch, Some(group.trunk()))?;
        }
        checkouts.push(PolyrepoCheckout {
            repository: group.root,
            path: target,
            projects: names,
            created: true,
        });
    }
    Ok(checkouts)
}

/// Best-effort teardown of project checkouts and their local branches.
/// Failures are logged; the removed paths are returned.
pub fn remove_polyrepo_checkouts(
    git: &Git<'_>,
    projects: &[ResolvedProject],
    worktree: &Path,
    branch: &str,
) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for group in group_projects_by_repo_root(projects) {
        let target = worktree.join(group.mount());
        let repo = git.at(&group.root);
        match remove_worktree(&repo, &target) {
            Ok(true) => removed.push(target),
            Ok(false) => {}
            Err(err) => warn!(path = %target.display(), %err, "failed to remove project checkout"),
        }
        if !group.root.is_dir() {
            continue;
        }
        if let Err(err) = delete_local_branch(&repo, branch) {
            warn!(repository = %group.root.display(), %err, "failed to delete project branch");
        }
    }
    removed
}
