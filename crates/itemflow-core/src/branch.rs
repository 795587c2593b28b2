use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ItemflowConfig, Project};
use crate::git::{Git, GitError};

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_TRUNK: &str = "main";
const FALLBACK_TRUNK: &str = "master";

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Project remote, then the global remote, then `origin`.
pub fn resolve_remote_name(config: &ItemflowConfig, project: Option<&Project>) -> String {
    non_empty(project.and_then(|project| project.remote.as_deref()))
        .or_else(|| non_empty(config.remote()))
        .unwrap_or(DEFAULT_REMOTE)
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkSource {
    Flag,
    Project,
    Global,
    Detected,
    DryRunDefault,
}

/// Trunk branch with where it came from. Precedence: explicit flag, project
/// override, global config, then detection in `git`'s repository. In dry-run
/// detection is skipped and `main` is assumed.
pub fn determine_trunk_branch_with_source(
    config: &ItemflowConfig,
    project: Option<&Project>,
    flag: Option<&str>,
    git: &Git<'_>,
) -> Result<(String, TrunkSource), GitError> {
    if let Some(value) = non_empty(flag) {
        return Ok((value.to_string(), TrunkSource::Flag));
    }
    if let Some(value) = non_empty(project.and_then(|project| project.trunk_branch.as_deref())) {
        return Ok((value.to_string(), TrunkSource::Project));
    }
    if let Some(value) = non_empty(config.trunk_branch()) {
        return Ok((value.to_string(), TrunkSource::Global));
    }
    if git.is_dry_run() {
        return Ok((DEFAULT_TRUNK.to_string(), TrunkSource::DryRunDefault));
    }
    let detected = if git.local_branch_exists(DEFAULT_TRUNK)? {
        DEFAULT_TRUNK
    } else {
        FALLBACK_TRUNK
    };
    debug!(trunk = detected, repo = %git.repo_path().display(), "detected trunk branch");
    Ok((detected.to_string(), TrunkSource::Detected))
}

pub fn determine_trunk_branch(
    config: &ItemflowConfig,
    project: Option<&Project>,
    flag: Option<&str>,
    git: &Git<'_>,
) -> Result<String, GitError> {
    determine_trunk_branch_with_source(config, project, flag, git).map(|(trunk, _)| trunk)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    NotExists,
    PointsToTrunk,
    HasCommits,
}

/// Whether `branch` is absent, identical to trunk, or carries its own commits.
pub fn branch_state(git: &Git<'_>, branch: &str, trunk: &str) -> Result<BranchState, GitError> {
    if !git.local_branch_exists(branch)? {
        return Ok(BranchState::NotExists);
    }
    let range = format!("{trunk}..{branch}");
    let args = ["rev-list", "--count", range.as_str()];
    let ahead = git.read(&args)?;
    let ahead: u64 = ahead
        .trim()
        .parse()
        .map_err(|_| GitError::UnexpectedOutput {
            args: args.join(" "),
            output: ahead.clone(),
        })?;
    if ahead == 0 {
        Ok(BranchState::PointsToTrunk)
    } else {
        Ok(BranchState::HasCommits)
    }
}

/// Deletes a local branch. A branch that is already gone is not an error;
/// returns whether anything was deleted.
pub fn delete_local_branch(git: &Git<'_>, branch: &str) -> Result<bool, GitError> {
    if !git.local_branch_exists(branch)? {
        debug!(branch, "local branch already absent");
        return Ok(false);
    }
    info!(branch, "deleting local branch");
    git.mutate(&["branch", "-D", branch])?;
    Ok(true)
}

pub fn checkout(git: &Git<'_>, branch: &str) -> Result<(), GitError> {
    info!(branch, repo = %git.repo_path().display(), "checkout");
    git.mutate(&["checkout", branch])?;
    Ok(())
}

pub fn pull_trunk(git: &Git<'_>, remote: &str, trunk: &str) -> Result<(), GitError> {
    info!(remote, trunk, "pulling trunk");
    git.network(&["pull", remote, trunk])?;
    Ok(())
}
