use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ItemflowConfig;
use crate::git::{Git, GitError};
use crate::item::{update_item_fields, ItemError, WorkItem, KEY_STATUS};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("unknown status {status:?}; configured statuses: {known}")]
    UnknownStatus { status: String, known: String },
    #[error("work item {id} is already in status {status}; pass --skip-status-check to continue anyway")]
    AlreadyInStatus { id: String, status: String },
    #[error("unknown status action {0:?} (expected none, commit_only, commit_only_branch or commit_and_push)")]
    InvalidAction(String),
    #[error("cannot move work item: {path} already exists")]
    DestinationExists { path: PathBuf },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    /// Leave the work item alone.
    None,
    CommitOnly,
    /// Commit only while the checkout is on a non-trunk branch.
    CommitOnlyBranch,
    CommitAndPush,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::None => "none",
            StatusAction::CommitOnly => "commit_only",
            StatusAction::CommitOnlyBranch => "commit_only_branch",
            StatusAction::CommitAndPush => "commit_and_push",
        }
    }
}

impl fmt::Display for StatusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusAction {
    type Err = StatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(StatusAction::None),
            "commit_only" => Ok(StatusAction::CommitOnly),
            "commit_only_branch" => Ok(StatusAction::CommitOnlyBranch),
            "commit_and_push" => Ok(StatusAction::CommitAndPush),
            _ => Err(StatusError::InvalidAction(value.to_string())),
        }
    }
}

/// The per-invocation flag beats the configured default.
pub fn get_effective_status_action(
    flag: Option<&str>,
    config: &ItemflowConfig,
) -> Result<StatusAction, StatusError> {
    match flag.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.parse(),
        None => config.status_action().parse(),
    }
}

/// Returns whether the status update should be skipped. An item already at
/// `target` is an error unless `skip_check` is set.
pub fn perform_status_check(
    item: &WorkItem,
    target: &str,
    skip_check: bool,
) -> Result<bool, StatusError> {
    if !item.status.eq_ignore_ascii_case(target) {
        return Ok(false);
    }
    if skip_check {
        info!(id = %item.id, status = target, "status already at target; skipping update");
        return Ok(true);
    }
    Err(StatusError::AlreadyInStatus {
        id: item.id.clone(),
        status: item.status.clone(),
    })
}

/// Expands `{id}`, `{type}`, `{title}` and `{move_to}`. A missing type renders
/// as `unknown`, a missing title as nothing.
pub fn expand_template(
    template: &str,
    id: &str,
    kind: Option<&str>,
    title: Option<&str>,
    move_to: &str,
) -> String {
    template
        .replace("{id}", id)
        .replace("{type}", kind.filter(|k| !k.is_empty()).unwrap_or("unknown"))
        .replace("{title}", title.unwrap_or_default())
        .replace("{move_to}", move_to)
}

pub fn build_status_commit_message(template: &str, item: &WorkItem, target: &str) -> String {
    expand_template(
        template,
        &item.id,
        item.kind.as_deref(),
        Some(item.title.as_str()),
        target,
    )
}

/// Moves the item file into `target`'s folder and rewrites its status (plus
/// `extra_fields`) without committing. The rename happens first and is undone
/// if the rewrite fails, so the file never exists in two folders.
pub fn move_work_item_without_commit(
    item: &WorkItem,
    items_root: &Path,
    target: &str,
    config: &ItemflowConfig,
    extra_fields: &[(String, Value)],
    dry_run: bool,
) -> Result<PathBuf, StatusError> {
    let folder = config
        .status_folder(target)
        .ok_or_else(|| StatusError::UnknownStatus {
            status: target.to_string(),
            known: config.status_names().join(", "),
        })?;
    let source = items_root
        .join(config.status_folder(&item.status).unwrap_or_else(|| item.status.clone()))
        .join(item.file_name());
    let source = if source.exists() { source } else { item.file_path.clone() };
    let dest = items_root.join(&folder).join(item.file_name());

    if dry_run {
        eprintln!("[dry-run] move {} -> {}", source.display(), dest.display());
        return Ok(dest);
    }

    let mut fields = vec![(KEY_STATUS.to_string(), Value::String(target.to_string()))];
    fields.extend(extra_fields.iter().cloned());

    if source == dest {
        update_item_fields(&dest, &fields)?;
        return Ok(dest);
    }
    if dest.exists() {
        return Err(StatusError::DestinationExists { path: dest });
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| StatusError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::rename(&source, &dest).map_err(|err| StatusError::Io {
        path: source.clone(),
        source: err,
    })?;
    if let Err(err) = update_item_fields(&dest, &fields) {
        if let Err(rollback) = fs::rename(&dest, &source) {
            warn!(%rollback, path = %dest.display(), "failed to restore work item after error");
        }
        return Err(err.into());
    }
    info!(id = %item.id, from = %source.display(), to = %dest.display(), "moved work item");
    Ok(dest)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed { message: String, pushed: bool },
    /// Dry-run: the commit (and push) that would have been made.
    Planned { message: String, push: bool },
    Skipped { reason: String },
}

impl CommitOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        CommitOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Commits (and optionally pushes) the status move under `root_dir` in the
/// checkout `git` points at, which is on `branch`.
pub fn commit_status_change(
    git: &Git<'_>,
    config: &ItemflowConfig,
    action: StatusAction,
    message: &str,
    branch: &str,
    trunk: &str,
    remote: &str,
) -> Result<CommitOutcome, StatusError> {
    match action {
        StatusAction::None => return Ok(CommitOutcome::skipped("status action is none")),
        StatusAction::CommitOnlyBranch if branch == trunk => {
            return Ok(CommitOutcome::skipped(format!(
                "on trunk branch {trunk}; commit_only_branch commits on feature branches only"
            )))
        }
        _ => {}
    }
    let root = config.root_dir();
    if !git.is_dry_run() {
        let pending = git.read(&["status", "--porcelain", "--", root])?;
        if pending.is_empty() {
            return Ok(CommitOutcome::skipped("nothing to commit"));
        }
    }
    let push = action == StatusAction::CommitAndPush;
    git.mutate(&["add", "-A", "--", root])?;
    git.mutate(&["commit", "-m", message, "--", root])?;
    if push {
        git.network(&["push", "-u", remote, branch])?;
    }
    if git.is_dry_run() {
        return Ok(CommitOutcome::Planned {
            message: message.to_string(),
            push,
        });
    }
    info!(branch, message, pushed = push, "committed status change");
    Ok(CommitOutcome::Committed {
        message: message.to_string(),
        pushed: push,
    })
}
