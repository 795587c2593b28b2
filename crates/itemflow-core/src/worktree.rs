use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{resolve_user_home_dir, ItemflowConfig};
use crate::git::{Git, GitError};

pub const FALLBACK_WORKTREE_DIR: &str = "_worktrees";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("worktree {path} already exists for item {id}; pass --override to replace it or --reuse-branch to keep using it")]
    AlreadyExists { path: PathBuf, id: String },
    #[error("worktree {path} belongs to a different item than {id}; pass --override to replace it")]
    DifferentItem { path: PathBuf, id: String },
    #[error("{path} exists but is not a valid worktree checkout; pass --override to replace it")]
    InvalidCheckout { path: PathBuf },
    #[error("refusing to use path {path:?}: {reason}")]
    UnsafePath { path: String, reason: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeState {
    NotExists,
    InvalidPath,
    ValidSameItem,
    ValidDifferentItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitDirKind {
    /// `.git` is a directory: a full, independent repository.
    Repository,
    /// `.git` is a `gitdir:` link file: a linked worktree.
    WorktreeLink,
    Missing,
}

/// Looks at `<path>/.git` without following symlinks.
pub fn is_external_git_repo(path: &Path) -> GitDirKind {
    let dot_git = path.join(".git");
    let Ok(meta) = fs::symlink_metadata(&dot_git) else {
        return GitDirKind::Missing;
    };
    if meta.file_type().is_symlink() {
        return GitDirKind::Missing;
    }
    if meta.is_dir() {
        return GitDirKind::Repository;
    }
    match fs::read_to_string(&dot_git) {
        Ok(text) if text.trim_start().starts_with("gitdir:") => GitDirKind::WorktreeLink,
        _ => GitDirKind::Missing,
    }
}

fn segment_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let re = Regex::new(r"^(\d+)(-|$)").ok()?;
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Classifies a candidate worktree path for `id`. Reads only metadata, never
/// mutates, and treats a missing path as `NotExists`.
pub fn check_worktree_exists(path: &Path, id: &str) -> WorktreeState {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return WorktreeState::InvalidPath,
        Err(_) => return WorktreeState::NotExists,
    }
    if is_external_git_repo(path) != GitDirKind::WorktreeLink {
        return WorktreeState::InvalidPath;
    }
    let wanted: Option<u64> = id.trim().parse().ok();
    match (segment_id(path), wanted) {
        (Some(found), Some(wanted)) if found == wanted => WorktreeState::ValidSameItem,
        _ => WorktreeState::ValidDifferentItem,
    }
}

/// Clears the way for a new worktree at `path`. Without `override_existing`
/// any existing path is an error naming why; with it the path is removed,
/// except in dry-run where the removal is only announced.
pub fn handle_existing_worktree(
    git: &Git<'_>,
    path: &Path,
    id: &str,
    override_existing: bool,
) -> Result<WorktreeState, WorktreeError> {
    let state = check_worktree_exists(path, id);
    if state == WorktreeState::NotExists {
        return Ok(state);
    }
    if !override_existing {
        return Err(match state {
            WorktreeState::ValidSameItem => WorktreeError::AlreadyExists {
                path: path.to_path_buf(),
                id: id.to_string(),
            },
            WorktreeState::ValidDifferentItem => WorktreeError::DifferentItem {
                path: path.to_path_buf(),
                id: id.to_string(),
            },
            _ => WorktreeError::InvalidCheckout {
                path: path.to_path_buf(),
            },
        });
    }
    if git.is_dry_run() {
        eprintln!("[dry-run] remove existing worktree {}", path.display());
        return Ok(state);
    }
    info!(path = %path.display(), ?state, "removing existing worktree");
    force_remove_path(git, path)?;
    Ok(state)
}

fn force_remove_path(git: &Git<'_>, path: &Path) -> Result<(), WorktreeError> {
    let path_text = path.to_string_lossy();
    let output = git.mutate_raw(&["worktree", "remove", "--force", &path_text])?;
    if output.success() && !path.exists() {
        return Ok(());
    }
    debug!(detail = %output.detail(), "git worktree remove failed; deleting directory");
    fs::remove_dir_all(path).map_err(|source| WorktreeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let prune = git.mutate_raw(&["worktree", "prune"])?;
    if !prune.success() {
        warn!(detail = %prune.detail(), "git worktree prune failed");
    }
    Ok(())
}

/// Longest shared directory of `paths`. One path yields its parent; paths
/// sharing nothing but the root yield the root.
pub fn find_common_path_prefix(paths: &[PathBuf]) -> PathBuf {
    match paths {
        [] => PathBuf::new(),
        [only] => only.parent().map(Path::to_path_buf).unwrap_or_default(),
        [first, rest @ ..] => {
            let mut shared: Vec<Component<'_>> = first.components().collect();
            for path in rest {
                let common = shared
                    .iter()
                    .zip(path.components())
                    .take_while(|(left, right)| **left == *right)
                    .count();
                shared.truncate(common);
            }
            shared.iter().collect()
        }
    }
}

/// Lexically normalizes `raw` and rejects paths that would be destructive to
/// manage worktrees under.
pub fn validate_and_clean_path(raw: &str) -> Result<PathBuf, WorktreeError> {
    let unsafe_path = |reason: &str| WorktreeError::UnsafePath {
        path: raw.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path("path is empty"));
    }
    let mut cleaned: Vec<Component<'_>> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.last() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => cleaned.push(component),
            },
            other => cleaned.push(other),
        }
    }
    let cleaned: PathBuf = if cleaned.is_empty() {
        PathBuf::from(".")
    } else {
        cleaned.iter().collect()
    };
    if cleaned.parent().is_none() && cleaned.has_root() {
        return Err(unsafe_path("path is the filesystem root"));
    }
    if cleaned == Path::new(".") || cleaned == Path::new("..") {
        return Err(unsafe_path("path is the current or parent directory"));
    }
    if let Some(home) = resolve_user_home_dir() {
        if cleaned == home {
            return Err(unsafe_path("path is the home directory"));
        }
    }
    Ok(cleaned)
}

/// A `git worktree list --porcelain` record, reduced to what root derivation
/// looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub bare: bool,
    /// Git reports the checkout directory as missing.
    pub prunable: bool,
}

pub fn list_git_worktrees(git: &Git<'_>) -> Result<Vec<ListedWorktree>, WorktreeError> {
    let raw = git.read(&["worktree", "list", "--porcelain"])?;
    Ok(parse_git_worktree_list(&raw))
}

fn parse_git_worktree_list(raw: &str) -> Vec<ListedWorktree> {
    let mut entries = Vec::new();
    let mut current: Option<ListedWorktree> = None;
    for line in raw.lines().map(str::trim) {
        if line.is_empty() {
            entries.extend(current.take());
        } else if let Some(value) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(ListedWorktree {
                path: PathBuf::from(value),
                bare: false,
                prunable: false,
            });
        } else if let Some(entry) = current.as_mut() {
            match line.split_whitespace().next() {
                Some("bare") => entry.bare = true,
                Some("prunable") => entry.prunable = true,
                _ => {}
            }
        }
    }
    entries.extend(current.take());
    entries
}

/// Where worktrees for this repository live: the configured root, else the
/// common parent of existing linked worktrees, else `<parent>/_worktrees`.
pub fn resolve_worktree_root(
    git: &Git<'_>,
    config: &ItemflowConfig,
    repo_root: &Path,
) -> Result<PathBuf, WorktreeError> {
    if let Some(configured) = config.worktree_root() {
        let candidate = Path::new(configured);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            repo_root.join(candidate)
        };
        return validate_and_clean_path(&joined.to_string_lossy());
    }

    let siblings: Vec<PathBuf> = list_git_worktrees(git)?
        .into_iter()
        .filter(|entry| !entry.bare && !entry.prunable && entry.path != repo_root)
        .map(|entry| entry.path)
        .collect();
    if !siblings.is_empty() {
        let prefix = find_common_path_prefix(&siblings);
        match validate_and_clean_path(&prefix.to_string_lossy()) {
            Ok(root) => return Ok(root),
            Err(err) => debug!(%err, "ignoring derived worktree root"),
        }
    }

    let parent = repo_root.parent().unwrap_or(repo_root);
    validate_and_clean_path(&parent.join(FALLBACK_WORKTREE_DIR).to_string_lossy())
}

/// `git worktree add`. With `new_branch_base` the branch is created from that
/// ref; otherwise the existing branch is checked out.
pub fn create_worktree(
    git: &Git<'_>,
    path: &Path,
    branch: &str,
    new_branch_base: Option<&str>,
) -> Result<(), WorktreeError> {
    let path_text = path.to_string_lossy();
    info!(path = %path.display(), branch, base = ?new_branch_base, "creating worktree");
    match new_branch_base {
        Some(base) => git.mutate(&["worktree", "add", "-b", branch, &path_text, base])?,
        None => git.mutate(&["worktree", "add", &path_text, branch])?,
    };
    Ok(())
}

/// Removes a linked worktree. Returns `false` when there was nothing to remove.
pub fn remove_worktree(git: &Git<'_>, path: &Path) -> Result<bool, WorktreeError> {
    if !path.exists() {
        return Ok(false);
    }
    let path_text = path.to_string_lossy();
    info!(path = %path.display(), "removing worktree");
    git.mutate(&["worktree", "remove", "--force", &path_text])?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn linked_worktree(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::create_dir_all(&path).expect("dir");
        fs::write(path.join(".git"), "gitdir: /repo/.git/worktrees/x\n").expect("link");
        path
    }

    #[test]
    fn check_worktree_exists_classifies_paths() {
        let temp = TempDir::new().expect("tempdir");
        let missing = temp.path().join("014-missing");
        assert_eq!(check_worktree_exists(&missing, "014"), WorktreeState::NotExists);

        let same = linked_worktree(temp.path(), "014-add-login");
        assert_eq!(check_worktree_exists(&same, "014"), WorktreeState::ValidSameItem);
        assert_eq!(check_worktree_exists(&same, "14"), WorktreeState::ValidSameItem);
        assert_eq!(check_worktree_exists(&same, "015"), WorktreeState::ValidDifferentItem);

        let unnumbered = linked_worktree(temp.path(), "feature-x");
        assert_eq!(
            check_worktree_exists(&unnumbered, "014"),
            WorktreeState::ValidDifferentItem
        );

        let plain = temp.path().join("014-plain");
        fs::create_dir_all(&plain).expect("plain");
        assert_eq!(check_worktree_exists(&plain, "014"), WorktreeState::InvalidPath);

        let primary = temp.path().join("014-primary");
        fs::create_dir_all(primary.join(".git")).expect("primary");
        assert_eq!(check_worktree_exists(&primary, "014"), WorktreeState::InvalidPath);

        // Pure: a second call sees the same answer.
        assert_eq!(check_worktree_exists(&same, "014"), WorktreeState::ValidSameItem);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_git_file_is_not_followed() {
        let temp = TempDir::new().expect("tempdir");
        let target = temp.path().join("elsewhere.git");
        fs::write(&target, "gitdir: /other/.git\n").expect("target");
        let path = temp.path().join("014-linked");
        fs::create_dir_all(&path).expect("dir");
        std::os::unix::fs::symlink(&target, path.join(".git")).expect("symlink");
        assert_eq!(check_worktree_exists(&path, "014"), WorktreeState::InvalidPath);
    }

    #[test]
    fn handle_existing_worktree_requires_override() {
        let temp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new();
        let git = Git::new(&runner, temp.path());
        let same = linked_worktree(temp.path(), "014-a");

        let err = handle_existing_worktree(&git, &same, "014", false).expect_err("exists");
        assert!(err.to_string().contains("already exists"));
        let err = handle_existing_worktree(&git, &same, "015", false).expect_err("other");
        assert!(err.to_string().contains("different item"));
        let plain = temp.path().join("plain");
        fs::create_dir_all(&plain).expect("plain");
        let err = handle_existing_worktree(&git, &plain, "014", false).expect_err("invalid");
        assert!(err.to_string().contains("not a valid worktree"));
        assert!(err.to_string().contains("--override"));

        let missing = temp.path().join("014-missing");
        assert_eq!(
            handle_existing_worktree(&git, &missing, "014", false).expect("noop"),
            WorktreeState::NotExists
        );
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn handle_existing_worktree_override_in_dry_run_keeps_path() {
        let temp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::dry_run();
        let git = Git::new(&runner, temp.path());
        let same = linked_worktree(temp.path(), "014-a");
        let state = handle_existing_worktree(&git, &same, "014", true).expect("dry run");
        assert_eq!(state, WorktreeState::ValidSameItem);
        assert!(same.exists());
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn handle_existing_worktree_override_falls_back_to_delete() {
        let temp = TempDir::new().expect("tempdir");
        let runner = ScriptedRunner::new()
            .respond("worktree remove", CommandOutput::failed(128, "fatal: not a working tree"));
        let git = Git::new(&runner, temp.path());
        let plain = temp.path().join("014-plain");
        fs::create_dir_all(&plain).expect("plain");
        handle_existing_worktree(&git, &plain, "014", true).expect("override");
        assert!(!plain.exists());
        assert!(runner.invoked("worktree prune"));
    }

    #[test]
    fn find_common_path_prefix_cases() {
        assert_eq!(find_common_path_prefix(&[]), PathBuf::new());
        assert_eq!(
            find_common_path_prefix(&[PathBuf::from("/src/_wt/001-a")]),
            PathBuf::from("/src/_wt")
        );
        assert_eq!(
            find_common_path_prefix(&[
                PathBuf::from("/src/_wt/001-a"),
                PathBuf::from("/src/_wt/002-b"),
                PathBuf::from("/src/_wt/nested/003-c"),
            ]),
            PathBuf::from("/src/_wt")
        );
        assert_eq!(
            find_common_path_prefix(&[PathBuf::from("/a/x"), PathBuf::from("/b/y")]),
            PathBuf::from("/")
        );
    }

    #[test]
    fn validate_and_clean_path_normalizes_and_rejects() {
        assert_eq!(
            validate_and_clean_path("/src//app/../_wt/./").expect("clean"),
            PathBuf::from("/src/_wt")
        );
        assert_eq!(
            validate_and_clean_path("../_wt/x/..").expect("relative"),
            PathBuf::from("../_wt")
        );
        for bad in ["", "   ", "/", "/..", ".", "a/..", ".."] {
            assert!(validate_and_clean_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn parse_git_worktree_list_marks_bare_and_prunable() {
        let raw = "\
worktree /repo/main.git
bare

worktree /repo/feature
HEAD 123456
branch refs/heads/feature/x
locked

worktree /trees/014-gone
HEAD 999999
detached
prunable gitdir file points to non-existent location
";
        let parsed = parse_git_worktree_list(raw);
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].bare);
        assert_eq!(parsed[1].path, PathBuf::from("/repo/feature"));
        assert!(!parsed[1].bare && !parsed[1].prunable);
        assert!(parsed[2].prunable);
    }

    #[test]
    fn prunable_worktrees_do_not_anchor_the_root() {
        let runner = ScriptedRunner::new().respond(
            "worktree list",
            CommandOutput::ok(
                "worktree /src/app\nbranch refs/heads/main\n\n\
                 worktree /src/trees/001-a\nbranch refs/heads/001-a\n\n\
                 worktree /old/place/002-b\nbranch refs/heads/002-b\nprunable gitdir file points to non-existent location\n",
            ),
        );
        let git = Git::new(&runner, "/src/app");
        let root = resolve_worktree_root(&git, &ItemflowConfig::default(), Path::new("/src/app"))
            .expect("root");
        assert_eq!(root, PathBuf::from("/src/trees"));
    }

    #[test]
    fn resolve_worktree_root_prefers_config_then_siblings_then_fallback() {
        let runner = ScriptedRunner::new().respond(
            "worktree list",
            CommandOutput::ok(
                "worktree /src/app\nbranch refs/heads/main\n\nworktree /src/trees/001-a\nbranch refs/heads/001-a\n",
            ),
        );
        let git = Git::new(&runner, "/src/app");
        let mut config = ItemflowConfig::default();
        let root = resolve_worktree_root(&git, &config, Path::new("/src/app")).expect("root");
        assert_eq!(root, PathBuf::from("/src/trees"));

        config.workspace = Some(crate::config::WorkspaceConfig {
            worktree_root: Some("../wt".to_string()),
            ..Default::default()
        });
        let root = resolve_worktree_root(&git, &config, Path::new("/src/app")).expect("root");
        assert_eq!(root, PathBuf::from("/src/wt"));

        let empty = ScriptedRunner::new();
        let git = Git::new(&empty, "/src/app");
        let root = resolve_worktree_root(&git, &ItemflowConfig::default(), Path::new("/src/app"))
            .expect("root");
        assert_eq!(root, PathBuf::from("/src/_worktrees"));
    }

    #[test]
    fn git_dir_kind_distinguishes_repositories_from_worktrees() {
        let temp = TempDir::new().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join(".git")).expect("git dir");
        assert_eq!(is_external_git_repo(&repo), GitDirKind::Repository);

        let linked = linked_worktree(temp.path(), "014-x");
        assert_eq!(is_external_git_repo(&linked), GitDirKind::WorktreeLink);

        let stray = temp.path().join("stray");
        fs::create_dir_all(&stray).expect("stray");
        fs::write(stray.join(".git"), "not a link\n").expect("file");
        assert_eq!(is_external_git_repo(&stray), GitDirKind::Missing);
        assert_eq!(is_external_git_repo(&temp.path().join("absent")), GitDirKind::Missing);
    }
}
