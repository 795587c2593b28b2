use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::config::{Project, WorkspaceConfig};
use crate::worktree::{is_external_git_repo, GitDirKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceBehavior {
    Standalone,
    Monorepo,
    Polyrepo,
}

impl WorkspaceBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceBehavior::Standalone => "standalone",
            WorkspaceBehavior::Monorepo => "monorepo",
            WorkspaceBehavior::Polyrepo => "polyrepo",
        }
    }
}

impl fmt::Display for WorkspaceBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceBehavior {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standalone" => Ok(WorkspaceBehavior::Standalone),
            "monorepo" => Ok(WorkspaceBehavior::Monorepo),
            "polyrepo" => Ok(WorkspaceBehavior::Polyrepo),
            other => Err(format!(
                "unknown workspace behavior {other:?} (expected standalone, monorepo or polyrepo)"
            )),
        }
    }
}

/// Resolves a project path or repo root. Relative values hang off the primary
/// checkout's parent directory, so `../api` and `api` both name a sibling.
pub fn resolve_project_path(primary_root: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw.trim());
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let base = primary_root.parent().unwrap_or(primary_root);
    // Paths are written relative to the primary checkout but joined onto its
    // parent, so one leading `..` is already accounted for. Further `..`
    // components are kept and climb above the parent.
    let stripped = candidate.strip_prefix("..").unwrap_or(candidate);
    base.join(stripped)
}

fn has_path(project: &Project) -> bool {
    project
        .path
        .as_deref()
        .map(|path| !path.trim().is_empty())
        .unwrap_or(false)
}

fn has_foreign_repo_root(project: &Project, primary_root: &Path) -> bool {
    project
        .repo_root
        .as_deref()
        .filter(|root| !root.trim().is_empty())
        .map(|root| resolve_project_path(primary_root, root) != primary_root)
        .unwrap_or(false)
}

/// Classifies the configured workspace. An explicit `behavior` wins; otherwise
/// the project list decides.
pub fn resolve_workspace_behavior(
    workspace: Option<&WorkspaceConfig>,
    primary_root: &Path,
) -> WorkspaceBehavior {
    let Some(workspace) = workspace else {
        return WorkspaceBehavior::Standalone;
    };
    if let Some(explicit) = workspace
        .behavior
        .as_deref()
        .and_then(|value| value.parse::<WorkspaceBehavior>().ok())
    {
        return explicit;
    }
    let projects = &workspace.projects;
    if projects.is_empty() {
        return WorkspaceBehavior::Standalone;
    }
    if projects
        .iter()
        .any(|project| has_foreign_repo_root(project, primary_root))
    {
        return WorkspaceBehavior::Polyrepo;
    }
    if !projects.iter().any(has_path) {
        return WorkspaceBehavior::Monorepo;
    }
    let independent = projects.iter().filter(|project| has_path(project)).any(|project| {
        let path = resolve_project_path(primary_root, project.path.as_deref().unwrap_or_default());
        path != primary_root && is_external_git_repo(&path) == GitDirKind::Repository
    });
    if independent {
        WorkspaceBehavior::Polyrepo
    } else {
        WorkspaceBehavior::Monorepo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project(name: &str, path: Option<&str>, repo_root: Option<&str>) -> Project {
        Project {
            name: name.to_string(),
            path: path.map(str::to_string),
            repo_root: repo_root.map(str::to_string),
            ..Project::default()
        }
    }

    fn workspace(projects: Vec<Project>) -> WorkspaceConfig {
        WorkspaceConfig {
            projects,
            ..WorkspaceConfig::default()
        }
    }

    #[test]
    fn no_workspace_or_projects_is_standalone() {
        let root = Path::new("/src/app");
        assert_eq!(resolve_workspace_behavior(None, root), WorkspaceBehavior::Standalone);
        assert_eq!(
            resolve_workspace_behavior(Some(&workspace(vec![])), root),
            WorkspaceBehavior::Standalone
        );
    }

    #[test]
    fn projects_without_paths_are_monorepo() {
        let ws = workspace(vec![project("web", None, None), project("api", None, None)]);
        assert_eq!(
            resolve_workspace_behavior(Some(&ws), Path::new("/src/app")),
            WorkspaceBehavior::Monorepo
        );
    }

    #[test]
    fn shared_repo_root_elsewhere_is_polyrepo() {
        let ws = workspace(vec![project("api", Some("api"), Some("../monorepo"))]);
        assert_eq!(
            resolve_workspace_behavior(Some(&ws), Path::new("/src/app")),
            WorkspaceBehavior::Polyrepo
        );
    }

    #[test]
    fn project_path_with_own_git_dir_is_polyrepo() {
        let temp = TempDir::new().expect("tempdir");
        let primary = temp.path().join("app");
        let sibling = temp.path().join("api");
        fs::create_dir_all(&primary).expect("primary");
        fs::create_dir_all(sibling.join(".git")).expect("sibling git");
        let ws = workspace(vec![project("api", Some("../api"), None)]);
        assert_eq!(
            resolve_workspace_behavior(Some(&ws), &primary),
            WorkspaceBehavior::Polyrepo
        );

        let plain = workspace(vec![project("docs", Some("../docs"), None)]);
        assert_eq!(
            resolve_workspace_behavior(Some(&plain), &primary),
            WorkspaceBehavior::Monorepo
        );
    }

    #[test]
    fn explicit_behavior_wins() {
        let mut ws = workspace(vec![project("web", None, None)]);
        ws.behavior = Some("Polyrepo".to_string());
        assert_eq!(
            resolve_workspace_behavior(Some(&ws), Path::new("/src/app")),
            WorkspaceBehavior::Polyrepo
        );
    }

    #[test]
    fn relative_paths_join_primary_parent() {
        let root = Path::new("/src/app");
        assert_eq!(resolve_project_path(root, "../api"), PathBuf::from("/src/api"));
        assert_eq!(resolve_project_path(root, "api"), PathBuf::from("/src/api"));
        assert_eq!(resolve_project_path(root, "/opt/api"), PathBuf::from("/opt/api"));
    }

    #[test]
    fn only_the_first_parent_step_is_absorbed() {
        let root = Path::new("/src/team/app");
        assert_eq!(
            resolve_project_path(root, "../../shared/api"),
            PathBuf::from("/src/team/../shared/api")
        );
        assert_eq!(
            resolve_project_path(root, "./api"),
            PathBuf::from("/src/team/./api")
        );
    }
}
