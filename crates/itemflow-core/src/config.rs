use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_ROOT_DIR: &str = "work";
pub const DEFAULT_ID_WIDTH: usize = 3;
pub const DEFAULT_START_STATUS: &str = "doing";
pub const DEFAULT_DONE_STATUS: &str = "done";
pub const DEFAULT_STATUS_ACTION: &str = "commit_only";
pub const DEFAULT_COMMIT_TEMPLATE: &str = "chore({id}): move {type} to {move_to}";
pub const DEFAULT_DONE_COMMIT_TEMPLATE: &str = "{id}: {title}";
pub const DEFAULT_MERGE_STRATEGY: &str = "squash";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_SETUP_TIMEOUT_SECS: u64 = 600;

const DEFAULT_STATUSES: [&str; 5] = ["backlog", "todo", "doing", "review", "done"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ItemflowConfig {
    /// Directory (relative to the repository root) holding the status folders.
    pub root_dir: Option<String>,
    /// Fixed width of numeric work item ids, zero padded.
    pub id_width: Option<usize>,
    /// Status name -> folder name under `root_dir`, in lifecycle order.
    pub statuses: Option<StatusFolders>,
    pub git: GitSettings,
    pub workflow: WorkflowSettings,
    pub workspace: Option<WorkspaceConfig>,
    pub setup: SetupSettings,
    pub github: GithubSettings,
    pub ide: IdeSettings,
}

/// The `[statuses]` table, kept in the order it was written. That order is
/// the lifecycle order used when an item turns up in more than one folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFolders(pub Vec<(String, String)>);

impl Serialize for StatusFolders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (status, folder) in &self.0 {
            map.serialize_entry(status, folder)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StatusFolders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FoldersVisitor;

        impl<'de> Visitor<'de> for FoldersVisitor {
            type Value = StatusFolders;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of status name to folder name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, String)> = Vec::new();
                while let Some((status, folder)) = access.next_entry::<String, String>()? {
                    entries.retain(|(existing, _)| existing != &status);
                    entries.push((status, folder));
                }
                Ok(StatusFolders(entries))
            }
        }

        deserializer.deserialize_map(FoldersVisitor)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitSettings {
    pub trunk_branch: Option<String>,
    pub remote: Option<String>,
    /// Extra environment passed to every subprocess (e.g. GIT_CONFIG_GLOBAL in CI).
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSettings {
    pub start_status: Option<String>,
    pub done_status: Option<String>,
    pub status_action: Option<String>,
    pub commit_template: Option<String>,
    pub done_commit_template: Option<String>,
    pub merge_strategy: Option<String>,
    pub require_checks: Option<bool>,
    pub require_no_comments: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Explicit `standalone | monorepo | polyrepo`; derived from `projects` when unset.
    pub behavior: Option<String>,
    pub worktree_root: Option<String>,
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Project {
    pub name: String,
    pub path: Option<String>,
    pub mount: Option<String>,
    pub repo_root: Option<String>,
    pub trunk_branch: Option<String>,
    pub remote: Option<String>,
    pub setup: Vec<String>,
}

impl Project {
    /// Subdirectory under the worktree; defaults to the project name.
    pub fn mount_name(&self) -> &str {
        self.mount
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.name.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SetupSettings {
    pub commands: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdeSettings {
    pub command: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn fill<T: Clone>(target: &mut Option<T>, fallback: &Option<T>) {
    if target.is_none() {
        target.clone_from(fallback);
    }
}

impl ItemflowConfig {
    /// Field-wise layering: values already set win, unset ones come from `base`.
    pub fn layered_over(mut self, base: &ItemflowConfig) -> ItemflowConfig {
        fill(&mut self.root_dir, &base.root_dir);
        fill(&mut self.id_width, &base.id_width);
        fill(&mut self.statuses, &base.statuses);
        fill(&mut self.git.trunk_branch, &base.git.trunk_branch);
        fill(&mut self.git.remote, &base.git.remote);
        fill(&mut self.git.env, &base.git.env);
        let workflow = &mut self.workflow;
        fill(&mut workflow.start_status, &base.workflow.start_status);
        fill(&mut workflow.done_status, &base.workflow.done_status);
        fill(&mut workflow.status_action, &base.workflow.status_action);
        fill(&mut workflow.commit_template, &base.workflow.commit_template);
        fill(
            &mut workflow.done_commit_template,
            &base.workflow.done_commit_template,
        );
        fill(&mut workflow.merge_strategy, &base.workflow.merge_strategy);
        fill(&mut workflow.require_checks, &base.workflow.require_checks);
        fill(
            &mut workflow.require_no_comments,
            &base.workflow.require_no_comments,
        );
        fill(&mut self.workspace, &base.workspace);
        fill(&mut self.setup.commands, &base.setup.commands);
        fill(&mut self.setup.timeout_secs, &base.setup.timeout_secs);
        fill(&mut self.github.api_url, &base.github.api_url);
        fill(&mut self.github.owner, &base.github.owner);
        fill(&mut self.github.repo, &base.github.repo);
        fill(&mut self.github.token_env, &base.github.token_env);
        fill(&mut self.ide.command, &base.ide.command);
        self
    }

    pub fn root_dir(&self) -> &str {
        non_empty(&self.root_dir).unwrap_or(DEFAULT_ROOT_DIR)
    }

    pub fn id_width(&self) -> usize {
        self.id_width
            .filter(|width| *width > 0)
            .unwrap_or(DEFAULT_ID_WIDTH)
    }

    /// `(status, folder)` pairs in declaration order.
    pub fn statuses(&self) -> Vec<(String, String)> {
        match &self.statuses {
            Some(folders) if !folders.0.is_empty() => folders.0.clone(),
            _ => DEFAULT_STATUSES
                .iter()
                .map(|name| (name.to_string(), name.to_string()))
                .collect(),
        }
    }

    pub fn status_folder(&self, status: &str) -> Option<String> {
        let wanted = status.trim();
        self.statuses()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, folder)| folder)
    }

    pub fn status_names(&self) -> Vec<String> {
        self.statuses().into_iter().map(|(name, _)| name).collect()
    }

    pub fn trunk_branch(&self) -> Option<&str> {
        non_empty(&self.git.trunk_branch)
    }

    pub fn remote(&self) -> Option<&str> {
        non_empty(&self.git.remote)
    }

    pub fn git_env(&self) -> BTreeMap<String, String> {
        self.git.env.clone().unwrap_or_default()
    }

    pub fn start_status(&self) -> &str {
        non_empty(&self.workflow.start_status).unwrap_or(DEFAULT_START_STATUS)
    }

    pub fn done_status(&self) -> &str {
        non_empty(&self.workflow.done_status).unwrap_or(DEFAULT_DONE_STATUS)
    }

    pub fn status_action(&self) -> &str {
        non_empty(&self.workflow.status_action).unwrap_or(DEFAULT_STATUS_ACTION)
    }

    pub fn commit_template(&self) -> &str {
        non_empty(&self.workflow.commit_template).unwrap_or(DEFAULT_COMMIT_TEMPLATE)
    }

    pub fn done_commit_template(&self) -> &str {
        non_empty(&self.workflow.done_commit_template).unwrap_or(DEFAULT_DONE_COMMIT_TEMPLATE)
    }

    pub fn merge_strategy(&self) -> &str {
        non_empty(&self.workflow.merge_strategy).unwrap_or(DEFAULT_MERGE_STRATEGY)
    }

    pub fn require_checks(&self) -> bool {
        self.workflow.require_checks.unwrap_or(true)
    }

    pub fn require_no_comments(&self) -> bool {
        self.workflow.require_no_comments.unwrap_or(false)
    }

    pub fn projects(&self) -> &[Project] {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.projects.as_slice())
            .unwrap_or(&[])
    }

    pub fn worktree_root(&self) -> Option<&str> {
        self.workspace
            .as_ref()
            .and_then(|workspace| non_empty(&workspace.worktree_root))
    }

    pub fn setup_commands(&self) -> &[String] {
        self.setup.commands.as_deref().unwrap_or(&[])
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(
            self.setup
                .timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SETUP_TIMEOUT_SECS),
        )
    }

    pub fn github_api_url(&self) -> &str {
        non_empty(&self.github.api_url)
            .unwrap_or(DEFAULT_GITHUB_API_URL)
            .trim_end_matches('/')
    }

    pub fn github_token_env(&self) -> &str {
        non_empty(&self.github.token_env).unwrap_or(DEFAULT_TOKEN_ENV)
    }

    pub fn ide_command(&self) -> Option<&str> {
        non_empty(&self.ide.command)
    }
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    [".itemflow.toml", ".itemflowrc"]
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

pub fn resolve_itemflow_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("ITEMFLOW_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".itemflow"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_itemflow_home_dir().map(|home| home.join("config.toml"))
}

fn read_config_file(path: &Path) -> Result<ItemflowConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<ItemflowConfig>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_config(repo_root: &Path) -> Result<Option<ItemflowConfig>, ConfigError> {
    for name in config_filename_candidates() {
        let path = repo_root.join(name);
        if path.is_file() {
            return read_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_global_config() -> Result<Option<ItemflowConfig>, ConfigError> {
    let Some(path) = global_config_path() else {
        return Ok(None);
    };
    if !path.is_file() {
        return Ok(None);
    }
    read_config_file(&path).map(Some)
}

/// Project config layered over the global config; built-in defaults fill the rest
/// through the accessor methods.
pub fn load_effective_config(repo_root: &Path) -> Result<ItemflowConfig, ConfigError> {
    let global = load_global_config()?.unwrap_or_default();
    let project = load_config(repo_root)?.unwrap_or_default();
    Ok(project.layered_over(&global))
}
