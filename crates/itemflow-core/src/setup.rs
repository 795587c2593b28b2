use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::behavior::WorkspaceBehavior;
use crate::config::ItemflowConfig;
use crate::polyrepo::{get_project_setup_path, group_projects_by_repo_root, ResolvedProject};
use crate::runner::{CommandRunner, CommandSpec, RunnerError};

pub const IDE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot parse setup command {command:?}: {source}")]
    Parse {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("`{command}` failed in {dir}: {detail}")]
    Failed {
        command: String,
        dir: PathBuf,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupStep {
    pub project: Option<String>,
    pub dir: PathBuf,
    pub command: String,
}

/// Orders the setup commands for a fresh worktree: global commands first, then
/// per-project ones in declaration order.
pub fn plan_setup(
    config: &ItemflowConfig,
    behavior: WorkspaceBehavior,
    worktree: &Path,
    projects: Option<&[ResolvedProject]>,
) -> Vec<SetupStep> {
    let mut steps: Vec<SetupStep> = config
        .setup_commands()
        .iter()
        .map(|command| SetupStep {
            project: None,
            dir: worktree.to_path_buf(),
            command: command.clone(),
        })
        .collect();

    match behavior {
        WorkspaceBehavior::Standalone => {}
        WorkspaceBehavior::Monorepo => {
            for project in config.projects() {
                for command in &project.setup {
                    steps.push(SetupStep {
                        project: Some(project.name.clone()),
                        dir: worktree.join(project.mount_name()),
                        command: command.clone(),
                    });
                }
            }
        }
        WorkspaceBehavior::Polyrepo => {
            let projects = projects.unwrap_or_default();
            let groups = group_projects_by_repo_root(projects);
            let mut processed = HashSet::new();
            for project in projects {
                if project.setup.is_empty() {
                    continue;
                }
                let Some(root) = get_project_setup_path(project, &mut processed) else {
                    continue;
                };
                let Some(group) = groups.iter().find(|group| group.root == root) else {
                    continue;
                };
                for command in &project.setup {
                    steps.push(SetupStep {
                        project: Some(project.name.clone()),
                        dir: worktree.join(group.mount()),
                        command: command.clone(),
                    });
                }
            }
        }
    }
    steps
}

fn split_command(command: &str) -> Result<Vec<String>, SetupError> {
    shell_words::split(command).map_err(|source| SetupError::Parse {
        command: command.to_string(),
        source,
    })
}

/// Runs each step without a shell, stopping at the first failure.
pub fn run_setup(
    runner: &dyn CommandRunner,
    steps: &[SetupStep],
    timeout: Duration,
) -> Result<usize, SetupError> {
    let mut ran = 0;
    for step in steps {
        let words = split_command(&step.command)?;
        let Some((program, args)) = words.split_first() else {
            continue;
        };
        info!(command = %step.command, dir = %step.dir.display(), "running setup");
        let spec = CommandSpec::new(program, args.iter().cloned())
            .in_dir(&step.dir)
            .with_timeout(timeout)
            .mutating();
        let output = runner.run(&spec)?;
        if !output.success() {
            return Err(SetupError::Failed {
                command: step.command.clone(),
                dir: step.dir.clone(),
                detail: output.detail(),
            });
        }
        ran += 1;
    }
    Ok(ran)
}

/// Opens `path` with the configured IDE command.
pub fn launch_ide(runner: &dyn CommandRunner, command: &str, path: &Path) -> Result<(), SetupError> {
    let mut words = split_command(command)?;
    if words.is_empty() {
        return Ok(());
    }
    let program = words.remove(0);
    words.push(path.to_string_lossy().to_string());
    let spec = CommandSpec::new(&program, words)
        .in_dir(path)
        .with_timeout(IDE_TIMEOUT)
        .mutating();
    let output = runner.run(&spec)?;
    if !output.success() {
        return Err(SetupError::Failed {
            command: spec.display(),
            dir: path.to_path_buf(),
            detail: output.detail(),
        });
    }
    Ok(())
}
