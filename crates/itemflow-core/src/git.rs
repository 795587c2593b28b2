use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::runner::{
    CommandOutput, CommandRunner, CommandSpec, RunnerError, LOCAL_TIMEOUT, MUTATION_TIMEOUT,
    NETWORK_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("git {args} failed in {dir}: {detail}")]
    Failed {
        args: String,
        dir: String,
        detail: String,
    },
    #[error("git {args} printed unexpected output: {output:?}")]
    UnexpectedOutput { args: String, output: String },
}

/// Git invocations against one checkout. Every call passes its working
/// directory explicitly and never goes through a shell.
pub struct Git<'r> {
    runner: &'r dyn CommandRunner,
    repo_path: PathBuf,
}

impl<'r> Git<'r> {
    pub fn new(runner: &'r dyn CommandRunner, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn runner(&self) -> &'r dyn CommandRunner {
        self.runner
    }

    pub fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    /// Same runner, different checkout.
    pub fn at(&self, repo_path: impl Into<PathBuf>) -> Git<'r> {
        Git::new(self.runner, repo_path)
    }

    fn spec(&self, args: &[&str], timeout: Duration) -> CommandSpec {
        CommandSpec::new("git", args.iter().copied())
            .in_dir(&self.repo_path)
            .with_timeout(timeout)
    }

    /// Read-only query; the caller inspects the exit status.
    pub fn query(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        Ok(self.runner.run(&self.spec(args, LOCAL_TIMEOUT))?)
    }

    /// Read-only query that must succeed; returns trimmed stdout.
    pub fn read(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.query(args)?;
        self.ensure_success(args, &output)?;
        Ok(output.stdout.trim().to_string())
    }

    /// Local mutation, skipped by the runner in dry-run mode.
    pub fn mutate_raw(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        Ok(self
            .runner
            .run(&self.spec(args, MUTATION_TIMEOUT).mutating())?)
    }

    pub fn mutate(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let output = self.mutate_raw(args)?;
        self.ensure_success(args, &output)?;
        Ok(output)
    }

    /// Remote-facing mutation (pull, push) with the network timeout.
    pub fn network(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let output = self
            .runner
            .run(&self.spec(args, NETWORK_TIMEOUT).mutating())?;
        self.ensure_success(args, &output)?;
        Ok(output)
    }

    fn ensure_success(&self, args: &[&str], output: &CommandOutput) -> Result<(), GitError> {
        if output.success() {
            return Ok(());
        }
        Err(GitError::Failed {
            args: args.join(" "),
            dir: self.repo_path.display().to_string(),
            detail: output.detail(),
        })
    }

    pub fn show_toplevel(&self) -> Result<PathBuf, GitError> {
        self.read(&["rev-parse", "--show-toplevel"])
            .map(PathBuf::from)
    }

    /// Branch checked out in this checkout, `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let raw = self.read(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if raw.is_empty() || raw == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }

    pub fn ref_exists(&self, refname: &str) -> Result<bool, GitError> {
        let output = self.query(&["rev-parse", "--verify", "--quiet", refname])?;
        Ok(output.success())
    }

    pub fn local_branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    pub fn remote_url(&self, remote: &str) -> Result<String, GitError> {
        self.read(&["remote", "get-url", remote])
    }
}
