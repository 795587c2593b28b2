use thiserror::Error;

use crate::config::ConfigError;
use crate::git::GitError;
use crate::item::ItemError;
use crate::polyrepo::PolyrepoError;
use crate::pr::PrError;
use crate::runner::RunnerError;
use crate::setup::SetupError;
use crate::status::StatusError;
use crate::worktree::WorktreeError;

/// Failure of a start or done invocation.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Bad input, caught before anything is mutated.
    #[error("{0}")]
    Validation(String),
    /// The environment is not in a state the operation can start from.
    #[error("{0}")]
    Precondition(String),
    #[error("no pull request found for branch {branch}")]
    NoPullRequest { branch: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Polyrepo(#[from] PolyrepoError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Pr(#[from] PrError),
    #[error(transparent)]
    Setup(#[from] SetupError),
}

impl FlowError {
    pub fn is_validation(&self) -> bool {
        match self {
            FlowError::Validation(_) => true,
            FlowError::Item(ItemError::InvalidId(_)) => true,
            FlowError::Status(StatusError::UnknownStatus { .. })
            | FlowError::Status(StatusError::InvalidAction(_)) => true,
            FlowError::Worktree(WorktreeError::UnsafePath { .. }) => true,
            FlowError::Pr(PrError::InvalidStrategy(_)) => true,
            _ => false,
        }
    }

    /// 2 for input errors, 1 for every other failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_validation() {
            2
        } else {
            1
        }
    }
}
