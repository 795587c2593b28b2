//! Pull request completion primitives: readiness checks, merge, and branch
//! removal on the PR host. The host itself sits behind [`PullRequestProvider`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::item::{update_item_fields, ItemError, MergeRecord};
use crate::status::expand_template;

#[derive(Debug, Error)]
pub enum PrError {
    #[error("request to PR host failed: {0}")]
    Transport(String),
    #[error("PR host returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("PR host rejected credentials: {0}")]
    Auth(String),
    #[error("not found on PR host: {0}")]
    NotFound(String),
    #[error("unexpected response from PR host: {0}")]
    InvalidResponse(String),
    #[error("no PR host token: set {env}")]
    MissingToken { env: String },
    #[error("cannot determine owner/repo from remote URL {0:?}; set [github] owner and repo")]
    UnknownRepository(String),
    #[error("pull request #{number} has no head commit to check")]
    MissingHeadSha { number: u64 },
    #[error("pull request #{number} is not mergeable; resolve conflicts or pass --force")]
    NotMergeable { number: u64 },
    #[error("pull request #{number} checks are {state}{detail}; pass --force to merge anyway")]
    ChecksFailed {
        number: u64,
        state: String,
        detail: String,
    },
    #[error("pull request #{number} has {count} unresolved review comment(s); pass --force to merge anyway")]
    UnresolvedComments { number: u64, count: usize },
    #[error("merge requested without a pull request")]
    MissingPullRequest,
    #[error("pull request #{number} was not merged: {message}")]
    MergeRejected { number: u64, message: String },
    #[error("unknown merge strategy {0:?} (expected squash, merge or rebase)")]
    InvalidStrategy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Owner and repository from an https, ssh:// or scp-style remote URL.
pub fn parse_remote_url(url: &str) -> Option<RepoSlug> {
    let re = Regex::new(r"^(?:[a-z+]+://)?(?:[^@/]+@)?[^:/]+(?::\d+)?[:/](.+?)(?:\.git)?/?$").ok()?;
    let path = re.captures(url.trim())?.get(1)?.as_str();
    let mut parts = path.rsplitn(2, '/');
    let repo = parts.next()?.to_string();
    let owner = parts.next()?.rsplit('/').next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some(RepoSlug { owner, repo })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub head_ref: String,
    pub head_sha: Option<String>,
    /// `None` while the host is still computing mergeability.
    pub mergeable: Option<bool>,
    pub merged_at: Option<String>,
    pub merge_commit_sha: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Success,
    Pending,
    Failure,
    Error,
    #[serde(other)]
    Unknown,
}

impl CheckState {
    pub fn is_failing(&self) -> bool {
        matches!(self, CheckState::Failure | CheckState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Success => "success",
            CheckState::Pending => "pending",
            CheckState::Failure => "failure",
            CheckState::Error => "error",
            CheckState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub context: String,
    pub state: CheckState,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedStatus {
    pub state: CheckState,
    #[serde(default)]
    pub statuses: Vec<CheckStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewComment {
    pub id: u64,
    pub author: Option<String>,
    pub path: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = PrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "squash" => Ok(MergeStrategy::Squash),
            "merge" => Ok(MergeStrategy::Merge),
            "rebase" => Ok(MergeStrategy::Rebase),
            _ => Err(PrError::InvalidStrategy(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeRequest {
    pub merge_method: MergeStrategy,
    pub commit_title: String,
    pub commit_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    #[serde(default)]
    pub sha: Option<String>,
    pub merged: bool,
    #[serde(default)]
    pub message: String,
}

/// Remote PR host operations. Results are never cached between calls.
pub trait PullRequestProvider {
    /// Open PR for `branch`, else the most recently merged one.
    fn find_pull_request(
        &self,
        repo: &RepoSlug,
        branch: &str,
    ) -> Result<Option<PullRequest>, PrError>;
    fn combined_status(&self, repo: &RepoSlug, sha: &str) -> Result<CombinedStatus, PrError>;
    fn review_comments(&self, repo: &RepoSlug, number: u64) -> Result<Vec<ReviewComment>, PrError>;
    fn merge(
        &self,
        repo: &RepoSlug,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, PrError>;
    /// Deletes `refs/heads/<branch>`; absent refs surface as errors here.
    fn delete_branch_ref(&self, repo: &RepoSlug, branch: &str) -> Result<(), PrError>;
}

impl<T: PullRequestProvider + ?Sized> PullRequestProvider for &T {
    fn find_pull_request(
        &self,
        repo: &RepoSlug,
        branch: &str,
    ) -> Result<Option<PullRequest>, PrError> {
        (**self).find_pull_request(repo, branch)
    }

    fn combined_status(&self, repo: &RepoSlug, sha: &str) -> Result<CombinedStatus, PrError> {
        (**self).combined_status(repo, sha)
    }

    fn review_comments(&self, repo: &RepoSlug, number: u64) -> Result<Vec<ReviewComment>, PrError> {
        (**self).review_comments(repo, number)
    }

    fn merge(
        &self,
        repo: &RepoSlug,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, PrError> {
        (**self).merge(repo, number, request)
    }

    fn delete_branch_ref(&self, repo: &RepoSlug, branch: &str) -> Result<(), PrError> {
        (**self).delete_branch_ref(repo, branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrCheckOptions {
    pub require_checks: bool,
    pub require_no_comments: bool,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PrCheckReport {
    pub mergeable: Option<bool>,
    /// `None` when the status call was skipped.
    pub status: Option<CheckState>,
    pub failing_checks: Vec<String>,
    pub review_comments: Option<usize>,
    /// Failures that `--force` let through.
    pub overridden: Vec<String>,
}

impl PrCheckReport {
    fn fail_or_override(&mut self, force: bool, err: PrError) -> Result<(), PrError> {
        if force {
            warn!(%err, "overridden by --force");
            self.overridden.push(err.to_string());
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Evaluates merge readiness. Without `force` the first failing check is
/// returned as an error; with it every check still runs and failures are
/// collected in `overridden`.
pub fn run_pr_checks(
    provider: &dyn PullRequestProvider,
    repo: &RepoSlug,
    pr: &PullRequest,
    options: &PrCheckOptions,
) -> Result<PrCheckReport, PrError> {
    let mut report = PrCheckReport {
        mergeable: pr.mergeable,
        ..PrCheckReport::default()
    };
    let force = options.force;
    let sha = pr.head_sha.as_deref().filter(|sha| !sha.is_empty());
    if sha.is_none() {
        report.fail_or_override(force, PrError::MissingHeadSha { number: pr.number })?;
    }

    match pr.mergeable {
        Some(true) => debug!(number = pr.number, "mergeable; skipping status lookup"),
        Some(false) => {
            report.fail_or_override(force, PrError::NotMergeable { number: pr.number })?
        }
        None => {}
    }

    if pr.mergeable != Some(true) && options.require_checks {
        if let Some(sha) = sha {
            let combined = provider.combined_status(repo, sha)?;
            report.status = Some(combined.state);
            report.failing_checks = combined
                .statuses
                .iter()
                .filter(|check| check.state.is_failing())
                .map(|check| check.context.clone())
                .collect();
            let failed = match combined.state {
                CheckState::Success => false,
                CheckState::Failure | CheckState::Error => true,
                CheckState::Pending | CheckState::Unknown => !report.failing_checks.is_empty(),
            };
            if failed {
                let detail = if report.failing_checks.is_empty() {
                    String::new()
                } else {
                    format!(" (failing: {})", report.failing_checks.join(", "))
                };
                let err = PrError::ChecksFailed {
                    number: pr.number,
                    state: combined.state.as_str().to_string(),
                    detail,
                };
                report.fail_or_override(force, err)?;
            }
        }
    }

    if options.require_no_comments {
        let comments = provider.review_comments(repo, pr.number)?;
        report.review_comments = Some(comments.len());
        if !comments.is_empty() {
            let err = PrError::UnresolvedComments {
                number: pr.number,
                count: comments.len(),
            };
            report.fail_or_override(force, err)?;
        }
    }
    Ok(report)
}

pub fn build_done_commit_message(template: &str, id: &str, title: &str) -> String {
    expand_template(template, id, None, Some(title), "")
}

/// Merges `pr` with `strategy`. The first line of `commit_message` becomes
/// the commit title, the rest its body.
pub fn merge_pull_request(
    provider: &dyn PullRequestProvider,
    repo: &RepoSlug,
    pr: Option<&PullRequest>,
    strategy: MergeStrategy,
    commit_message: &str,
) -> Result<MergeOutcome, PrError> {
    let pr = pr.ok_or(PrError::MissingPullRequest)?;
    let (title, body) = match commit_message.split_once('\n') {
        Some((title, body)) => (title.trim(), body.trim()),
        None => (commit_message.trim(), ""),
    };
    let request = MergeRequest {
        merge_method: strategy,
        commit_title: title.to_string(),
        commit_message: body.to_string(),
    };
    info!(number = pr.number, %strategy, "merging pull request");
    let outcome = provider.merge(repo, pr.number, &request)?;
    if !outcome.merged {
        return Err(PrError::MergeRejected {
            number: pr.number,
            message: outcome.message,
        });
    }
    Ok(outcome)
}

fn is_missing_ref(err: &PrError) -> bool {
    match err {
        PrError::NotFound(_) => true,
        PrError::Api { status: 422, message } => message
            .to_ascii_lowercase()
            .contains("reference does not exist"),
        _ => false,
    }
}

/// Deletes the remote branch. An already-deleted ref counts as success;
/// returns whether anything was deleted.
pub fn delete_branch(
    provider: &dyn PullRequestProvider,
    repo: &RepoSlug,
    branch: &str,
) -> Result<bool, PrError> {
    match provider.delete_branch_ref(repo, branch) {
        Ok(()) => {
            info!(branch, "deleted remote branch");
            Ok(true)
        }
        Err(err) if is_missing_ref(&err) => {
            debug!(branch, "remote branch already absent");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Records the merge on the work item, leaving every other field and the body
/// as they are.
pub fn update_work_item_done_metadata(path: &Path, record: &MergeRecord) -> Result<(), ItemError> {
    update_item_fields(path, &record.fields())
}
