//! GitHub REST implementation of [`PullRequestProvider`].

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::LINK;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ItemflowConfig;
use crate::pr::{
    CombinedStatus, MergeOutcome, MergeRequest, PrError, PullRequest, PullRequestProvider,
    RepoSlug, ReviewComment,
};

pub const API_TIMEOUT: Duration = Duration::from_secs(30);
const API_VERSION: &str = "2022-11-28";
/// Upper bound on pages followed for one listing.
const MAX_PAGES: usize = 50;

/// GitHub API client.
pub struct GitHubClient {
    /// API base URL, without trailing slash
    base_url: String,

    token: Option<String>,

    /// Variable the token was read from, for error messages
    token_env: String,

    client: Client,

    /// Mutating requests are printed instead of sent
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    name: String,
    #[serde(default)]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    state: String,
    head: ApiRef,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    merged_at: Option<String>,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

impl From<ApiPullRequest> for PullRequest {
    fn from(api: ApiPullRequest) -> Self {
        PullRequest {
            number: api.number,
            title: api.title,
            state: api.state,
            head_ref: api.head.name,
            head_sha: api.head.sha,
            mergeable: api.mergeable,
            merged_at: api.merged_at,
            merge_commit_sha: api.merge_commit_sha,
            html_url: api.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    user: Option<ApiUser>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl GitHubClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        token_env: &str,
        dry_run: bool,
    ) -> Result<Self, PrError> {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent(concat!("itemflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| PrError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.trim().is_empty()),
            token_env: token_env.to_string(),
            client,
            dry_run,
        })
    }

    /// Reads the token from the configured environment variable. A missing
    /// token only matters once a mutating request is made.
    pub fn from_config(config: &ItemflowConfig, dry_run: bool) -> Result<Self, PrError> {
        let token_env = config.github_token_env();
        let token = std::env::var(token_env).ok();
        Self::new(config.github_api_url(), token, token_env, dry_run)
    }

    fn repo_url(&self, repo: &RepoSlug) -> String {
        format!("{}/repos/{}/{}", self.base_url, repo.owner, repo.repo)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    fn require_token(&self) -> Result<(), PrError> {
        if self.token.is_none() {
            return Err(PrError::MissingToken {
                env: self.token_env.clone(),
            });
        }
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T, PrError> {
        debug!(url, "GET");
        let response = self
            .authorized(self.client.get(url).query(query))
            .send()
            .map_err(|err| PrError::Transport(err.to_string()))?;
        let response = check_status(response)?;
        response
            .json()
            .map_err(|err| PrError::InvalidResponse(err.to_string()))
    }

    /// GETs a list endpoint and every page after it, following the
    /// `Link: rel="next"` header.
    fn get_all<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, PrError> {
        let mut items = Vec::new();
        let mut request = self.client.get(url).query(query);
        debug!(url, "GET");
        for _ in 0..MAX_PAGES {
            let response = self
                .authorized(request)
                .send()
                .map_err(|err| PrError::Transport(err.to_string()))?;
            let response = check_status(response)?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_link);
            let page: Vec<T> = response
                .json()
                .map_err(|err| PrError::InvalidResponse(err.to_string()))?;
            items.extend(page);
            match next {
                Some(next) => {
                    debug!(url = %next, "GET next page");
                    request = self.client.get(next);
                }
                None => return Ok(items),
            }
        }
        warn!(url, pages = MAX_PAGES, "stopped following pagination links");
        Ok(items)
    }

    fn get_pull(&self, repo: &RepoSlug, number: u64) -> Result<PullRequest, PrError> {
        let url = format!("{}/pulls/{number}", self.repo_url(repo));
        let pull: ApiPullRequest = self.get(&url, &[])?;
        Ok(pull.into())
    }
}

fn check_status(response: Response) -> Result<Response, PrError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response
        .text()
        .unwrap_or_else(|_| "Unknown error".to_string());
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PrError::Auth(message),
        StatusCode::NOT_FOUND => PrError::NotFound(message),
        _ => PrError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

/// Target of the `rel="next"` entry in a `Link` header.
fn next_page_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')?
            .strip_suffix('>')
            .map(str::to_string)
    })
}

/// An open PR wins; otherwise the most recently merged one.
fn choose_pull(mut pulls: Vec<ApiPullRequest>) -> Option<ApiPullRequest> {
    if let Some(idx) = pulls.iter().position(|pull| pull.state == "open") {
        return Some(pulls.swap_remove(idx));
    }
    pulls
        .into_iter()
        .filter(|pull| pull.merged_at.is_some())
        .max_by(|a, b| a.merged_at.cmp(&b.merged_at))
}

impl PullRequestProvider for GitHubClient {
    fn find_pull_request(
        &self,
        repo: &RepoSlug,
        branch: &str,
    ) -> Result<Option<PullRequest>, PrError> {
        let url = format!("{}/pulls", self.repo_url(repo));
        let head = format!("{}:{}", repo.owner, branch);
        let pulls: Vec<ApiPullRequest> =
            self.get(&url, &[("head", head.as_str()), ("state", "all"), ("per_page", "30")])?;
        let Some(chosen) = choose_pull(pulls) else {
            return Ok(None);
        };
        if chosen.merged_at.is_some() {
            return Ok(Some(chosen.into()));
        }
        // The list endpoint omits mergeability; the detail call computes it.
        self.get_pull(repo, chosen.number).map(Some)
    }

    fn combined_status(&self, repo: &RepoSlug, sha: &str) -> Result<CombinedStatus, PrError> {
        let url = format!("{}/commits/{sha}/status", self.repo_url(repo));
        self.get(&url, &[])
    }

    fn review_comments(&self, repo: &RepoSlug, number: u64) -> Result<Vec<ReviewComment>, PrError> {
        let url = format!("{}/pulls/{number}/comments", self.repo_url(repo));
        let comments: Vec<ApiComment> = self.get_all(&url, &[("per_page", "100")])?;
        Ok(comments
            .into_iter()
            .map(|comment| ReviewComment {
                id: comment.id,
                author: comment.user.map(|user| user.login),
                path: comment.path,
                body: comment.body,
            })
            .collect())
    }

    fn merge(
        &self,
        repo: &RepoSlug,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, PrError> {
        let url = format!("{}/pulls/{number}/merge", self.repo_url(repo));
        if self.dry_run {
            eprintln!("[dry-run] PUT {url} ({})", request.merge_method);
            return Ok(MergeOutcome {
                sha: None,
                merged: true,
                message: "dry run".to_string(),
            });
        }
        self.require_token()?;
        debug!(url, "PUT");
        let response = self
            .authorized(self.client.put(&url).json(request))
            .send()
            .map_err(|err| PrError::Transport(err.to_string()))?;
        check_status(response)?
            .json()
            .map_err(|err| PrError::InvalidResponse(err.to_string()))
    }

    fn delete_branch_ref(&self, repo: &RepoSlug, branch: &str) -> Result<(), PrError> {
        let url = format!("{}/git/refs/heads/{branch}", self.repo_url(repo));
        if self.dry_run {
            eprintln!("[dry-run] DELETE {url}");
            return Ok(());
        }
        self.require_token()?;
        debug!(url, "DELETE");
        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .map_err(|err| PrError::Transport(err.to_string()))?;
        check_status(response)?;
        Ok(())
    }
}
