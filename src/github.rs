//! GitHub API interactions for pull requests.
//!
//! This module provides:
//! - [`ReviewRequests`]: the seam the updater uses to check and open pull requests
//! - [`GitHubClient`]: the REST implementation, authenticated with Basic auth
//! - [`validate_github_user`]: confirms credentials via GET /user

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::graph::Credentials;
use crate::patcher::short_digest;
use crate::retry::{RetryPolicy, with_backoff};

/// GitHub API base URL
const GITHUB_API_BASE: &str = "https://api.github.com";

/// User-Agent header required by GitHub API
const USER_AGENT: &str = "imagebump";

const API_VERSION: &str = "2022-11-28";

/// Errors talking to the pull request API.
#[derive(Debug, Error)]
pub enum RequestClientError {
    /// Credentials are invalid or expired (401 Unauthorized)
    #[error("Invalid or expired token: GitHub returned 401 Unauthorized")]
    Unauthorized,

    /// Token lacks required permissions (403 Forbidden)
    #[error("Token lacks required permissions: GitHub returned 403 Forbidden")]
    Forbidden,

    /// Repository or pull request does not exist (404)
    #[error("Not found on GitHub: {0}")]
    NotFound(String),

    /// Any other HTTP status
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// Connection failure or timeout
    #[error("HTTP request failed: {0}")]
    Transport(String),

    /// Failed to parse response
    #[error("Failed to parse GitHub response: {0}")]
    ParseError(String),
}

impl RequestClientError {
    /// Timeouts, connection errors, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            RequestClientError::Transport(_) => true,
            RequestClientError::HttpError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A pull request to be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestDraft {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

impl PullRequestDraft {
    /// The standard pull request proposing `digest` from `branch` into `base`.
    pub fn for_digest(branch: &str, base: &str, digest: &str) -> Self {
        Self {
            head: branch.to_string(),
            base: base.to_string(),
            title: format!("Bump CI docker image to {}", short_digest(digest)),
            body: format!(
                "Update main docker image on CircleCI to `{}`.\n\nThis is an automated pull request.\n",
                digest
            ),
        }
    }
}

/// Checks and opens review requests on a hosting service.
pub trait ReviewRequests {
    /// Whether pull request `number` of `repo_id` (`owner/name`) is still open.
    fn is_open(&self, repo_id: &str, number: u64) -> Result<bool, RequestClientError>;

    /// Open a pull request and return its number.
    fn create(&self, repo_id: &str, draft: &PullRequestDraft) -> Result<u64, RequestClientError>;
}

/// Response fields of GET/POST /repos/{owner}/{repo}/pulls we care about.
#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub state: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// Request body of POST /repos/{owner}/{repo}/pulls.
#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
    maintainer_can_modify: bool,
}

/// Response from GitHub GET /user endpoint (only fields we care about).
#[derive(Debug, Deserialize)]
pub struct GitHubUser {
    /// GitHub login/username
    pub login: String,
    /// User ID
    pub id: u64,
    /// Display name (optional)
    pub name: Option<String>,
}

/// GitHub REST client.
pub struct GitHubClient {
    agent: ureq::Agent,
    api_base: String,
    authorization: String,
    retry: RetryPolicy,
}

impl GitHubClient {
    pub fn new(
        credentials: &Credentials,
        connect_timeout: Duration,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            api_base: GITHUB_API_BASE.to_string(),
            authorization: basic_authorization(credentials),
            retry,
        }
    }

    /// Point the client at another API base (GitHub Enterprise, tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn pulls_url(&self, repo_id: &str) -> String {
        format!("{}/repos/{}/pulls", self.api_base, repo_id)
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        self.agent
            .request(method, url)
            .set("Authorization", &self.authorization)
            .set("Accept", "application/vnd.github+json")
            .set("X-GitHub-Api-Version", API_VERSION)
    }

    fn get_pull_request(&self, repo_id: &str, number: u64) -> Result<PullRequest, RequestClientError> {
        let url = format!("{}/{}", self.pulls_url(repo_id), number);
        match self.request("GET", &url).call() {
            Ok(resp) => resp
                .into_json()
                .map_err(|e| RequestClientError::ParseError(e.to_string())),
            Err(e) => Err(map_ureq_error(e, &format!("{}#{}", repo_id, number))),
        }
    }

    /// Authenticated user, confirming the credentials work.
    pub fn current_user(&self) -> Result<GitHubUser, RequestClientError> {
        let url = format!("{}/user", self.api_base);
        match self.request("GET", &url).call() {
            Ok(resp) => resp
                .into_json()
                .map_err(|e| RequestClientError::ParseError(e.to_string())),
            Err(e) => Err(map_ureq_error(e, "user")),
        }
    }
}

impl ReviewRequests for GitHubClient {
    fn is_open(&self, repo_id: &str, number: u64) -> Result<bool, RequestClientError> {
        tracing::debug!("Fetching pull request status {}#{}", repo_id, number);
        let what = format!("pull request status {}#{}", repo_id, number);
        let pr = with_backoff(&self.retry, &what, RequestClientError::is_transient, || {
            self.get_pull_request(repo_id, number)
        })?;
        tracing::debug!("PR {}#{} is {}", repo_id, pr.number, pr.state);
        Ok(pr.state == "open")
    }

    fn create(&self, repo_id: &str, draft: &PullRequestDraft) -> Result<u64, RequestClientError> {
        tracing::info!("Creating PR for {} ({})", draft.head, repo_id);
        let payload = CreatePullRequest {
            title: &draft.title,
            head: &draft.head,
            base: &draft.base,
            body: &draft.body,
            maintainer_can_modify: true,
        };

        // Not retried: a lost response after a successful POST would open a duplicate.
        let pr: PullRequest = match self.request("POST", &self.pulls_url(repo_id)).send_json(&payload) {
            Ok(resp) => resp
                .into_json()
                .map_err(|e| RequestClientError::ParseError(e.to_string()))?,
            Err(e) => return Err(map_ureq_error(e, repo_id)),
        };

        tracing::info!(
            "Created PR {}",
            pr.html_url
                .clone()
                .unwrap_or_else(|| format!("{}#{}", repo_id, pr.number))
        );
        Ok(pr.number)
    }
}

/// Validate credentials via the GET /user endpoint.
///
/// # Example
/// ```ignore
/// use imagebump::github::validate_github_user;
/// use imagebump::graph::Credentials;
///
/// let creds = Credentials::new("image-bot", "ghp_xxxxxxxxxxxx");
/// match validate_github_user(&creds) {
///     Ok(user) => println!("Authenticated as {}", user.login),
///     Err(e) => eprintln!("Token validation failed: {}", e),
/// }
/// ```
pub fn validate_github_user(credentials: &Credentials) -> Result<GitHubUser, RequestClientError> {
    GitHubClient::new(
        credentials,
        Duration::from_secs(10),
        Duration::from_secs(30),
        RetryPolicy::default(),
    )
    .current_user()
}

/// `Basic <base64(username:token)>`
pub fn basic_authorization(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username, credentials.token);
    format!("Basic {}", STANDARD.encode(raw))
}

fn map_ureq_error(error: ureq::Error, what: &str) -> RequestClientError {
    match error {
        ureq::Error::Status(401, _) => RequestClientError::Unauthorized,
        ureq::Error::Status(403, _) => RequestClientError::Forbidden,
        ureq::Error::Status(404, _) => RequestClientError::NotFound(what.to_string()),
        ureq::Error::Status(status, resp) => RequestClientError::HttpError {
            status,
            body: resp.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(t) => RequestClientError::Transport(t.to_string()),
    }
}
