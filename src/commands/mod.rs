//! Command implementations for the imagebump CLI.
//!
//! This module contains the business logic for each CLI command:
//! - `run` - the update pipeline over configured repositories
//! - `versions_*` - inspect and edit the digest review statuses
//! - `prs_*` - inspect and edit the tracked pull requests
//! - `check` - validate configuration and credentials

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::github::{GitHubClient, validate_github_user};
use crate::graph::GitRepository;
use crate::patcher::is_valid_digest;
use crate::registry::DockerHubClient;
use crate::store::{PrTracker, VersionStatus, VersionTracker};
use crate::updater::{RunReport, Updater};
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

// === run ===

impl Output for RunReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        if self.dry_run {
            lines.push("Dry run: nothing was written.".to_string());
        }
        if self.repos.is_empty() {
            lines.push("No repositories selected.".to_string());
        }
        for report in &self.repos {
            match &report.result {
                Ok(outcome) => lines.push(format!("{}: {}", report.repo, outcome)),
                Err(failure) => lines.push(format!("{}: FAILED at {}", report.repo, failure)),
            }
        }
        lines.join("\n")
    }
}

/// Run the update pipeline against the real registry, GitHub, and local clones.
pub fn run(config: &Config, only: &[String], dry_run: bool) -> Result<RunReport> {
    for name in only {
        if !config.repos.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "unknown repository {:?}; configured: {}",
                name,
                config.repos.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
    }

    let resolved = config::resolve_credentials(config)?;
    let credentials = resolved.credentials();
    tracing::debug!("Using GitHub token from {}", resolved.token_source());

    let http = &config.http;
    let registry = DockerHubClient::new(http.connect_timeout(), http.timeout(), http.retry_policy());
    let reviews = GitHubClient::new(
        &credentials,
        http.connect_timeout(),
        http.timeout(),
        http.retry_policy(),
    );

    let git_timeout = http.git_timeout();
    let mut updater =
        Updater::new(config, credentials, &registry, &reviews)?.with_dry_run(dry_run);
    let report = updater.run(only, |_, repo| {
        GitRepository::discover(&repo.dir).map(|r| r.with_network_timeout(git_timeout))
    });

    Ok(report)
}

// === versions ===

#[derive(Serialize)]
pub struct VersionEntry {
    pub digest: String,
    pub status: VersionStatus,
}

#[derive(Serialize)]
pub struct VersionList {
    pub versions: Vec<VersionEntry>,
}

impl Output for VersionList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.versions.is_empty() {
            return "No known versions.".to_string();
        }
        self.versions
            .iter()
            .map(|v| format!("{:<12} {}", v.status.as_str(), v.digest))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn versions_list(state_dir: &Path) -> Result<VersionList> {
    let tracker = VersionTracker::open_in(state_dir)?;
    Ok(VersionList {
        versions: tracker
            .iter()
            .map(|(digest, status)| VersionEntry {
                digest: digest.to_string(),
                status,
            })
            .collect(),
    })
}

#[derive(Serialize)]
pub struct VersionChanged {
    pub digest: String,
    /// Status before the change, if the digest was known
    pub previous: Option<VersionStatus>,
    /// Status after the change; `None` when removed
    pub status: Option<VersionStatus>,
}

impl Output for VersionChanged {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match (self.previous, self.status) {
            (_, Some(status)) => format!("{} is now {}", self.digest, status),
            (Some(_), None) => format!("Removed {}", self.digest),
            (None, None) => format!("{} was not tracked", self.digest),
        }
    }
}

pub fn versions_set(state_dir: &Path, digest: &str, status: &str) -> Result<VersionChanged> {
    if !is_valid_digest(digest) {
        return Err(Error::InvalidInput(format!(
            "invalid digest {:?}: expected sha256:<hex>",
            digest
        )));
    }
    let status = VersionStatus::parse(status).ok_or_else(|| {
        Error::InvalidInput(format!(
            "invalid status {:?}: expected unknown, verified, or blacklisted",
            status
        ))
    })?;

    let mut tracker = VersionTracker::open_in(state_dir)?;
    let previous = tracker.status(digest);
    tracker.set_status(digest, status)?;
    Ok(VersionChanged {
        digest: digest.to_string(),
        previous,
        status: Some(status),
    })
}

pub fn versions_rm(state_dir: &Path, digest: &str) -> Result<VersionChanged> {
    let mut tracker = VersionTracker::open_in(state_dir)?;
    let previous = tracker.remove(digest)?;
    Ok(VersionChanged {
        digest: digest.to_string(),
        previous,
        status: None,
    })
}

// === prs ===

#[derive(Serialize)]
pub struct TrackedPullRequest {
    pub repository: String,
    pub number: u64,
}

#[derive(Serialize)]
pub struct PullRequestList {
    pub pull_requests: Vec<TrackedPullRequest>,
}

impl Output for PullRequestList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.pull_requests.is_empty() {
            return "No tracked pull requests.".to_string();
        }
        self.pull_requests
            .iter()
            .map(|p| format!("{}#{}", p.repository, p.number))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn prs_list(state_dir: &Path) -> Result<PullRequestList> {
    let tracker = PrTracker::open_in(state_dir)?;
    Ok(PullRequestList {
        pull_requests: tracker
            .iter()
            .map(|(repository, number)| TrackedPullRequest {
                repository: repository.to_string(),
                number,
            })
            .collect(),
    })
}

#[derive(Serialize)]
pub struct PullRequestForgotten {
    pub repository: String,
    pub number: Option<u64>,
}

impl Output for PullRequestForgotten {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self.number {
            Some(n) => format!("No longer tracking {}#{}", self.repository, n),
            None => format!("{} had no tracked pull request", self.repository),
        }
    }
}

pub fn prs_forget(state_dir: &Path, repository: &str) -> Result<PullRequestForgotten> {
    let mut tracker = PrTracker::open_in(state_dir)?;
    let number = tracker.forget(repository)?;
    Ok(PullRequestForgotten {
        repository: repository.to_string(),
        number,
    })
}

// === check ===

#[derive(Serialize)]
pub struct RepoSummary {
    pub name: String,
    pub repository: String,
    pub dir: PathBuf,
    pub base_branch: String,
    pub config_path: String,
    pub patch_scope: String,
    pub require_verified: bool,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub state_dir: PathBuf,
    pub username: String,
    pub token: String,
    pub token_source: String,
    /// Login GitHub reported, when the token was validated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated_as: Option<String>,
    pub repos: Vec<RepoSummary>,
}

impl Output for CheckResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("State dir: {}", self.state_dir.display()),
            format!(
                "GitHub: {} (token {} from {})",
                self.username, self.token, self.token_source
            ),
        ];
        if let Some(login) = &self.authenticated_as {
            lines.push(format!("Token valid, authenticated as {}", login));
        }
        lines.push(format!("{} repositories:", self.repos.len()));
        for repo in &self.repos {
            lines.push(format!(
                "  {} -> {} [{}:{}] in {}{}",
                repo.name,
                repo.repository,
                repo.base_branch,
                repo.config_path,
                repo.dir.display(),
                if repo.require_verified {
                    " (verified only)"
                } else {
                    ""
                }
            ));
        }
        lines.join("\n")
    }
}

/// Validate configuration and credentials without touching any repository.
pub fn check(config: &Config, validate_token: bool) -> Result<CheckResult> {
    let resolved = config::resolve_credentials(config)?;

    let authenticated_as = if validate_token {
        let user = validate_github_user(&resolved.credentials())?;
        Some(user.login)
    } else {
        None
    };

    let mut repos = Vec::new();
    for (name, repo) in &config.repos {
        repos.push(RepoSummary {
            name: name.clone(),
            repository: repo.github_id()?,
            dir: repo.dir.clone(),
            base_branch: repo.base_branch.clone(),
            config_path: repo.config_path.clone(),
            patch_scope: repo.patch_scope.to_string(),
            require_verified: repo.require_verified,
        });
    }

    Ok(CheckResult {
        state_dir: config.state_dir.clone(),
        username: resolved.username.clone(),
        token: resolved.masked_token(),
        token_source: resolved.token_source().to_string(),
        authenticated_as,
        repos,
    })
}
