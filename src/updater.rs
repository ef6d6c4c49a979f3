//! Per-repository update pipeline.
//!
//! For each configured repository the [`Updater`] walks a linear sequence of
//! gates and actions, stopping at the first gate that says there is nothing
//! to do:
//!
//! 1. a tracked pull request that is still open
//! 2. fetch the base branch and extract the pinned image
//! 3. look up the latest digest for that image
//! 4. unchanged digest
//! 5. blacklisted (or, with `require_verified`, unreviewed) digest
//! 6. update branch already present
//! 7. patch, write blob, splice tree, commit
//! 8. create the branch and push it
//! 9. open the pull request and remember its number
//!
//! A failure at any step ends that repository only; [`Updater::run`] moves on
//! to the next one and reports every outcome.

use serde::Serialize;
use serde::ser::SerializeStruct;

use crate::config::{Config, RepoConfig};
use crate::github::{PullRequestDraft, ReviewRequests};
use crate::graph::{
    Credentials, FileMode, GraphError, NewCommit, ObjectId, Signature, VersionGraph,
    remote_tracking_ref,
};
use crate::patcher::{ConfigDocument, is_valid_digest, short_digest};
use crate::registry::{DigestResolver, RegistryError};
use crate::retry::{RetryPolicy, with_backoff};
use crate::store::{PrTracker, VersionStatus, VersionTracker};
use crate::{Error, Result};

/// Where in the pipeline a repository stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Open,
    CheckTrackedPr,
    Fetch,
    ReadConfig,
    Extract,
    ResolveDigest,
    CheckVersion,
    CheckBranch,
    Commit,
    CreateBranch,
    Push,
    OpenRequest,
    RecordRequest,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Open => "open",
            Step::CheckTrackedPr => "check_tracked_pr",
            Step::Fetch => "fetch",
            Step::ReadConfig => "read_config",
            Step::Extract => "extract",
            Step::ResolveDigest => "resolve_digest",
            Step::CheckVersion => "check_version",
            Step::CheckBranch => "check_branch",
            Step::Commit => "commit",
            Step::CreateBranch => "create_branch",
            Step::Push => "push",
            Step::OpenRequest => "open_request",
            Step::RecordRequest => "record_request",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error together with the step it happened in.
#[derive(Debug)]
pub struct Failure {
    pub step: Step,
    pub error: Error,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

/// Attach a [`Step`] to a fallible call.
trait StepContext<T> {
    fn at(self, step: Step) -> std::result::Result<T, Failure>;
}

impl<T, E: Into<Error>> StepContext<T> for std::result::Result<T, E> {
    fn at(self, step: Step) -> std::result::Result<T, Failure> {
        self.map_err(|e| Failure {
            step,
            error: e.into(),
        })
    }
}

/// How a repository run ended without error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// A previously opened pull request is still waiting for review
    PullRequestOpen { number: u64 },
    /// The pinned digest is already the latest
    Unchanged { digest: String },
    /// The latest digest may not be proposed
    Rejected { digest: String, status: VersionStatus },
    /// The update branch exists from an earlier run
    BranchExists { branch: String },
    /// Dry run stopped before writing anything
    DryRun { branch: String, digest: String },
    /// A new branch was pushed and a pull request opened
    Proposed {
        branch: String,
        digest: String,
        commit: ObjectId,
        pull_request: u64,
    },
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::PullRequestOpen { number } => {
                write!(f, "pull request #{} still open", number)
            }
            Outcome::Unchanged { digest } => write!(f, "up to date at {}", short_digest(digest)),
            Outcome::Rejected { digest, status } => {
                write!(f, "{} is {}, not proposing", short_digest(digest), status)
            }
            Outcome::BranchExists { branch } => write!(f, "branch {} already exists", branch),
            Outcome::DryRun { branch, digest } => {
                write!(f, "would propose {} on {}", short_digest(digest), branch)
            }
            Outcome::Proposed {
                branch,
                digest,
                pull_request,
                ..
            } => write!(
                f,
                "proposed {} on {} as pull request #{}",
                short_digest(digest),
                branch,
                pull_request
            ),
        }
    }
}

/// Result for one repository.
#[derive(Debug)]
pub struct RepoReport {
    pub repo: String,
    pub result: std::result::Result<Outcome, Failure>,
}

impl Serialize for RepoReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RepoReport", 3)?;
        s.serialize_field("repo", &self.repo)?;
        match &self.result {
            Ok(outcome) => {
                s.serialize_field("ok", &true)?;
                s.serialize_field("outcome", outcome)?;
            }
            Err(failure) => {
                s.serialize_field("ok", &false)?;
                s.serialize_field("step", &failure.step)?;
                s.serialize_field("error", &failure.error.to_string())?;
            }
        }
        s.end()
    }
}

/// Results for every repository attempted.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub repos: Vec<RepoReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.repos.iter().any(|r| r.result.is_err())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Failure)> {
        self.repos
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|f| (r.repo.as_str(), f)))
    }

    pub fn get(&self, repo: &str) -> Option<&RepoReport> {
        self.repos.iter().find(|r| r.repo == repo)
    }
}

/// `<prefix><short digest>`
pub fn branch_name(prefix: &str, digest: &str) -> String {
    format!("{}{}", prefix, short_digest(digest))
}

pub fn commit_message(digest: &str) -> String {
    format!("Update CI docker image to {}", short_digest(digest))
}

/// Runs the update pipeline over configured repositories.
pub struct Updater<'a> {
    config: &'a Config,
    credentials: Credentials,
    registry: &'a dyn DigestResolver,
    reviews: &'a dyn ReviewRequests,
    prs: PrTracker,
    versions: VersionTracker,
    retry: RetryPolicy,
    dry_run: bool,
}

impl<'a> Updater<'a> {
    /// Open the tracking stores under `config.state_dir`.
    pub fn new(
        config: &'a Config,
        credentials: Credentials,
        registry: &'a dyn DigestResolver,
        reviews: &'a dyn ReviewRequests,
    ) -> Result<Self> {
        Ok(Self {
            config,
            credentials,
            registry,
            reviews,
            prs: PrTracker::open_in(&config.state_dir)?,
            versions: VersionTracker::open_in(&config.state_dir)?,
            retry: config.http.retry_policy(),
            dry_run: false,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stop before any write and report what would be proposed.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn prs(&self) -> &PrTracker {
        &self.prs
    }

    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    /// Run every repository (or only those named in `only`), in name order.
    ///
    /// `open` produces the version graph for a repository. Failures are
    /// logged and collected; they never stop the remaining repositories.
    pub fn run<G, F>(&mut self, only: &[String], mut open: F) -> RunReport
    where
        G: VersionGraph,
        F: FnMut(&str, &RepoConfig) -> std::result::Result<G, GraphError>,
    {
        let config = self.config;
        let mut report = RunReport {
            dry_run: self.dry_run,
            repos: Vec::new(),
        };

        for (name, repo) in &config.repos {
            if !only.is_empty() && !only.iter().any(|o| o == name) {
                continue;
            }

            let span = tracing::info_span!("repo", repo = %name);
            let _enter = span.enter();

            let result = open(name.as_str(), repo)
                .at(Step::Open)
                .and_then(|mut graph| self.run_repo(name.as_str(), repo, &mut graph));

            match &result {
                Ok(outcome) => tracing::info!("{}", outcome),
                Err(failure) => {
                    tracing::error!(step = %failure.step, "{}: {}", name, failure)
                }
            }

            report.repos.push(RepoReport {
                repo: name.clone(),
                result,
            });
        }

        report
    }

    /// Run the pipeline for one repository against `graph`.
    pub fn run_repo(
        &mut self,
        name: &str,
        repo: &RepoConfig,
        graph: &mut dyn VersionGraph,
    ) -> std::result::Result<Outcome, Failure> {
        let repo_id = repo.github_id().at(Step::CheckTrackedPr)?;

        if let Some(number) = self.prs.pull_request_for(&repo_id) {
            if self.reviews.is_open(&repo_id, number).at(Step::CheckTrackedPr)? {
                return Ok(Outcome::PullRequestOpen { number });
            }
            tracing::info!("PR {}#{} is closed, no longer tracking it", repo_id, number);
            if !self.dry_run {
                self.prs.forget(&repo_id).at(Step::CheckTrackedPr)?;
            }
        }

        let what = format!("fetch of {} from {}", repo.base_branch, repo.url);
        with_backoff(&self.retry, &what, GraphError::is_transient, || {
            graph.fetch(&repo.url, &self.credentials, &repo.base_branch)
        })
        .at(Step::Fetch)?;

        let base_ref = remote_tracking_ref(&repo.base_branch);
        let base_commit = graph.resolve_ref(&base_ref).at(Step::ReadConfig)?;
        let bytes = graph
            .read_file_at_ref(&base_ref, &repo.config_path)
            .at(Step::ReadConfig)?;
        let content = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidInput(format!("{} is not UTF-8: {}", repo.config_path, e)))
            .at(Step::ReadConfig)?;

        let document = ConfigDocument::parse(content, repo.repository_pattern())
            .at(Step::Extract)?
            .with_scope(repo.patch_scope);
        let image = document.image();
        tracing::debug!("{} pins {}", repo.config_path, image);

        let digest = self
            .registry
            .latest_digest(&image.repository, &image.tag)
            .at(Step::ResolveDigest)?;
        if !is_valid_digest(&digest) {
            return Err(RegistryError::InvalidDigest(digest)).at(Step::ResolveDigest);
        }

        if image.digest.as_deref() == Some(digest.as_str()) {
            return Ok(Outcome::Unchanged { digest });
        }

        let status = match self.versions.status(&digest) {
            Some(status) => status,
            None => {
                tracing::info!("First sighting of {}, recording as unknown", digest);
                if !self.dry_run {
                    self.versions
                        .set_status(&digest, VersionStatus::Unknown)
                        .at(Step::CheckVersion)?;
                }
                VersionStatus::Unknown
            }
        };
        let allowed = match status {
            VersionStatus::Blacklisted => false,
            VersionStatus::Unknown => !repo.require_verified,
            VersionStatus::Verified => true,
        };
        if !allowed {
            return Ok(Outcome::Rejected { digest, status });
        }

        let branch = branch_name(&repo.branch_prefix, &digest);
        if graph.branch_exists(&branch).at(Step::CheckBranch)? {
            return Ok(Outcome::BranchExists { branch });
        }

        if self.dry_run {
            return Ok(Outcome::DryRun { branch, digest });
        }

        let patched = document.patch(&digest);
        let blob = graph.write_blob(patched.as_bytes()).at(Step::Commit)?;
        let base_tree = graph.tree_of(&base_commit).at(Step::Commit)?;
        let tree = graph
            .splice_into_tree(&base_tree, &repo.config_path, &blob, FileMode::Blob)
            .at(Step::Commit)?;
        let signature = Signature::now(&self.config.committer_for(repo));
        let commit = graph
            .create_commit(&NewCommit {
                tree,
                parents: vec![base_commit],
                author: signature.clone(),
                committer: signature,
                message: commit_message(&digest),
            })
            .at(Step::Commit)?;
        tracing::info!(branch = %branch, "Committed {} as {}", short_digest(&digest), commit.short());

        match graph.create_branch(&branch, &commit) {
            Ok(()) => {}
            Err(GraphError::AlreadyExists(_)) => return Ok(Outcome::BranchExists { branch }),
            Err(e) => return Err(e).at(Step::CreateBranch),
        }

        let what = format!("push of {} to {}", branch, repo.url);
        with_backoff(&self.retry, &what, GraphError::is_transient, || {
            graph.push(&repo.url, &self.credentials, &branch)
        })
        .at(Step::Push)?;

        let draft = PullRequestDraft::for_digest(&branch, &repo.base_branch, &digest);
        let number = self
            .reviews
            .create(&repo_id, &draft)
            .at(Step::OpenRequest)?;
        self.prs.track(&repo_id, number).at(Step::RecordRequest)?;
        tracing::info!("{}: opened {}#{}", name, repo_id, number);

        Ok(Outcome::Proposed {
            branch,
            digest,
            commit,
            pull_request: number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_and_message() {
        let digest = "sha256:bbbb2222ffffeeee";
        assert_eq!(
            branch_name("ci-image-update-", digest),
            "ci-image-update-bbbb2222"
        );
        assert_eq!(commit_message(digest), "Update CI docker image to bbbb2222");

        // Short digests still give a valid ref name
        assert_eq!(branch_name("ci-image-update-", "sha256:ab"), "ci-image-update-ab");
    }

    #[test]
    fn test_step_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Step::CheckTrackedPr).unwrap(),
            "check_tracked_pr"
        );
        assert_eq!(Step::OpenRequest.to_string(), "open_request");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::Rejected {
            digest: "sha256:ab".to_string(),
            status: VersionStatus::Blacklisted,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["status"], "blacklisted");
    }

    #[test]
    fn test_report_serialization() {
        let report = RunReport {
            dry_run: false,
            repos: vec![
                RepoReport {
                    repo: "a".to_string(),
                    result: Ok(Outcome::PullRequestOpen { number: 3 }),
                },
                RepoReport {
                    repo: "b".to_string(),
                    result: Err(Failure {
                        step: Step::Fetch,
                        error: Error::Other("network down".to_string()),
                    }),
                },
            ],
        };
        assert!(report.has_failures());
        assert_eq!(report.failures().count(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["repos"][0]["ok"], true);
        assert_eq!(json["repos"][0]["outcome"]["kind"], "pull_request_open");
        assert_eq!(json["repos"][1]["ok"], false);
        assert_eq!(json["repos"][1]["step"], "fetch");
        assert_eq!(json["repos"][1]["error"], "network down");
    }
}
