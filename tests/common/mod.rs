//! Common test utilities for imagebump integration tests.
//!
//! Provides:
//! - `TestEnv` for CLI runs with an isolated working and state directory
//! - recording fakes of the registry and pull request clients
//! - helpers to build configs and seed a simulated remote

#![allow(dead_code)]

use assert_cmd::Command;
use chrono::DateTime;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

use imagebump::config::Config;
use imagebump::github::{PullRequestDraft, RequestClientError, ReviewRequests};
use imagebump::graph::{Identity, MemoryGraph, Signature};
use imagebump::registry::{DigestResolver, RegistryError};

pub const OLD_DIGEST: &str = "sha256:aaaa1111";
pub const NEW_DIGEST: &str = "sha256:bbbb2222";
pub const NEW_BRANCH: &str = "ci-image-update-bbbb2222";
pub const CONFIG_PATH: &str = ".circleci/config.yml";

/// A CircleCI config pinning `myorg/ci:latest` at `digest`.
pub fn circleci_config(digest: &str) -> String {
    format!(
        "version: 2\njobs:\n  build:\n    docker:\n      - image: myorg/ci:latest@{}\n    steps:\n      - checkout\n",
        digest
    )
}

/// A test environment with isolated directories.
///
/// - `work_dir`: current directory of spawned commands, holds `imagebump.toml`
/// - `state_dir`: where the tracking JSON files go
pub struct TestEnv {
    pub work_dir: TempDir,
    pub state_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            work_dir: TempDir::new().unwrap(),
            state_dir: TempDir::new().unwrap(),
        }
    }

    /// Write `imagebump.toml` with one repository per `(name, url, dir)`.
    pub fn write_config(&self, repos: &[(&str, &str, &Path)]) -> PathBuf {
        let path = self.work_dir.path().join("imagebump.toml");
        std::fs::write(&path, config_toml(self.state_path(), Some("ghp_test_token"), repos))
            .unwrap();
        path
    }

    /// Get a Command for the imagebump binary running inside `work_dir`.
    ///
    /// Clears the token and config env vars so the host cannot leak in.
    pub fn imagebump(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_imagebump"));
        cmd.current_dir(self.work_dir.path());
        cmd.env_remove("IMAGEBUMP_GITHUB_TOKEN");
        cmd.env_remove("IMAGEBUMP_CONFIG");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    pub fn state_path(&self) -> &Path {
        self.state_dir.path()
    }

    pub fn work_path(&self) -> &Path {
        self.work_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// TOML text for a config with the given repositories.
pub fn config_toml(state_dir: &Path, token: Option<&str>, repos: &[(&str, &str, &Path)]) -> String {
    let mut toml = format!("state_dir = {:?}\n\n[github]\nusername = \"image-bot\"\n", state_dir);
    if let Some(token) = token {
        toml.push_str(&format!("token = {:?}\n", token));
    }
    for (name, url, dir) in repos {
        toml.push_str(&format!(
            "\n[repos.{}]\nurl = {:?}\ndir = {:?}\n",
            name,
            url,
            dir.display().to_string()
        ));
    }
    toml
}

/// A validated config with one repository per `(name, url)` and extra TOML
/// appended to every repository table.
pub fn config_with(state_dir: &Path, repos: &[(&str, &str)], extra: &str) -> Config {
    let mut toml = format!(
        "state_dir = {:?}\n\n[github]\nusername = \"image-bot\"\ntoken = \"ghp_test_token\"\n",
        state_dir
    );
    for (name, url) in repos {
        toml.push_str(&format!(
            "\n[repos.{}]\nurl = {:?}\ndir = \"/nonexistent/{}\"\n{}\n",
            name, url, name, extra
        ));
    }
    Config::from_toml_str(&toml).unwrap()
}

pub fn fixed_signature() -> Signature {
    Signature::new(
        &Identity::default(),
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    )
}

/// A graph whose remote `master` holds a README and the given CI config.
pub fn seeded_graph(config: &str) -> MemoryGraph {
    let mut graph = MemoryGraph::new();
    graph
        .seed_remote(
            "master",
            &[("README.md", "# backend\n"), (CONFIG_PATH, config)],
            &fixed_signature(),
            "Initial commit",
        )
        .unwrap();
    graph
}

/// Registry fake returning one digest for every image, counting calls.
pub struct FakeRegistry {
    result: Result<String, String>,
    pub lookups: RefCell<Vec<(String, String)>>,
}

impl FakeRegistry {
    pub fn returning(digest: &str) -> Self {
        Self {
            result: Ok(digest.to_string()),
            lookups: RefCell::new(Vec::new()),
        }
    }

    /// Every lookup fails with a transport error.
    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            lookups: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.lookups.borrow().len()
    }
}

impl DigestResolver for FakeRegistry {
    fn latest_digest(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        self.lookups
            .borrow_mut()
            .push((repository.to_string(), tag.to_string()));
        self.result.clone().map_err(RegistryError::Transport)
    }
}

/// Pull request fake: numbers start at 1, created pull requests are open.
#[derive(Default)]
pub struct FakeReviews {
    open: RefCell<HashSet<u64>>,
    next_number: Cell<u64>,
    fail_create: Cell<bool>,
    pub created: RefCell<Vec<(String, PullRequestDraft)>>,
    pub status_checks: RefCell<HashMap<u64, usize>>,
}

impl FakeReviews {
    pub fn new() -> Self {
        let reviews = Self::default();
        reviews.next_number.set(1);
        reviews
    }

    /// Mark an existing pull request as open.
    pub fn open(&self, number: u64) {
        self.open.borrow_mut().insert(number);
    }

    /// Mark a pull request as closed or merged.
    pub fn close(&self, number: u64) {
        self.open.borrow_mut().remove(&number);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.set(fail);
    }

    pub fn created_count(&self) -> usize {
        self.created.borrow().len()
    }

    pub fn status_check_count(&self) -> usize {
        self.status_checks.borrow().values().sum()
    }
}

impl ReviewRequests for FakeReviews {
    fn is_open(&self, _repo_id: &str, number: u64) -> Result<bool, RequestClientError> {
        *self.status_checks.borrow_mut().entry(number).or_insert(0) += 1;
        Ok(self.open.borrow().contains(&number))
    }

    fn create(&self, repo_id: &str, draft: &PullRequestDraft) -> Result<u64, RequestClientError> {
        if self.fail_create.get() {
            return Err(RequestClientError::HttpError {
                status: 422,
                body: "Validation Failed".to_string(),
            });
        }
        let number = self.next_number.get();
        self.next_number.set(number + 1);
        self.open.borrow_mut().insert(number);
        self.created
            .borrow_mut()
            .push((repo_id.to_string(), draft.clone()));
        Ok(number)
    }
}
