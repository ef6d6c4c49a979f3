//! TOML schema for `imagebump.toml`.
//!
//! This module provides:
//! - Rust structs representing the file, deserialized with serde
//! - Default values for every optional key
//! - Validation of values serde cannot check (URLs, patterns, ranges)
//!
//! # Example
//!
//! ```toml
//! state_dir = "/var/lib/imagebump"
//!
//! [github]
//! username = "image-bot"
//!
//! [repos.backend]
//! url = "https://github.com/acme/backend.git"
//! dir = "/srv/checkouts/backend"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ConfigError;
use crate::graph::Identity;
use crate::patcher::{DEFAULT_REPOSITORY_PATTERN, ImagePattern, PatchScope};
use crate::retry::RetryPolicy;

/// Config file looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "imagebump.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "IMAGEBUMP_CONFIG";

const GITHUB_URL_PREFIX: &str = "https://github.com/";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding `tracked_pull_requests.json` and `known_versions.json`
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Commit identity used unless a repository overrides it
    #[serde(default)]
    pub committer: Option<Identity>,

    pub github: GitHubSettings,

    #[serde(default)]
    pub http: HttpSettings,

    /// Repositories keyed by a short display name
    #[serde(default)]
    pub repos: BTreeMap<String, RepoConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Config {
    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(
            "Loaded config from {} ({} repositories)",
            path.display(),
            config.repos.len()
        );
        Ok(config)
    }

    /// Parse and validate TOML text. `~` in paths is expanded.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.state_dir = expand_home(&config.state_dir);
        for repo in config.repos.values_mut() {
            repo.dir = expand_home(&repo.dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.github.username.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "github.username must not be empty".to_string(),
            ));
        }
        if matches!(self.github.token.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "github.token must not be empty when set".to_string(),
            ));
        }
        if self.repos.is_empty() {
            return Err(ConfigError::Invalid(
                "no repositories configured: add at least one [repos.<name>] table".to_string(),
            ));
        }
        self.http.validate()?;
        for (name, repo) in &self.repos {
            repo.validate()
                .map_err(|e| ConfigError::Invalid(format!("repos.{}: {}", name, e)))?;
        }
        Ok(())
    }

    /// Commit identity for a repository: its own, else the global one, else the bot default.
    pub fn committer_for(&self, repo: &RepoConfig) -> Identity {
        repo.committer
            .clone()
            .or_else(|| self.committer.clone())
            .unwrap_or_default()
    }

    /// Resolve the config file location from an explicit path or the default.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

/// GitHub account used for pushes and pull requests.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubSettings {
    pub username: String,
    /// Personal access token; `IMAGEBUMP_GITHUB_TOKEN` takes precedence
    #[serde(default)]
    pub token: Option<String>,
}

impl std::fmt::Debug for GitHubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubSettings")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Network limits for registry, GitHub, and git transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    /// Attempts per network call, including the first
    pub retries: u32,
    /// Upper bound on a single git fetch or push
    pub git_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            timeout_secs: 30,
            retries: crate::retry::DEFAULT_ATTEMPTS,
            git_timeout_secs: 600,
        }
    }
}

impl HttpSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 || self.timeout_secs == 0 || self.git_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "http timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retries == 0 {
            return Err(ConfigError::Invalid(
                "http.retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries)
    }
}

/// One repository to keep up to date.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// `https://github.com/<owner>/<name>[.git]`
    pub url: String,
    /// Local working copy used as the object store
    pub dir: PathBuf,
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Regex for the image repository part of `- image:` lines
    #[serde(default)]
    pub repo_pattern: Option<String>,
    #[serde(default)]
    pub committer: Option<Identity>,
    #[serde(default)]
    pub patch_scope: PatchScope,
    /// Refuse digests that were never marked verified
    #[serde(default)]
    pub require_verified: bool,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_config_path() -> String {
    ".circleci/config.yml".to_string()
}

fn default_base_branch() -> String {
    "master".to_string()
}

fn default_branch_prefix() -> String {
    "ci-image-update-".to_string()
}

impl RepoConfig {
    /// A repository entry with defaults for everything but the URL and directory.
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            config_path: default_config_path(),
            base_branch: default_base_branch(),
            repo_pattern: None,
            committer: None,
            patch_scope: PatchScope::default(),
            require_verified: false,
            branch_prefix: default_branch_prefix(),
        }
    }

    /// `owner/name` derived from the URL.
    pub fn github_id(&self) -> Result<String, ConfigError> {
        parse_github_id(&self.url)
    }

    pub fn repository_pattern(&self) -> &str {
        self.repo_pattern
            .as_deref()
            .unwrap_or(DEFAULT_REPOSITORY_PATTERN)
    }

    fn validate(&self) -> Result<(), String> {
        parse_github_id(&self.url).map_err(|e| e.to_string())?;
        ImagePattern::new(self.repository_pattern()).map_err(|e| e.to_string())?;
        if self.config_path.is_empty() {
            return Err("config_path must not be empty".to_string());
        }
        if self.base_branch.is_empty() {
            return Err("base_branch must not be empty".to_string());
        }
        if self.branch_prefix.is_empty() {
            return Err("branch_prefix must not be empty".to_string());
        }
        Ok(())
    }
}

/// Extract `owner/name` from a GitHub HTTPS URL.
pub fn parse_github_id(url: &str) -> Result<String, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "url must look like https://github.com/<owner>/<name>[.git], got {:?}",
            url
        ))
    };

    let rest = url.strip_prefix(GITHUB_URL_PREFIX).ok_or_else(invalid)?;
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let segments: Vec<&str> = rest.split('/').collect();
    let valid_segment = |s: &&str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if segments.len() != 2 || !segments.iter().all(valid_segment) {
        return Err(invalid());
    }

    Ok(format!("{}/{}", segments[0], segments[1]))
}

/// Replace a leading `~` with the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[github]
username = "bot"
token = "ghp_x"

[repos.backend]
url = "https://github.com/acme/backend.git"
dir = "/srv/backend"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("."));
        assert_eq!(config.http, HttpSettings::default());

        let repo = &config.repos["backend"];
        assert_eq!(repo.config_path, ".circleci/config.yml");
        assert_eq!(repo.base_branch, "master");
        assert_eq!(repo.branch_prefix, "ci-image-update-");
        assert_eq!(repo.patch_scope, PatchScope::Canonical);
        assert!(!repo.require_verified);
        assert_eq!(repo.repository_pattern(), DEFAULT_REPOSITORY_PATTERN);
        assert_eq!(repo.github_id().unwrap(), "acme/backend");
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
state_dir = "/var/lib/imagebump"
committer = { name = "Global", email = "global@example.com" }

[github]
username = "bot"

[http]
timeout_secs = 5
retries = 5

[repos.a]
url = "https://github.com/acme/a"
dir = "/srv/a"
base_branch = "main"
patch_scope = "all"
require_verified = true
repo_pattern = "acme/[a-z]+"
committer = { name = "Repo", email = "repo@example.com" }

[repos.b]
url = "https://github.com/acme/b.git"
dir = "/srv/b"
"#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.http.timeout_secs, 5);
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.http.retry_policy().attempts, 5);
        assert!(config.github.token.is_none());

        let a = &config.repos["a"];
        assert_eq!(a.patch_scope, PatchScope::AllMatching);
        assert!(a.require_verified);
        assert_eq!(a.repository_pattern(), "acme/[a-z]+");
        assert_eq!(config.committer_for(a).name, "Repo");
        assert_eq!(config.committer_for(&config.repos["b"]).name, "Global");
    }

    #[test]
    fn test_committer_falls_back_to_bot() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let identity = config.committer_for(&config.repos["backend"]);
        assert_eq!(identity, Identity::default());
    }

    #[test]
    fn test_no_repos_is_invalid() {
        let toml = "[github]\nusername = \"bot\"\n";
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("no repositories"));
    }

    #[test]
    fn test_bad_url_names_repo() {
        let toml = MINIMAL.replace("https://github.com/acme/backend.git", "git@github.com:acme/backend");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("repos.backend"));
    }

    #[test]
    fn test_empty_token_is_invalid() {
        let toml = MINIMAL.replace("ghp_x", "");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_unknown_patch_scope_is_parse_error() {
        let toml = format!("{}patch_scope = \"some\"\n", MINIMAL);
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let toml = format!("{}brnach = \"main\"\n", MINIMAL);
        assert!(matches!(
            Config::from_toml_str(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_repo_pattern() {
        let toml = format!("{}repo_pattern = \"(unclosed\"\n", MINIMAL);
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("repos.backend"));
    }

    #[test]
    fn test_zero_retries_is_invalid() {
        let toml = format!("{}\n[http]\nretries = 0\n", MINIMAL);
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_parse_github_id() {
        assert_eq!(
            parse_github_id("https://github.com/org/repo").unwrap(),
            "org/repo"
        );
        assert_eq!(
            parse_github_id("https://github.com/org/repo.git").unwrap(),
            "org/repo"
        );
        assert_eq!(
            parse_github_id("https://github.com/org/my.repo/").unwrap(),
            "org/my.repo"
        );
        assert!(parse_github_id("https://gitlab.com/org/repo").is_err());
        assert!(parse_github_id("https://github.com/org").is_err());
        assert!(parse_github_id("https://github.com/org/repo/extra").is_err());
        assert!(parse_github_id("https://github.com/org/re po").is_err());
    }

    #[test]
    fn test_expand_home() {
        let plain = expand_home(Path::new("/abs/path"));
        assert_eq!(plain, PathBuf::from("/abs/path"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/state")), home.join("state"));
        }
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let debug = format!("{:?}", config.github);
        assert!(!debug.contains("ghp_x"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/imagebump.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
