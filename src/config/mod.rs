//! Configuration for imagebump.
//!
//! One TOML file describes the GitHub account, HTTP limits, and every
//! repository to keep up to date.
//!
//! ## Location
//!
//! - `--config <path>` flag, or
//! - `IMAGEBUMP_CONFIG` environment variable, or
//! - `imagebump.toml` in the current directory
//!
//! ## Contents
//!
//! - `state_dir` - where the tracking JSON files live (default `.`)
//! - `committer` - bot identity for commits
//! - `[github]` - `username` and `token`
//! - `[http]` - timeouts and retry attempts
//! - `[repos.<name>]` - one table per repository
//!
//! ## Precedence
//!
//! For the token: `IMAGEBUMP_GITHUB_TOKEN` env var > config file.
//!
//! Use the [`resolver`] module to obtain credentials with their source.

pub mod resolver;
pub mod schema;

pub use resolver::{
    GITHUB_TOKEN_ENV, Resolved, ResolvedCredentials, ValueSource, resolve_credentials,
    resolve_credentials_with_env,
};
pub use schema::{
    CONFIG_ENV, Config, DEFAULT_CONFIG_FILE, GitHubSettings, HttpSettings, RepoConfig,
};

use std::path::PathBuf;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("no GitHub token: set github.token or {}", resolver::GITHUB_TOKEN_ENV)]
    MissingToken,
}
