//! imagebump - keeps pinned CI docker image digests up to date.
//!
//! This library provides the core functionality for the `imagebump` CLI tool:
//! rewriting the pinned `- image:` line of a CI configuration, staging the edit
//! as a commit on a new branch through git plumbing, and proposing it as a
//! GitHub pull request. Small JSON stores make repeated runs idempotent.

pub mod cli;
pub mod commands;
pub mod config;
pub mod github;
pub mod graph;
pub mod patcher;
pub mod registry;
pub mod retry;
pub mod store;
pub mod updater;


/// Library-level error type for imagebump operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] patcher::ParseError),

    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("Version graph error: {0}")]
    Graph(#[from] graph::GraphError),

    #[error("Pull request API error: {0}")]
    RequestClient(#[from] github::RequestClientError),

    #[error("State store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for imagebump operations.
pub type Result<T> = std::result::Result<T, Error>;
