//! Content-addressed version graph used to stage configuration edits.
//!
//! This module provides the [`VersionGraph`] trait and two implementations:
//! - [`GitRepository`] - a local git working copy driven through plumbing commands
//! - [`MemoryGraph`] - an in-process object store with a simulated remote
//!
//! Edits never touch a working tree or index. A new blob is written, spliced
//! into a tree derived from the remote base branch, wrapped in a commit, and
//! published as a new branch.

pub mod git;
pub mod memory;

pub use git::GitRepository;
pub use memory::{MemoryGraph, Object};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from version graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// No git metadata found at or above the path
    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    /// The ref does not resolve to a commit
    #[error("unknown ref: {0}")]
    UnknownRef(String),

    /// The path does not exist in the tree at the given ref
    #[error("{path} not found at {reference}")]
    NotFound { reference: String, path: String },

    /// The object exists but is of the wrong kind
    #[error("object {id} is not a {expected}")]
    WrongObjectType { id: ObjectId, expected: &'static str },

    /// Empty or malformed path inside a tree
    #[error("invalid tree path: {0:?}")]
    InvalidPath(String),

    /// The branch ref already exists
    #[error("branch already exists: {0}")]
    AlreadyExists(String),

    /// The remote refused the push (non-fast-forward or protected ref)
    #[error("push of {branch} rejected: {reason}")]
    PushRejected { branch: String, reason: String },

    /// The remote refused the credentials
    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    /// Network failure or timeout talking to the remote
    #[error("transport error: {0}")]
    Transport(String),

    /// A git command failed for another reason
    #[error("`git {command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Whether retrying the same operation might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Transport(_))
    }
}

/// Hex object identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log output.
    pub fn short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tree entry modes understood by git.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// Regular file (100644)
    Blob,
    /// Executable file (100755)
    Executable,
    /// Symbolic link (120000)
    Symlink,
    /// Sub-tree (040000)
    Tree,
    /// Submodule commit (160000)
    Commit,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "100644",
            Self::Executable => "100755",
            Self::Symlink => "120000",
            Self::Tree => "040000",
            Self::Commit => "160000",
        }
    }

    /// Object type named in `mktree` input.
    pub fn object_type(&self) -> &'static str {
        match self {
            Self::Blob | Self::Executable | Self::Symlink => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub id: ObjectId,
}

/// Name and email used for commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: "Docker image update bot".to_string(),
            email: "noreply@example.com".to_string(),
        }
    }
}

/// An identity plus a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

impl Signature {
    pub fn new(identity: &Identity, when: DateTime<Utc>) -> Self {
        Self {
            name: identity.name.clone(),
            email: identity.email.clone(),
            when,
        }
    }

    pub fn now(identity: &Identity) -> Self {
        Self::new(identity, Utc::now())
    }

    /// `<unix-seconds> +0000`, the raw date format git accepts.
    pub fn git_date(&self) -> String {
        format!("{} +0000", self.when.timestamp())
    }
}

/// Username/token pair for the remote.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Everything needed to write a commit object.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

/// The local tracking ref a fetched branch lands on.
pub fn remote_tracking_ref(branch: &str) -> String {
    format!("refs/remotes/origin/{}", branch)
}

/// Full ref name of a local branch.
pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

/// Split a slash-separated tree path, rejecting empty or dot components.
pub fn split_path(path: &str) -> Result<Vec<&str>, GraphError> {
    let components: Vec<&str> = path.split('/').collect();
    if components
        .iter()
        .any(|c| c.is_empty() || *c == "." || *c == "..")
    {
        return Err(GraphError::InvalidPath(path.to_string()));
    }
    Ok(components)
}

/// Operations on a content-addressed object graph with branches and a remote.
///
/// Objects are identified by a hash of their content, so writing identical
/// bytes twice returns the same id. Ordering between calls (fetch before
/// read, branch check before writes) is the caller's responsibility.
pub trait VersionGraph {
    /// Update `refs/remotes/origin/<branch>` to the remote's tip.
    fn fetch(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError>;

    /// Resolve a ref to the commit it points at.
    fn resolve_ref(&self, reference: &str) -> Result<ObjectId, GraphError>;

    /// The root tree of a commit.
    fn tree_of(&self, commit: &ObjectId) -> Result<ObjectId, GraphError>;

    /// Content of `path` in the tree at `reference`.
    fn read_file_at_ref(&self, reference: &str, path: &str) -> Result<Vec<u8>, GraphError>;

    /// Store a blob and return its id.
    fn write_blob(&mut self, content: &[u8]) -> Result<ObjectId, GraphError>;

    /// A tree equal to `base_tree` except that `path` maps to `id` with `mode`.
    ///
    /// Intermediate directories are created as needed; siblings are reused
    /// by id.
    fn splice_into_tree(
        &mut self,
        base_tree: &ObjectId,
        path: &str,
        id: &ObjectId,
        mode: FileMode,
    ) -> Result<ObjectId, GraphError>;

    fn create_commit(&mut self, commit: &NewCommit) -> Result<ObjectId, GraphError>;

    fn branch_exists(&self, name: &str) -> Result<bool, GraphError>;

    /// Create a branch; fails with [`GraphError::AlreadyExists`] if present.
    fn create_branch(&mut self, name: &str, commit: &ObjectId) -> Result<(), GraphError>;

    /// Publish a local branch to the remote without forcing.
    fn push(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError>;
}
