//! Persisted tracking state.
//!
//! Two small JSON object files make repeated runs idempotent:
//! - `tracked_pull_requests.json` - `owner/name` -> open pull request number
//! - `known_versions.json` - image digest -> `unknown` | `verified` | `blacklisted`
//!
//! Each store is loaded fully at open (a missing file is an empty store) and
//! rewritten in full on every mutation. Writes go to a temporary file in the
//! same directory which is synced and then renamed over the target, so a
//! crash mid-write never leaves a truncated file behind.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the pull request tracker.
pub const PR_TRACKER_FILE: &str = "tracked_pull_requests.json";

/// File name of the version status tracker.
pub const VERSION_TRACKER_FILE: &str = "known_versions.json";

/// Errors reading or writing a store file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A string-keyed JSON object persisted to one file.
#[derive(Debug)]
pub struct JsonStore<V> {
    path: PathBuf,
    data: BTreeMap<String, V>,
}

impl<V> JsonStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Load the store at `path`; a missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let data = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Insert or replace a value and persist immediately.
    ///
    /// The in-memory view only changes once the file has been written.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> Result<(), StoreError> {
        let mut next = self.data.clone();
        next.insert(key.into(), value);
        self.save(&next)?;
        self.data = next;
        Ok(())
    }

    /// Remove a value, persisting only if something was removed.
    pub fn remove(&mut self, key: &str) -> Result<Option<V>, StoreError> {
        if !self.data.contains_key(key) {
            return Ok(None);
        }
        let mut next = self.data.clone();
        let removed = next.remove(key);
        self.save(&next)?;
        self.data = next;
        Ok(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rewrite the whole file atomically with `data`.
    fn save(&self, data: &BTreeMap<String, V>) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        serde_json::to_writer_pretty(&mut temp, data)
            .map_err(|e| write_err(io::Error::other(e)))?;
        temp.write_all(b"\n").map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&self.path).map_err(|e| write_err(e.error))?;

        Ok(())
    }
}

/// Open pull request per GitHub repository.
#[derive(Debug)]
pub struct PrTracker {
    store: JsonStore<u64>,
}

impl PrTracker {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            store: JsonStore::open(path)?,
        })
    }

    /// Open the tracker file inside a state directory.
    pub fn open_in(state_dir: &Path) -> Result<Self, StoreError> {
        Self::open(state_dir.join(PR_TRACKER_FILE))
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn pull_request_for(&self, repo_id: &str) -> Option<u64> {
        self.store.get(repo_id).copied()
    }

    pub fn track(&mut self, repo_id: &str, number: u64) -> Result<(), StoreError> {
        self.store.set(repo_id, number)
    }

    pub fn forget(&mut self, repo_id: &str) -> Result<Option<u64>, StoreError> {
        self.store.remove(repo_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.store.iter().map(|(k, v)| (k, *v))
    }
}

/// Review status of an image digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Seen but not yet reviewed
    #[default]
    Unknown,
    /// Approved for rollout
    Verified,
    /// Must never be proposed
    Blacklisted,
}

impl VersionStatus {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "verified" => Some(Self::Verified),
            "blacklisted" => Some(Self::Blacklisted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Verified => "verified",
            Self::Blacklisted => "blacklisted",
        }
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Review status per digest.
#[derive(Debug)]
pub struct VersionTracker {
    store: JsonStore<VersionStatus>,
}

impl VersionTracker {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            store: JsonStore::open(path)?,
        })
    }

    /// Open the tracker file inside a state directory.
    pub fn open_in(state_dir: &Path) -> Result<Self, StoreError> {
        Self::open(state_dir.join(VERSION_TRACKER_FILE))
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Recorded status, `None` if the digest was never seen.
    pub fn status(&self, digest: &str) -> Option<VersionStatus> {
        self.store.get(digest).copied()
    }

    pub fn set_status(&mut self, digest: &str, status: VersionStatus) -> Result<(), StoreError> {
        self.store.set(digest, status)
    }

    pub fn remove(&mut self, digest: &str) -> Result<Option<VersionStatus>, StoreError> {
        self.store.remove(digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, VersionStatus)> {
        self.store.iter().map(|(k, v)| (k, *v))
    }
}
