//! In-process version graph.
//!
//! Objects live in a hash map keyed by the SHA-256 of a git-like encoding of
//! their content, so identical content always shares one id. A second ref
//! namespace stands in for the remote: `fetch` copies a remote branch into
//! `refs/remotes/origin/*` and `push` publishes local branches back, refusing
//! anything that is not a fast-forward.
//!
//! Every mutating call is counted in [`CallCounts`] so callers can assert
//! which steps of a pipeline ran.

use super::{
    Credentials, FileMode, GraphError, NewCommit, ObjectId, Signature, TreeEntry, VersionGraph,
    branch_ref, remote_tracking_ref, split_path,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Vec<u8>),
    /// Entries sorted by name
    Tree(Vec<TreeEntry>),
    Commit {
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        committer: Signature,
        message: String,
    },
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Blob(_) => "blob",
            Object::Tree(_) => "tree",
            Object::Commit { .. } => "commit",
        }
    }

    /// Canonical bytes the id is computed from.
    fn encode(&self) -> Vec<u8> {
        let body: Vec<u8> = match self {
            Object::Blob(content) => content.clone(),
            Object::Tree(entries) => {
                let mut body = Vec::new();
                for entry in entries {
                    body.extend_from_slice(
                        format!("{} {}\0{}\n", entry.mode, entry.name, entry.id).as_bytes(),
                    );
                }
                body
            }
            Object::Commit {
                tree,
                parents,
                author,
                committer,
                message,
            } => {
                let mut text = format!("tree {}\n", tree);
                for parent in parents {
                    text.push_str(&format!("parent {}\n", parent));
                }
                text.push_str(&format!(
                    "author {} <{}> {}\n",
                    author.name,
                    author.email,
                    author.git_date()
                ));
                text.push_str(&format!(
                    "committer {} <{}> {}\n\n{}",
                    committer.name,
                    committer.email,
                    committer.git_date(),
                    message
                ));
                text.into_bytes()
            }
        };

        let mut encoded = format!("{} {}\0", self.kind(), body.len()).into_bytes();
        encoded.extend_from_slice(&body);
        encoded
    }

    fn id(&self) -> ObjectId {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        ObjectId::new(format!("{:x}", hasher.finalize()))
    }
}

/// How many times each operation ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub write_blob: usize,
    pub splice: usize,
    pub commit: usize,
    pub create_branch: usize,
    pub push: usize,
}

impl CallCounts {
    /// Whether any object or ref was written.
    pub fn wrote_anything(&self) -> bool {
        self.write_blob + self.splice + self.commit + self.create_branch + self.push > 0
    }
}

/// In-memory object store with local and remote refs.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    objects: HashMap<ObjectId, Object>,
    refs: BTreeMap<String, ObjectId>,
    remote_refs: BTreeMap<String, ObjectId>,
    /// When set, fetch and push require exactly these credentials.
    required_credentials: Option<Credentials>,
    /// Remote branches whose pushes are refused regardless of ancestry.
    protected: HashSet<String>,
    /// Transport failures still to be returned by fetch and push.
    fetch_failures: usize,
    push_failures: usize,
    calls: CallCounts,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials for fetch and push.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.required_credentials = Some(credentials);
        self
    }

    /// Make the next `count` fetches fail with a transport error.
    pub fn fail_next_fetch(&mut self, count: usize) {
        self.fetch_failures = count;
    }

    /// Make the next `count` pushes fail with a transport error.
    pub fn fail_next_push(&mut self, count: usize) {
        self.push_failures = count;
    }

    /// Refuse pushes to this remote branch.
    pub fn protect_remote_branch(&mut self, branch: &str) {
        self.protected.insert(branch.to_string());
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn object(&self, id: &ObjectId) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Commit id of a remote branch.
    pub fn remote_branch(&self, branch: &str) -> Option<&ObjectId> {
        self.remote_refs.get(&branch_ref(branch))
    }

    /// Names of all branches on the simulated remote.
    pub fn remote_branches(&self) -> Vec<String> {
        self.remote_refs
            .keys()
            .filter_map(|r| r.strip_prefix("refs/heads/"))
            .map(str::to_string)
            .collect()
    }

    /// Create a commit holding `files` and point the remote `branch` at it.
    ///
    /// The commit's parent is the branch's previous tip, if any. Seeding does
    /// not count towards [`CallCounts`].
    pub fn seed_remote(
        &mut self,
        branch: &str,
        files: &[(&str, &str)],
        committer: &Signature,
        message: &str,
    ) -> Result<ObjectId, GraphError> {
        let mut tree = self.insert(Object::Tree(Vec::new()));
        for (path, content) in files {
            let blob = self.insert(Object::Blob(content.as_bytes().to_vec()));
            let components = split_path(path)?;
            tree = self.splice(Some(&tree), &components, &blob, FileMode::Blob)?;
        }

        let parents = self.remote_branch(branch).cloned().into_iter().collect();
        let commit = self.insert(Object::Commit {
            tree,
            parents,
            author: committer.clone(),
            committer: committer.clone(),
            message: message.to_string(),
        });
        self.remote_refs.insert(branch_ref(branch), commit.clone());
        Ok(commit)
    }

    /// Read a file at the tip of a remote branch.
    pub fn read_remote_file(&self, branch: &str, path: &str) -> Result<Vec<u8>, GraphError> {
        let commit = self
            .remote_branch(branch)
            .cloned()
            .ok_or_else(|| GraphError::UnknownRef(branch.to_string()))?;
        self.read_at_commit(&commit, branch, path)
    }

    fn insert(&mut self, object: Object) -> ObjectId {
        let object = match object {
            Object::Tree(mut entries) => {
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Object::Tree(entries)
            }
            other => other,
        };
        let id = object.id();
        self.objects.entry(id.clone()).or_insert(object);
        id
    }

    fn tree_entries(&self, id: &ObjectId) -> Result<&[TreeEntry], GraphError> {
        match self.objects.get(id) {
            Some(Object::Tree(entries)) => Ok(entries),
            _ => Err(GraphError::WrongObjectType {
                id: id.clone(),
                expected: "tree",
            }),
        }
    }

    fn commit_tree(&self, id: &ObjectId) -> Result<&ObjectId, GraphError> {
        match self.objects.get(id) {
            Some(Object::Commit { tree, .. }) => Ok(tree),
            _ => Err(GraphError::WrongObjectType {
                id: id.clone(),
                expected: "commit",
            }),
        }
    }

    fn splice(
        &mut self,
        base: Option<&ObjectId>,
        components: &[&str],
        id: &ObjectId,
        mode: FileMode,
    ) -> Result<ObjectId, GraphError> {
        let Some((name, rest)) = components.split_first() else {
            return Err(GraphError::InvalidPath(String::new()));
        };

        let mut entries = match base {
            Some(tree) => self.tree_entries(tree)?.to_vec(),
            None => Vec::new(),
        };

        let (entry_mode, entry_id) = if rest.is_empty() {
            (mode, id.clone())
        } else {
            let subtree = entries
                .iter()
                .find(|e| e.name == *name && e.mode == FileMode::Tree)
                .map(|e| e.id.clone());
            (FileMode::Tree, self.splice(subtree.as_ref(), rest, id, mode)?)
        };

        entries.retain(|e| e.name != *name);
        entries.push(TreeEntry {
            name: name.to_string(),
            mode: entry_mode,
            id: entry_id,
        });

        Ok(self.insert(Object::Tree(entries)))
    }

    fn read_at_commit(
        &self,
        commit: &ObjectId,
        reference: &str,
        path: &str,
    ) -> Result<Vec<u8>, GraphError> {
        let not_found = || GraphError::NotFound {
            reference: reference.to_string(),
            path: path.to_string(),
        };

        let mut current = self.commit_tree(commit)?.clone();
        let components = split_path(path)?;
        let (last, dirs) = components.split_last().ok_or_else(not_found)?;

        for dir in dirs {
            let entries = self.tree_entries(&current)?;
            current = entries
                .iter()
                .find(|e| e.name == *dir && e.mode == FileMode::Tree)
                .map(|e| e.id.clone())
                .ok_or_else(not_found)?;
        }

        let entry = self
            .tree_entries(&current)?
            .iter()
            .find(|e| e.name == *last && e.mode != FileMode::Tree)
            .ok_or_else(not_found)?;

        match self.objects.get(&entry.id) {
            Some(Object::Blob(content)) => Ok(content.clone()),
            _ => Err(not_found()),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` through parents.
    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        let mut stack = vec![descendant.clone()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if &id == ancestor {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(Object::Commit { parents, .. }) = self.objects.get(&id) {
                stack.extend(parents.iter().cloned());
            }
        }
        false
    }

    fn check_credentials(&self, remote_url: &str, credentials: &Credentials) -> Result<(), GraphError> {
        match &self.required_credentials {
            Some(required) if required != credentials => {
                Err(GraphError::AuthenticationFailed(remote_url.to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl VersionGraph for MemoryGraph {
    fn fetch(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError> {
        self.calls.fetch += 1;
        if self.fetch_failures > 0 {
            self.fetch_failures -= 1;
            return Err(GraphError::Transport(format!("connection reset by {}", remote_url)));
        }
        self.check_credentials(remote_url, credentials)?;

        let tip = self
            .remote_branch(branch)
            .cloned()
            .ok_or_else(|| GraphError::UnknownRef(branch_ref(branch)))?;
        self.refs.insert(remote_tracking_ref(branch), tip);
        Ok(())
    }

    fn resolve_ref(&self, reference: &str) -> Result<ObjectId, GraphError> {
        self.refs
            .get(reference)
            .cloned()
            .ok_or_else(|| GraphError::UnknownRef(reference.to_string()))
    }

    fn tree_of(&self, commit: &ObjectId) -> Result<ObjectId, GraphError> {
        self.commit_tree(commit).cloned()
    }

    fn read_file_at_ref(&self, reference: &str, path: &str) -> Result<Vec<u8>, GraphError> {
        let commit = self.resolve_ref(reference)?;
        self.read_at_commit(&commit, reference, path)
    }

    fn write_blob(&mut self, content: &[u8]) -> Result<ObjectId, GraphError> {
        self.calls.write_blob += 1;
        Ok(self.insert(Object::Blob(content.to_vec())))
    }

    fn splice_into_tree(
        &mut self,
        base_tree: &ObjectId,
        path: &str,
        id: &ObjectId,
        mode: FileMode,
    ) -> Result<ObjectId, GraphError> {
        self.calls.splice += 1;
        let components = split_path(path)?;
        self.splice(Some(base_tree), &components, id, mode)
    }

    fn create_commit(&mut self, commit: &NewCommit) -> Result<ObjectId, GraphError> {
        self.calls.commit += 1;
        self.tree_entries(&commit.tree)?;
        for parent in &commit.parents {
            self.commit_tree(parent)?;
        }

        Ok(self.insert(Object::Commit {
            tree: commit.tree.clone(),
            parents: commit.parents.clone(),
            author: commit.author.clone(),
            committer: commit.committer.clone(),
            message: commit.message.clone(),
        }))
    }

    fn branch_exists(&self, name: &str) -> Result<bool, GraphError> {
        Ok(self.refs.contains_key(&branch_ref(name)))
    }

    fn create_branch(&mut self, name: &str, commit: &ObjectId) -> Result<(), GraphError> {
        self.calls.create_branch += 1;
        let reference = branch_ref(name);
        if self.refs.contains_key(&reference) {
            return Err(GraphError::AlreadyExists(name.to_string()));
        }
        self.commit_tree(commit)?;
        self.refs.insert(reference, commit.clone());
        Ok(())
    }

    fn push(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError> {
        self.calls.push += 1;
        if self.push_failures > 0 {
            self.push_failures -= 1;
            return Err(GraphError::Transport(format!("connection reset by {}", remote_url)));
        }
        self.check_credentials(remote_url, credentials)?;

        let reference = branch_ref(branch);
        let local = self
            .refs
            .get(&reference)
            .cloned()
            .ok_or_else(|| GraphError::UnknownRef(reference.clone()))?;

        if self.protected.contains(branch) {
            return Err(GraphError::PushRejected {
                branch: branch.to_string(),
                reason: "protected branch".to_string(),
            });
        }

        if let Some(remote) = self.remote_refs.get(&reference) {
            if !self.is_ancestor(remote, &local) {
                return Err(GraphError::PushRejected {
                    branch: branch.to_string(),
                    reason: "non-fast-forward".to_string(),
                });
            }
        }

        self.remote_refs.insert(reference, local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Identity;
    use chrono::DateTime;

    fn sig(ts: i64) -> Signature {
        Signature::new(&Identity::default(), DateTime::from_timestamp(ts, 0).unwrap())
    }

    fn creds() -> Credentials {
        Credentials::new("bot", "token")
    }

    fn seeded() -> MemoryGraph {
        let mut graph = MemoryGraph::new();
        graph
            .seed_remote(
                "master",
                &[
                    ("README.md", "hello\n"),
                    (".circleci/config.yml", "- image: org/app:1\n"),
                ],
                &sig(1),
                "Initial commit",
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_identical_content_same_id() {
        let mut graph = MemoryGraph::new();
        let a = graph.write_blob(b"same").unwrap();
        let count = graph.object_count();
        let b = graph.write_blob(b"same").unwrap();

        assert_eq!(a, b);
        assert_eq!(graph.object_count(), count);
        assert_eq!(graph.calls().write_blob, 2);
    }

    #[test]
    fn test_fetch_and_read() {
        let mut graph = seeded();
        assert!(graph.resolve_ref("refs/remotes/origin/master").is_err());

        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let content = graph
            .read_file_at_ref("refs/remotes/origin/master", ".circleci/config.yml")
            .unwrap();
        assert_eq!(content, b"- image: org/app:1\n");
    }

    #[test]
    fn test_read_missing_path() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();

        let err = graph
            .read_file_at_ref("refs/remotes/origin/master", ".circleci/other.yml")
            .unwrap_err();
        assert!(matches!(err, GraphError::NotFound { .. }));

        let err = graph
            .read_file_at_ref("refs/remotes/origin/master", ".circleci")
            .unwrap_err();
        assert!(matches!(err, GraphError::NotFound { .. }));
    }

    #[test]
    fn test_fetch_unknown_branch() {
        let mut graph = seeded();
        let err = graph.fetch("mem://remote", &creds(), "main").unwrap_err();
        assert!(matches!(err, GraphError::UnknownRef(_)));
    }

    #[test]
    fn test_fetch_wrong_credentials() {
        let mut graph = seeded().with_credentials(creds());
        let err = graph
            .fetch("mem://remote", &Credentials::new("bot", "wrong"), "master")
            .unwrap_err();
        assert!(matches!(err, GraphError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_splice_shares_siblings() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base_commit = graph.resolve_ref("refs/remotes/origin/master").unwrap();
        let base_tree = graph.tree_of(&base_commit).unwrap();

        let blob = graph.write_blob(b"- image: org/app:1@sha256:ab\n").unwrap();
        let new_tree = graph
            .splice_into_tree(&base_tree, ".circleci/config.yml", &blob, FileMode::Blob)
            .unwrap();
        assert_ne!(new_tree, base_tree);

        let old_entries = graph.tree_entries(&base_tree).unwrap().to_vec();
        let new_entries = graph.tree_entries(&new_tree).unwrap().to_vec();
        let old_readme = old_entries.iter().find(|e| e.name == "README.md").unwrap();
        let new_readme = new_entries.iter().find(|e| e.name == "README.md").unwrap();
        assert_eq!(old_readme.id, new_readme.id);

        // Splicing identical content back restores the original tree id
        let original = graph
            .write_blob(b"- image: org/app:1\n")
            .unwrap();
        let restored = graph
            .splice_into_tree(&new_tree, ".circleci/config.yml", &original, FileMode::Blob)
            .unwrap();
        assert_eq!(restored, base_tree);
    }

    #[test]
    fn test_splice_rejects_bad_path() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base = graph.resolve_ref("refs/remotes/origin/master").unwrap();
        let tree = graph.tree_of(&base).unwrap();
        let blob = graph.write_blob(b"x").unwrap();

        let err = graph
            .splice_into_tree(&tree, "a//b", &blob, FileMode::Blob)
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidPath(_)));
    }

    #[test]
    fn test_commit_ids_depend_on_timestamp() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base = graph.resolve_ref("refs/remotes/origin/master").unwrap();
        let tree = graph.tree_of(&base).unwrap();

        let commit = |ts| NewCommit {
            tree: tree.clone(),
            parents: vec![base.clone()],
            author: sig(ts),
            committer: sig(ts),
            message: "msg".to_string(),
        };

        let a = graph.create_commit(&commit(10)).unwrap();
        let b = graph.create_commit(&commit(10)).unwrap();
        let c = graph.create_commit(&commit(11)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_create_branch_twice() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base = graph.resolve_ref("refs/remotes/origin/master").unwrap();

        graph.create_branch("topic", &base).unwrap();
        let err = graph.create_branch("topic", &base).unwrap_err();
        assert!(matches!(err, GraphError::AlreadyExists(_)));
    }

    #[test]
    fn test_push_fast_forward_only() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base = graph.resolve_ref("refs/remotes/origin/master").unwrap();
        let tree = graph.tree_of(&base).unwrap();

        let child = graph
            .create_commit(&NewCommit {
                tree: tree.clone(),
                parents: vec![base.clone()],
                author: sig(5),
                committer: sig(5),
                message: "child".to_string(),
            })
            .unwrap();
        graph.create_branch("topic", &child).unwrap();
        graph.push("mem://remote", &creds(), "topic").unwrap();
        assert_eq!(graph.remote_branch("topic"), Some(&child));

        // Remote topic moves on independently
        graph
            .seed_remote("topic", &[("other.txt", "x")], &sig(6), "elsewhere")
            .unwrap();
        let err = graph.push("mem://remote", &creds(), "topic").unwrap_err();
        assert!(matches!(err, GraphError::PushRejected { .. }));
    }

    #[test]
    fn test_push_protected_branch() {
        let mut graph = seeded();
        graph.fetch("mem://remote", &creds(), "master").unwrap();
        let base = graph.resolve_ref("refs/remotes/origin/master").unwrap();
        graph.create_branch("locked", &base).unwrap();
        graph.protect_remote_branch("locked");

        let err = graph.push("mem://remote", &creds(), "locked").unwrap_err();
        assert!(matches!(err, GraphError::PushRejected { .. }));
    }

    #[test]
    fn test_remote_branches_listing() {
        let graph = seeded();
        assert_eq!(graph.remote_branches(), vec!["master".to_string()]);
        assert_eq!(
            graph.read_remote_file("master", "README.md").unwrap(),
            b"hello\n"
        );
    }
}
