//! Git working-copy backend for the version graph.
//!
//! All writes go through plumbing commands (`hash-object`, `mktree`,
//! `commit-tree`, `update-ref`), so the working tree, the index and `HEAD`
//! are never modified. Network operations (`fetch`, `push`) run with a
//! wall-clock timeout and receive credentials as an HTTP header passed
//! through the environment, never in the remote URL or on the command line.

use super::{
    Credentials, FileMode, GraphError, NewCommit, ObjectId, VersionGraph, branch_ref,
    remote_tracking_ref, split_path,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Default wall-clock limit for a single fetch or push.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(600);

/// A git repository discovered from a directory.
#[derive(Debug, Clone)]
pub struct GitRepository {
    /// Directory commands run in.
    path: PathBuf,
    /// Resolved `.git` directory (or the repository itself when bare).
    git_dir: PathBuf,
    /// Limit applied to fetch and push.
    network_timeout: Duration,
}

/// Captured output of a remote operation.
struct RemoteOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl GitRepository {
    /// Find the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self, GraphError> {
        if !path.is_dir() {
            return Err(GraphError::NotARepository(path.to_path_buf()));
        }

        let output = Command::new("git")
            .args(["rev-parse", "--absolute-git-dir"])
            .current_dir(path)
            .output()
            .map_err(|e| GraphError::Command {
                command: "rev-parse --absolute-git-dir".to_string(),
                stderr: format!("failed to run git: {}", e),
            })?;

        if !output.status.success() {
            return Err(GraphError::NotARepository(path.to_path_buf()));
        }

        let git_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());

        Ok(Self {
            path: path.to_path_buf(),
            git_dir,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        })
    }

    /// Override the fetch/push timeout.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.path).env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    /// Run a local command with optional stdin and extra environment.
    fn output(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        envs: &[(&str, String)],
    ) -> Result<Output, GraphError> {
        let mut cmd = self.git();
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| GraphError::Command {
            command: args.join(" "),
            stderr: format!("failed to run git: {}", e),
        })?;

        if let Some(input) = stdin {
            // Dropping the handle closes the pipe so git sees EOF
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)?;
            }
        }

        Ok(child.wait_with_output()?)
    }

    /// Run a local command and return stdout, failing on non-zero exit.
    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, GraphError> {
        let output = self.output(args, stdin, &[])?;
        if !output.status.success() {
            return Err(GraphError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Resolve a revision expression, `None` if it does not exist.
    fn try_rev_parse(&self, revision: &str) -> Result<Option<ObjectId>, GraphError> {
        let output = self.output(&["rev-parse", "--verify", "--quiet", revision], None, &[])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(parse_object_id(&output.stdout)?))
    }

    /// Build the command for a remote operation.
    ///
    /// The auth header reaches git through `GIT_CONFIG_*` environment
    /// variables so the token never appears in the process argument list.
    fn remote_command(&self, args: &[&str], credentials: &Credentials) -> Command {
        let basic = STANDARD.encode(format!("{}:{}", credentials.username, credentials.token));

        let mut cmd = self.git();
        cmd.args(["-c", "credential.helper="])
            .args(["-c", "http.lowSpeedLimit=1000", "-c", "http.lowSpeedTime=60"])
            .args(args)
            .env("GIT_CONFIG_COUNT", "1")
            .env("GIT_CONFIG_KEY_0", "http.extraHeader")
            .env("GIT_CONFIG_VALUE_0", format!("Authorization: Basic {}", basic));
        cmd
    }

    /// Run a command that talks to a remote.
    ///
    /// Progress lines on stderr are forwarded to the log as they arrive. The
    /// child is killed once the network timeout elapses.
    fn run_remote(
        &self,
        args: &[&str],
        credentials: &Credentials,
    ) -> Result<RemoteOutput, GraphError> {
        let mut child = self
            .remote_command(args, credentials)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GraphError::Command {
                command: args.join(" "),
                stderr: format!("failed to run git: {}", e),
            })?;

        let label = self.path.display().to_string();
        let stderr_pipe = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || match stderr_pipe {
            Some(pipe) => forward_progress(pipe, &label),
            None => String::new(),
        });
        let stdout_pipe = child.stdout.take();
        let stdout_reader = std::thread::spawn(move || {
            let mut collected = String::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_string(&mut collected);
            }
            collected
        });

        let status = match child.wait_timeout(self.network_timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_reader.join();
                let _ = stdout_reader.join();
                return Err(GraphError::Transport(format!(
                    "git {} timed out after {}s",
                    args.first().copied().unwrap_or_default(),
                    self.network_timeout.as_secs()
                )));
            }
        };

        Ok(RemoteOutput {
            status,
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
        })
    }

    /// List a tree, keeping every record exactly as git printed it.
    fn ls_tree(&self, tree: &ObjectId) -> Result<Vec<ListedEntry>, GraphError> {
        let stdout = self.run(&["ls-tree", "-z", "--full-tree", tree.as_str()], None)?;

        stdout
            .split(|b| *b == 0)
            .filter(|record| !record.is_empty())
            .map(|record| {
                ListedEntry::parse(record).ok_or_else(|| GraphError::Command {
                    command: format!("ls-tree -z {}", tree),
                    stderr: format!(
                        "unparseable record {:?}",
                        String::from_utf8_lossy(record)
                    ),
                })
            })
            .collect()
    }

    fn mktree(&self, entries: &[ListedEntry]) -> Result<ObjectId, GraphError> {
        let mut input = Vec::new();
        for entry in entries {
            input.extend_from_slice(
                format!("{} {} {}\t", entry.mode, entry.kind, entry.id).as_bytes(),
            );
            input.extend_from_slice(&entry.name);
            input.push(0);
        }
        let stdout = self.run(&["mktree", "-z"], Some(&input))?;
        parse_object_id(&stdout)
    }

    /// Rebuild the trees along `components`; every other entry is carried
    /// over byte for byte.
    fn splice(
        &self,
        base: Option<&ObjectId>,
        components: &[&str],
        id: &ObjectId,
        mode: FileMode,
    ) -> Result<ObjectId, GraphError> {
        let Some((name, rest)) = components.split_first() else {
            return Err(GraphError::InvalidPath(String::new()));
        };
        let name = name.as_bytes();

        let mut entries = match base {
            Some(tree) => self.ls_tree(tree)?,
            None => Vec::new(),
        };

        let (entry_mode, entry_id) = if rest.is_empty() {
            (mode, id.clone())
        } else {
            let subtree = entries
                .iter()
                .find(|e| e.name == name && e.kind == "tree")
                .map(|e| e.id.clone());
            (FileMode::Tree, self.splice(subtree.as_ref(), rest, id, mode)?)
        };

        entries.retain(|e| e.name != name);
        entries.push(ListedEntry {
            mode: entry_mode.as_str().to_string(),
            kind: entry_mode.object_type().to_string(),
            id: entry_id,
            name: name.to_vec(),
        });

        self.mktree(&entries)
    }
}

/// One `ls-tree -z` record. The name stays raw bytes since git does not
/// require tree entry names to be UTF-8, and the mode stays as printed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedEntry {
    mode: String,
    kind: String,
    id: ObjectId,
    name: Vec<u8>,
}

impl ListedEntry {
    /// Parse `mode SP type SP id TAB name`.
    fn parse(record: &[u8]) -> Option<Self> {
        let tab = record.iter().position(|b| *b == b'\t')?;
        let (meta, name) = (&record[..tab], &record[tab + 1..]);
        if name.is_empty() {
            return None;
        }

        let meta = std::str::from_utf8(meta).ok()?;
        let mut fields = meta.split(' ');
        let (mode, kind, id) = (fields.next()?, fields.next()?, fields.next()?);
        if fields.next().is_some()
            || mode.is_empty()
            || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b))
            || !matches!(kind, "blob" | "tree" | "commit")
            || id.is_empty()
            || !id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }

        Some(Self {
            mode: mode.to_string(),
            kind: kind.to_string(),
            id: ObjectId::new(id),
            name: name.to_vec(),
        })
    }
}

/// Log progress from a git stderr pipe line by line and return all of it.
///
/// Git redraws progress with `\r`, so both `\r` and `\n` end a line.
fn forward_progress<R: Read>(pipe: R, label: &str) -> String {
    let mut reader = BufReader::new(pipe);
    let mut collected = Vec::new();
    let mut line = Vec::new();

    loop {
        let buf = match reader.fill_buf() {
            Ok([]) => break,
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for &byte in buf {
            if byte == b'\r' || byte == b'\n' {
                log_progress_line(label, &line);
                line.clear();
            } else {
                line.push(byte);
            }
        }
        collected.extend_from_slice(buf);
        let consumed = buf.len();
        reader.consume(consumed);
    }
    log_progress_line(label, &line);

    String::from_utf8_lossy(&collected).to_string()
}

fn log_progress_line(label: &str, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if !text.is_empty() {
        tracing::debug!("{} Transfer: {}", label, text);
    }
}

impl VersionGraph for GitRepository {
    fn fetch(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError> {
        let tracking = remote_tracking_ref(branch);
        let before = self.try_rev_parse(&tracking)?;
        let refspec = format!("+{}:{}", branch_ref(branch), tracking);

        tracing::debug!("Fetching {} from {}", refspec, remote_url);
        let output = self.run_remote(
            &["fetch", "--progress", "--no-tags", remote_url, &refspec],
            credentials,
        )?;
        if !output.status.success() {
            return Err(classify_remote_error("fetch", branch, &output));
        }

        let after = self.resolve_ref(&tracking)?;
        if before.as_ref() != Some(&after) {
            tracing::info!(
                "{} Update ref {} {} -> {}",
                self.path.display(),
                tracking,
                before.as_ref().map(|id| id.short()).unwrap_or("(none)"),
                after.short()
            );
        }

        Ok(())
    }

    fn resolve_ref(&self, reference: &str) -> Result<ObjectId, GraphError> {
        self.try_rev_parse(&format!("{}^{{commit}}", reference))?
            .ok_or_else(|| GraphError::UnknownRef(reference.to_string()))
    }

    fn tree_of(&self, commit: &ObjectId) -> Result<ObjectId, GraphError> {
        self.try_rev_parse(&format!("{}^{{tree}}", commit))?
            .ok_or_else(|| GraphError::WrongObjectType {
                id: commit.clone(),
                expected: "commit",
            })
    }

    fn read_file_at_ref(&self, reference: &str, path: &str) -> Result<Vec<u8>, GraphError> {
        let commit = self.resolve_ref(reference)?;
        let output = self.output(
            &["cat-file", "blob", &format!("{}:{}", commit, path)],
            None,
            &[],
        )?;

        if !output.status.success() {
            return Err(GraphError::NotFound {
                reference: reference.to_string(),
                path: path.to_string(),
            });
        }

        Ok(output.stdout)
    }

    fn write_blob(&mut self, content: &[u8]) -> Result<ObjectId, GraphError> {
        let stdout = self.run(&["hash-object", "-w", "--stdin"], Some(content))?;
        let id = parse_object_id(&stdout)?;
        tracing::debug!("Wrote blob {} ({} bytes)", id.short(), content.len());
        Ok(id)
    }

    fn splice_into_tree(
        &mut self,
        base_tree: &ObjectId,
        path: &str,
        id: &ObjectId,
        mode: FileMode,
    ) -> Result<ObjectId, GraphError> {
        let components = split_path(path)?;
        let tree = self.splice(Some(base_tree), &components, id, mode)?;
        tracing::debug!("Spliced {} into tree {} -> {}", path, base_tree.short(), tree.short());
        Ok(tree)
    }

    fn create_commit(&mut self, commit: &NewCommit) -> Result<ObjectId, GraphError> {
        let mut args = vec!["commit-tree", commit.tree.as_str()];
        for parent in &commit.parents {
            args.push("-p");
            args.push(parent.as_str());
        }
        args.extend(["-F", "-"]);

        let envs = [
            ("GIT_AUTHOR_NAME", commit.author.name.clone()),
            ("GIT_AUTHOR_EMAIL", commit.author.email.clone()),
            ("GIT_AUTHOR_DATE", commit.author.git_date()),
            ("GIT_COMMITTER_NAME", commit.committer.name.clone()),
            ("GIT_COMMITTER_EMAIL", commit.committer.email.clone()),
            ("GIT_COMMITTER_DATE", commit.committer.git_date()),
        ];

        let output = self.output(&args, Some(commit.message.as_bytes()), &envs)?;
        if !output.status.success() {
            return Err(GraphError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let id = parse_object_id(&output.stdout)?;
        tracing::debug!("Created commit {} for tree {}", id.short(), commit.tree.short());
        Ok(id)
    }

    fn branch_exists(&self, name: &str) -> Result<bool, GraphError> {
        Ok(self.try_rev_parse(&branch_ref(name))?.is_some())
    }

    fn create_branch(&mut self, name: &str, commit: &ObjectId) -> Result<(), GraphError> {
        let reference = branch_ref(name);
        self.run(&["check-ref-format", &reference], None)?;

        // An empty old value makes update-ref refuse to overwrite an existing ref
        let output = self.output(
            &[
                "update-ref",
                "-m",
                "imagebump: create branch",
                &reference,
                commit.as_str(),
                "",
            ],
            None,
            &[],
        )?;

        if !output.status.success() {
            if self.branch_exists(name)? {
                return Err(GraphError::AlreadyExists(name.to_string()));
            }
            return Err(GraphError::Command {
                command: format!("update-ref {}", reference),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!("Created branch {} @ {}", name, commit.short());
        Ok(())
    }

    fn push(
        &mut self,
        remote_url: &str,
        credentials: &Credentials,
        branch: &str,
    ) -> Result<(), GraphError> {
        let reference = branch_ref(branch);
        let refspec = format!("{}:{}", reference, reference);

        tracing::debug!("Pushing {} to {}", refspec, remote_url);
        let output = self.run_remote(&["push", "--porcelain", remote_url, &refspec], credentials)?;
        if !output.status.success() {
            return Err(classify_remote_error("push", branch, &output));
        }

        Ok(())
    }
}

fn parse_object_id(stdout: &[u8]) -> Result<ObjectId, GraphError> {
    let hex = String::from_utf8_lossy(stdout).trim().to_string();
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GraphError::Command {
            command: "parse object id".to_string(),
            stderr: format!("unexpected git output: {:?}", hex),
        });
    }
    Ok(ObjectId::new(hex))
}

/// Map a failed fetch/push to the most specific error.
fn classify_remote_error(operation: &str, branch: &str, output: &RemoteOutput) -> GraphError {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    let lower = combined.to_lowercase();
    let last_line = combined
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string();

    let auth_markers = [
        "authentication failed",
        "could not read username",
        "invalid username or password",
        "error: 401",
        "error: 403",
        "permission denied",
    ];
    let rejection_markers = [
        "[rejected]",
        "[remote rejected]",
        "non-fast-forward",
        "fetch first",
        "failed to push some refs",
    ];
    let transport_markers = [
        "could not resolve host",
        "connection timed out",
        "failed to connect",
        "connection reset",
        "early eof",
        "rpc failed",
        "operation timed out",
        "unable to access",
    ];

    if auth_markers.iter().any(|m| lower.contains(m)) {
        GraphError::AuthenticationFailed(branch.to_string())
    } else if operation == "push" && rejection_markers.iter().any(|m| lower.contains(m)) {
        GraphError::PushRejected {
            branch: branch.to_string(),
            reason: last_line,
        }
    } else if transport_markers.iter().any(|m| lower.contains(m)) {
        GraphError::Transport(last_line)
    } else {
        GraphError::Command {
            command: operation.to_string(),
            stderr: output.stderr.trim().to_string(),
        }
    }
}
