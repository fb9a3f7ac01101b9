//! Git commit cache
//!
//! Bare clones live under `git/`, keyed by normalized URL
//! (`host/owner/name`). Every commit referenced by a committed job is
//! pinned with a lightweight `r3/<job-id>` tag so upstream history rewrites
//! and garbage collection cannot orphan it. All plumbing goes through the
//! `git` client.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::store::lock::{Lock, LockError};

/// Tag namespace used for pinning commits.
pub const PIN_NAMESPACE: &str = "r3";

/// Errors for git cache operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("ref {reference:?} not found in {repository}")]
    RefNotFound {
        repository: String,
        reference: String,
    },

    #[error("commit {commit} is not reachable in {repository}")]
    CommitUnreachable { repository: String, commit: String },

    #[error("fetch would lose pinned commit {commit} (tag {tag}) in {repository}")]
    PinLost {
        repository: String,
        tag: String,
        commit: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Normalize a repository URL to the `host/path` form that keys the `git/`
/// subtree. `https://host/o/r(.git)`, `ssh://git@host/o/r`, `git@host:o/r`
/// and bare `host/o/r` all map to `host/o/r`.
pub fn normalize_url(url: &str) -> Result<String, String> {
    let mut rest = url.trim().to_string();
    if rest.is_empty() {
        return Err("empty url".to_string());
    }

    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped.to_string();
            break;
        }
    }

    // Drop userinfo; rewrite the scp-like host separator.
    if let Some(at) = rest.find('@') {
        if rest[..at].contains('/') {
            return Err("malformed userinfo".to_string());
        }
        rest = rest[at + 1..].to_string();
    }
    if let Some(colon) = rest.find(':') {
        rest.replace_range(colon..colon + 1, "/");
    }

    let trimmed = rest.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() < 2 {
        return Err("expected host/path form".to_string());
    }
    for segment in &segments {
        if segment.is_empty() || *segment == "." || *segment == ".." || segment.contains('\\') {
            return Err(format!("invalid path segment {:?}", segment));
        }
    }

    let mut normalized: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
    normalized[0] = normalized[0].to_ascii_lowercase();
    Ok(normalized.join("/"))
}

/// The bare-clone cache rooted at `<repo>/git`.
pub struct GitCache {
    root: PathBuf,
}

impl GitCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of the bare clone for a normalized URL key.
    pub fn clone_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn lock(&self, key: &str) -> Result<Lock, GitError> {
        Ok(Lock::git_clone(&self.root, key)?)
    }

    /// The URL a normalized key is fetched from.
    fn fetch_url(key: &str) -> String {
        format!("https://{}", key)
    }

    /// Ensure a bare clone exists for the key and return its directory.
    pub fn ensure_clone(&self, key: &str) -> Result<PathBuf, GitError> {
        let dir = self.clone_dir(key);
        if dir.join("HEAD").exists() {
            return Ok(dir);
        }

        let _lock = self.lock(key)?;
        if dir.join("HEAD").exists() {
            return Ok(dir);
        }

        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(repository = key, "creating bare clone");
        let url = Self::fetch_url(key);
        if let Err(err) = git(None, &["clone", "--bare", &url, &dir.to_string_lossy()]) {
            let _ = fs::remove_dir_all(&dir);
            return Err(err);
        }
        // Bare clones carry no fetch refspec by default; branch updates
        // must land on fetch so symbolic refs resolve freshly.
        git(
            Some(&dir),
            &["config", "remote.origin.fetch", "+refs/heads/*:refs/heads/*"],
        )?;
        Ok(dir)
    }

    /// Fetch upstream without pruning; pinned tags are local refs and are
    /// never touched.
    pub fn fetch(&self, key: &str) -> Result<(), GitError> {
        let dir = self.ensure_clone(key)?;
        let _lock = self.lock(key)?;
        debug!(repository = key, "fetching");
        git(Some(&dir), &["fetch", "--no-prune", "origin"])?;
        Ok(())
    }

    /// Resolve a symbolic ref (branch, tag, abbreviated id) to a full
    /// object id. Asks the clone first, fetches and retries once on a miss.
    pub fn resolve_ref(&self, key: &str, reference: &str) -> Result<String, GitError> {
        let dir = self.ensure_clone(key)?;
        if let Ok(sha) = rev_parse(&dir, reference) {
            return Ok(sha);
        }
        self.fetch(key)?;
        rev_parse(&dir, reference).map_err(|_| GitError::RefNotFound {
            repository: key.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Check whether a commit object is present in the clone.
    pub fn contains_commit(&self, key: &str, commit: &str) -> bool {
        let dir = self.clone_dir(key);
        if !dir.join("HEAD").exists() {
            return false;
        }
        git(Some(&dir), &["cat-file", "-e", &format!("{}^{{commit}}", commit)]).is_ok()
    }

    /// Ensure a commit is present, fetching it if missing.
    pub fn ensure_commit(&self, key: &str, commit: &str) -> Result<(), GitError> {
        self.ensure_clone(key)?;
        if self.contains_commit(key, commit) {
            return Ok(());
        }
        {
            let dir = self.clone_dir(key);
            let _lock = self.lock(key)?;
            // Servers that allow direct object fetches spare us a full
            // fetch; fall back otherwise.
            if git(Some(&dir), &["fetch", "origin", commit]).is_err() {
                git(Some(&dir), &["fetch", "--no-prune", "origin"])?;
            }
        }
        if self.contains_commit(key, commit) {
            Ok(())
        } else {
            Err(GitError::CommitUnreachable {
                repository: key.to_string(),
                commit: commit.to_string(),
            })
        }
    }

    /// Place the lightweight pin tag `r3/<job-id>` on a commit.
    pub fn pin(&self, key: &str, job_id: &str, commit: &str) -> Result<(), GitError> {
        let dir = self.clone_dir(key);
        let _lock = self.lock(key)?;
        let tag = format!("{}/{}", PIN_NAMESPACE, job_id);
        git(Some(&dir), &["tag", "-f", &tag, commit])?;
        debug!(repository = key, tag = %tag, commit = commit, "pinned commit");
        Ok(())
    }

    /// Drop the pin tag for a job. A missing tag or clone is not an error.
    pub fn unpin(&self, key: &str, job_id: &str) {
        let dir = self.clone_dir(key);
        if !dir.join("HEAD").exists() {
            return;
        }
        let tag = format!("{}/{}", PIN_NAMESPACE, job_id);
        if git(Some(&dir), &["tag", "-d", &tag]).is_ok() {
            debug!(repository = key, tag = %tag, "dropped pin");
        }
    }

    /// List all pin tags in a clone as `(tag, commit)` pairs.
    pub fn pins(&self, key: &str) -> Result<Vec<(String, String)>, GitError> {
        let dir = self.clone_dir(key);
        if !dir.join("HEAD").exists() {
            return Ok(Vec::new());
        }
        let output = git(
            Some(&dir),
            &[
                "for-each-ref",
                "--format=%(refname:short) %(objectname)",
                &format!("refs/tags/{}", PIN_NAMESPACE),
            ],
        )?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let (tag, commit) = line.split_once(' ')?;
                Some((tag.to_string(), commit.to_string()))
            })
            .collect())
    }

    /// Fetch upstream, refusing to finish in a state where any pinned
    /// commit is unreachable.
    pub fn pull(&self, key: &str) -> Result<(), GitError> {
        self.fetch(key)?;
        for (tag, commit) in self.pins(key)? {
            if !self.contains_commit(key, &commit) {
                return Err(GitError::PinLost {
                    repository: key.to_string(),
                    tag,
                    commit,
                });
            }
        }
        Ok(())
    }

    /// Ensure a detached worktree at the pinned commit exists under the
    /// given scratch root and return its path.
    pub fn ensure_worktree(
        &self,
        key: &str,
        commit: &str,
        worktrees_root: &Path,
    ) -> Result<PathBuf, GitError> {
        let path = worktrees_root.join(key).join(commit);
        if path.join(".git").exists() {
            return Ok(path);
        }

        self.ensure_commit(key, commit)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let dir = self.clone_dir(key);
        let _lock = self.lock(key)?;
        git(
            Some(&dir),
            &["worktree", "add", "--detach", &path.to_string_lossy(), commit],
        )?;
        info!(repository = key, commit = commit, "created worktree");
        Ok(path)
    }
}

fn rev_parse(dir: &Path, reference: &str) -> Result<String, GitError> {
    git(
        Some(dir),
        &["rev-parse", "--verify", &format!("{}^{{commit}}", reference)],
    )
}

/// Run a git command and return trimmed stdout, failing on a non-zero exit.
fn git(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(GitError::Command {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
