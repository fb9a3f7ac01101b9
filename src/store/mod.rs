//! Repository store
//!
//! Owns the on-disk layout and the commit protocol. All mutation happens
//! under an exclusive repository lock and lands in a staging directory on
//! the same filesystem; a job becomes visible only through the atomic
//! rename into `jobs/<id>/`. Committed payloads are write-protected and
//! never mutated again; `metadata.yaml` and `output/` stay writable.

pub mod git;
pub mod lock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::builder::{BuildError, BuiltJob, JobBuilder};
use crate::dependency::{self, Dependency, QueryResolver, ResolveError};
use crate::index;
use crate::manifest::{ConfigError, Manifest, MANIFEST_FILE, METADATA_FILE, OUTPUT_DIR};
use crate::store::git::{GitCache, GitError};
use crate::store::lock::{Lock, LockError};

/// Format version written into the repository marker.
pub const REPOSITORY_VERSION: &str = "1.0.0";

/// Marker file at the repository root.
pub const MARKER_FILE: &str = "r3.yaml";

pub const JOBS_DIR: &str = "jobs";
pub const GIT_DIR: &str = "git";
pub const WORKTREES_DIR: &str = "worktrees";

const STAGING_PREFIX: &str = ".staging-";
const STAGING_MAX_AGE: Duration = Duration::from_secs(3600);

/// Errors for repository operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("not a repository: {path}")]
    NotARepository { path: PathBuf },

    #[error("already a repository: {path}")]
    AlreadyARepository { path: PathBuf },

    #[error("unsupported repository version {version:?}")]
    UnsupportedVersion { version: String },

    #[error("unknown job {id}")]
    UnknownJob { id: String },

    #[error("job {id} is referenced by {referenced_by}")]
    JobReferenced { id: String, referenced_by: String },

    #[error("dependency job {dependency} of {id} is not in the repository")]
    MissingDependencyJob { id: String, dependency: String },

    #[error("invalid repository url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("integrity failure for {id}: recomputed {computed}")]
    IntegrityMismatch { id: String, computed: String },

    #[error("integrity failure for {id}: files map does not match hashed contents")]
    FilesMismatch { id: String },

    #[error("integrity failure for {id}: commit {commit} missing from {repository}")]
    MissingPinnedCommit {
        id: String,
        repository: String,
        commit: String,
    },
}

impl StoreError {
    /// CLI exit code: 1 user error, 2 integrity failure, 3 I/O failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::IntegrityMismatch { .. }
            | StoreError::FilesMismatch { .. }
            | StoreError::MissingPinnedCommit { .. } => 2,
            StoreError::Io(_) | StoreError::Lock(_) => 3,
            StoreError::Git(err) => match err {
                GitError::RefNotFound { .. } => 1,
                _ => 3,
            },
            StoreError::Resolve(err) => match err {
                ResolveError::Git(GitError::RefNotFound { .. }) => 1,
                ResolveError::Git(_) => 3,
                _ => 1,
            },
            StoreError::Build(err) => match err {
                BuildError::Io(_) | BuildError::Walk(_) => 3,
                _ => 1,
            },
            _ => 1,
        }
    }
}

/// Repository format marker (`r3.yaml` at the root). Unknown keys within a
/// major version are tolerated.
#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    version: String,
}

/// Mutable per-job annotations (`metadata.yaml`). Never hashed; an empty
/// file reads as the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl JobMetadata {
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }
}

/// Result of a commit.
#[derive(Debug)]
pub struct CommitOutcome {
    pub id: String,
    /// False when the job was already present (content-addressed dedup).
    pub created: bool,
}

/// An opened repository. The root is passed explicitly to every operation;
/// no process-wide state exists.
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Create a fresh repository at `root`.
    pub fn init(root: &Path) -> Result<Self, StoreError> {
        if root.join(MARKER_FILE).exists() {
            return Err(StoreError::AlreadyARepository {
                path: root.to_path_buf(),
            });
        }
        fs::create_dir_all(root.join(JOBS_DIR))?;
        fs::create_dir_all(root.join(GIT_DIR))?;
        let marker = Marker {
            version: REPOSITORY_VERSION.to_string(),
        };
        let text = serde_yaml::to_string(&marker)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(root.join(MARKER_FILE), text)?;
        info!(root = %root.display(), "initialized repository");
        Self::open(root)
    }

    /// Open an existing repository, rejecting unknown major versions.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let marker_path = root.join(MARKER_FILE);
        if !marker_path.is_file() {
            return Err(StoreError::NotARepository {
                path: root.to_path_buf(),
            });
        }
        let text = fs::read_to_string(&marker_path)?;
        let marker: Marker = serde_yaml::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let major = marker.version.split('.').next().unwrap_or("");
        if major != "1" {
            return Err(StoreError::UnsupportedVersion {
                version: marker.version,
            });
        }
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join(JOBS_DIR)
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.jobs_dir().join(id)
    }

    pub fn git_cache(&self) -> GitCache {
        GitCache::new(self.root.join(GIT_DIR))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join(WORKTREES_DIR)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.job_dir(id).is_dir()
    }

    /// All committed job ids, sorted.
    pub fn job_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.jobs_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load the committed manifest of a job.
    pub fn load_manifest(&self, id: &str) -> Result<Manifest, StoreError> {
        if !self.contains(id) {
            return Err(StoreError::UnknownJob { id: id.to_string() });
        }
        Ok(Manifest::load(&self.job_dir(id).join(MANIFEST_FILE))?)
    }

    /// Commit a staged directory. Already-present content is a no-op
    /// success.
    pub fn commit(&self, source: &Path) -> Result<CommitOutcome, StoreError> {
        self.commit_with(source, None)
    }

    /// Commit with an external query engine for `query` dependencies.
    pub fn commit_with(
        &self,
        source: &Path,
        resolver: Option<&dyn QueryResolver>,
    ) -> Result<CommitOutcome, StoreError> {
        let _lock = Lock::repository(&self.root)?;
        self.sweep_staging()?;

        let builder = JobBuilder::new(source).with_repo_root(&self.root);
        let mut manifest = builder.load_manifest()?;

        let cache = self.git_cache();
        dependency::resolve_queries(&mut manifest.dependencies, resolver)?;
        dependency::resolve_refs(&mut manifest.dependencies, &cache)?;

        // The frozen manifest also carries records the builder resolved
        // from repository symlinks, so presence checks run against it.
        let built = builder.build(&manifest)?;
        self.check_dependencies_present(&built.manifest, &cache)?;
        let id = built.id.clone();

        if self.contains(&id) {
            info!(id = %id, "job already present");
            return Ok(CommitOutcome { id, created: false });
        }

        let staging = self.staging_dir();
        if let Err(err) = self.stage(source, &built, &staging) {
            let _ = remove_tree(&staging);
            return Err(err);
        }

        let target = self.job_dir(&id);
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = remove_tree(&staging);
            // Lost a race against another process; content-addressing makes
            // that a success.
            if self.contains(&id) {
                info!(id = %id, "job already present");
                return Ok(CommitOutcome { id, created: false });
            }
            return Err(err.into());
        }

        // Pin tags land after the job is visible; readers may observe the
        // tag lagging but never a tagged commit without its job.
        for record in &built.manifest.dependencies {
            if let Dependency::Git(dep) = record {
                cache.pin(&dep.repository, &id, &dep.commit)?;
            }
        }

        index::notify_committed(&self.root, &id, &built.manifest);
        info!(id = %id, source = %source.display(), "committed job");
        Ok(CommitOutcome { id, created: true })
    }

    /// Remove a committed job. Fails while any other job depends on it.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let _lock = Lock::repository(&self.root)?;
        if !self.contains(id) {
            return Err(StoreError::UnknownJob { id: id.to_string() });
        }

        for other in self.job_ids()? {
            if other == id {
                continue;
            }
            let manifest = self.load_manifest(&other)?;
            let referenced = manifest.dependencies.iter().any(|record| {
                matches!(record, Dependency::Job(dep) if dep.job.as_deref() == Some(id))
            });
            if referenced {
                return Err(StoreError::JobReferenced {
                    id: id.to_string(),
                    referenced_by: other,
                });
            }
        }

        let manifest = self.load_manifest(id)?;
        let cache = self.git_cache();
        for record in &manifest.dependencies {
            if let Dependency::Git(dep) = record {
                cache.unpin(&dep.repository, id);
            }
        }

        remove_tree(&self.job_dir(id))?;
        index::notify_removed(&self.root, id);
        info!(id = %id, "removed job");
        Ok(())
    }

    /// Recompute a job's identity from its current hashed inputs and check
    /// every integrity invariant. A lagging pin tag is tolerated; a missing
    /// pinned commit is not.
    pub fn verify(&self, id: &str) -> Result<(), StoreError> {
        let manifest = self.load_manifest(id)?;
        let builder = JobBuilder::new(self.job_dir(id)).with_repo_root(&self.root);
        let built = builder.build(&manifest)?;

        if built.id != id {
            return Err(StoreError::IntegrityMismatch {
                id: id.to_string(),
                computed: built.id,
            });
        }
        if manifest.files != built.manifest.files {
            return Err(StoreError::FilesMismatch { id: id.to_string() });
        }

        let cache = self.git_cache();
        for record in &manifest.dependencies {
            match record {
                Dependency::Git(dep) => {
                    if !cache.contains_commit(&dep.repository, &dep.commit) {
                        return Err(StoreError::MissingPinnedCommit {
                            id: id.to_string(),
                            repository: dep.repository.clone(),
                            commit: dep.commit.clone(),
                        });
                    }
                }
                Dependency::Job(dep) => {
                    if let Some(job) = &dep.job {
                        if !self.contains(job) {
                            return Err(StoreError::MissingDependencyJob {
                                id: id.to_string(),
                                dependency: job.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch a bare clone, refusing any update that would lose a pinned
    /// commit.
    pub fn pull(&self, url: &str) -> Result<(), StoreError> {
        let key = git::normalize_url(url).map_err(|reason| StoreError::InvalidUrl {
            url: url.to_string(),
            reason,
        })?;
        Ok(self.git_cache().pull(&key)?)
    }

    fn check_dependencies_present(
        &self,
        manifest: &Manifest,
        cache: &GitCache,
    ) -> Result<(), StoreError> {
        for record in &manifest.dependencies {
            match record {
                Dependency::Job(dep) => {
                    if let Some(job) = &dep.job {
                        if !self.contains(job) {
                            return Err(StoreError::MissingDependencyJob {
                                id: "staged job".to_string(),
                                dependency: job.clone(),
                            });
                        }
                    }
                }
                Dependency::Git(dep) => {
                    // Ref resolution already guarantees the clone in the
                    // common path; a manifest carrying a full sha directly
                    // still needs the object fetched.
                    cache.ensure_commit(&dep.repository, &dep.commit)?;
                }
            }
        }
        Ok(())
    }

    fn staging_dir(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.jobs_dir()
            .join(format!("{}{}-{}", STAGING_PREFIX, std::process::id(), nanos))
    }

    /// Populate a staging directory with the payload, the frozen manifest,
    /// an `output/` directory and initial metadata, then write-protect it.
    fn stage(&self, source: &Path, built: &BuiltJob, staging: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(staging)?;

        for rel in built.payload.keys() {
            let from = source.join(rel);
            let to = staging.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&from, &to)?;
        }

        built.manifest.save(&staging.join(MANIFEST_FILE))?;
        fs::create_dir(staging.join(OUTPUT_DIR))?;
        let metadata = JobMetadata {
            committed_at: Some(Utc::now()),
        };
        metadata.save(&staging.join(METADATA_FILE))?;

        protect_tree(staging)?;
        Ok(())
    }

    /// Remove staging directories abandoned by a cancelled commit.
    fn sweep_staging(&self) -> Result<(), StoreError> {
        let jobs_dir = self.jobs_dir();
        for entry in fs::read_dir(&jobs_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            match age {
                Some(age) if age > STAGING_MAX_AGE => {
                    info!(staging = %name, "sweeping stale staging directory");
                    if let Err(err) = remove_tree(&entry.path()) {
                        warn!(staging = %name, error = %err, "failed to sweep staging directory");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Write-protect a committed tree: payload files and the manifest become
/// read-only, directories lose write permission; `metadata.yaml` and the
/// contents of `output/` stay writable.
fn protect_tree(root: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(path);
        let rel_str = rel.to_string_lossy();

        if entry.file_type().is_dir() {
            let mode = if rel_str == OUTPUT_DIR { 0o755 } else { 0o555 };
            set_mode(path, mode)?;
        } else {
            let mode = if rel_str == METADATA_FILE || rel_str.starts_with("output/") {
                0o644
            } else {
                0o444
            };
            set_mode(path, mode)?;
        }
    }
    Ok(())
}

/// Remove a write-protected tree by restoring write permission first.
fn remove_tree(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            set_mode(entry.path(), 0o755)?;
        }
    }
    fs::remove_dir_all(root)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    // Best effort off POSIX: only the read-only bit is expressible.
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions)
}
