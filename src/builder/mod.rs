//! Job builder
//!
//! Turns a staged directory into a content-addressed identity: walk the
//! tree, filter reserved and ignored paths, hash every payload file, fold
//! in the dependency entries and the manifest digest, and hash the sorted
//! entry list. Symlinks that point into the repository are resolved to
//! dependency records during staging rather than hashed as files. Two runs
//! over the same inputs yield the same identifier on any host.

mod ignore;

pub use ignore::{IgnoreError, IgnoreRules};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::canonical::EncodingError;
use crate::dependency::{
    is_job_id, Dependency, DependencyError, GitDependency, JobDependency,
};
use crate::hash;
use crate::manifest::{ConfigError, Manifest, MANIFEST_FILE, METADATA_FILE, OUTPUT_DIR};
use crate::store::{JOBS_DIR, WORKTREES_DIR};

/// Errors for job building
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("path is not within the staged root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("symlink {path} points outside the repository: {target}")]
    ForeignSymlink { path: PathBuf, target: PathBuf },

    #[error("symlink {path} does not resolve to a job or pinned worktree: {target}")]
    UnresolvableSymlink { path: PathBuf, target: PathBuf },

    #[error("ignore pattern matches the manifest itself")]
    IgnoredManifest,

    #[error("ignore pattern matches hashed file {path:?}")]
    IgnoredHashedFile { path: String },

    #[error("ignore pattern matches dependency destination {destination:?}")]
    IgnoredDestination { destination: String },

    #[error("entry path conflict at {path:?}")]
    EntryConflict { path: String },
}

/// One line of the identity computation: a relative path and the digest
/// recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub path: String,
    pub digest: String,
}

/// The result of building a staged job.
#[derive(Debug)]
pub struct BuiltJob {
    /// The job identifier: SHA-256 over the sorted entry list.
    pub id: String,

    /// The committed form of the manifest, `files` frozen in.
    pub manifest: Manifest,

    /// The concrete entry list the id was computed from, sorted by path.
    pub entries: Vec<HashEntry>,

    /// Payload files only: relative path to digest.
    pub payload: BTreeMap<String, String>,
}

/// Builder for computing a staged job's identity.
pub struct JobBuilder {
    root: PathBuf,
    repo_root: Option<PathBuf>,
}

impl JobBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            repo_root: None,
        }
    }

    /// Repository root used to classify symlinks: links resolving into the
    /// repository are dependency-covered and skipped, all others fail.
    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        let repo_root: PathBuf = repo_root.into();
        self.repo_root = Some(repo_root.canonicalize().unwrap_or(repo_root));
        self
    }

    /// Load the staged manifest from `<root>/r3.yaml`.
    pub fn load_manifest(&self) -> Result<Manifest, BuildError> {
        Ok(Manifest::load(&self.root.join(MANIFEST_FILE))?)
    }

    /// Compute the identity of the staged job for the given (already
    /// resolved) manifest. Repository symlinks found on disk become
    /// dependency records of the frozen manifest.
    pub fn build(&self, manifest: &Manifest) -> Result<BuiltJob, BuildError> {
        let rules = IgnoreRules::new(&self.root, &manifest.ignore)?;

        let (payload, synthesized) = self.collect_payload(&rules, &manifest.dependencies)?;
        let mut effective = manifest.clone();
        effective.dependencies.extend(synthesized);
        self.check_ignore_conflicts(&effective, &rules)?;

        let mut entries = payload.clone();
        entries.insert(MANIFEST_FILE.to_string(), effective.subset_digest()?);

        for dependency in &effective.dependencies {
            let (destination, digest) = dependency.hash_entry()?;
            check_entry_conflict(&entries, &destination)?;
            entries.insert(destination, digest);
        }

        let mut lines = String::new();
        for (path, digest) in &entries {
            lines.push_str(path);
            lines.push(' ');
            lines.push_str(digest);
            lines.push('\n');
        }
        let id = hash::sha256_bytes(lines.as_bytes());

        let mut files = payload.clone();
        files.insert(
            MANIFEST_FILE.to_string(),
            entries[MANIFEST_FILE].clone(),
        );

        Ok(BuiltJob {
            id,
            manifest: effective.frozen(files),
            entries: entries
                .into_iter()
                .map(|(path, digest)| HashEntry { path, digest })
                .collect(),
            payload,
        })
    }

    /// Ignore patterns must not match anything that is hashed: the manifest
    /// itself, files already recorded in a staged `files` map, or a
    /// dependency destination.
    fn check_ignore_conflicts(
        &self,
        manifest: &Manifest,
        rules: &IgnoreRules,
    ) -> Result<(), BuildError> {
        if rules.is_ignored(Path::new(MANIFEST_FILE), false) {
            return Err(BuildError::IgnoredManifest);
        }
        if let Some(files) = &manifest.files {
            for path in files.keys() {
                if rules.is_ignored(Path::new(path), false) {
                    return Err(BuildError::IgnoredHashedFile { path: path.clone() });
                }
            }
        }
        for dependency in &manifest.dependencies {
            let destination = dependency.destination();
            let path = Path::new(destination);
            if rules.is_ignored(path, false) || rules.is_ignored(path, true) {
                return Err(BuildError::IgnoredDestination {
                    destination: destination.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Walk the staged tree, hash every payload file, and resolve
    /// repository symlinks to dependency records. Reserved paths and
    /// ignored paths are excluded, ignored directories and `output/` are
    /// pruned whole.
    fn collect_payload(
        &self,
        rules: &IgnoreRules,
        declared: &[Dependency],
    ) -> Result<(BTreeMap<String, String>, Vec<Dependency>), BuildError> {
        let mut payload = BTreeMap::new();
        let mut synthesized = Vec::new();

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));
        let mut iter = walker.into_iter();

        while let Some(next) = iter.next() {
            let entry = next?;
            let path = entry.path();
            let rel = path
                .strip_prefix(&self.root)
                .map_err(|_| BuildError::PathNotInRoot(path.to_path_buf()))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel_str = rel.to_string_lossy().to_string();
            let file_type = entry.file_type();

            // The whole output surface is reserved, whether it is a staged
            // directory or the symlink a checkout materialized.
            if rel_str == OUTPUT_DIR {
                if file_type.is_dir() {
                    iter.skip_current_dir();
                }
                continue;
            }
            if rel_str == MANIFEST_FILE || rel_str == METADATA_FILE {
                continue;
            }
            if rules.is_ignored(rel, file_type.is_dir()) {
                if file_type.is_dir() {
                    iter.skip_current_dir();
                }
                continue;
            }

            if file_type.is_symlink() {
                // A link a checkout placed for a declared record needs no
                // second record.
                if declared.iter().any(|d| d.destination() == rel_str) {
                    continue;
                }
                synthesized.push(self.resolve_symlink(path, &rel_str)?);
                continue;
            }
            if file_type.is_dir() {
                continue;
            }

            payload.insert(rel_str, hash::sha256_file(path)?);
        }

        Ok((payload, synthesized))
    }

    /// Resolve a staged symlink to a dependency record. A target under
    /// `jobs/<id>/...` becomes a job dependency, one under a pinned
    /// worktree becomes a git dependency; anything else fails the build.
    fn resolve_symlink(&self, path: &Path, destination: &str) -> Result<Dependency, BuildError> {
        let target = fs::read_link(path)?;
        let resolved = if target.is_absolute() {
            target.clone()
        } else {
            path.parent().unwrap_or(path).join(&target)
        };
        let canonical = resolved.canonicalize().unwrap_or(resolved);

        let repo_root = match &self.repo_root {
            Some(repo_root) if canonical.starts_with(repo_root) => repo_root,
            _ => {
                return Err(BuildError::ForeignSymlink {
                    path: path.to_path_buf(),
                    target,
                })
            }
        };
        let rest = canonical
            .strip_prefix(repo_root)
            .map_err(|_| BuildError::PathNotInRoot(canonical.clone()))?;
        let segments: Vec<String> = rest
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        let unresolvable = || BuildError::UnresolvableSymlink {
            path: path.to_path_buf(),
            target: target.clone(),
        };

        match segments.split_first() {
            Some((head, tail)) if head == JOBS_DIR => {
                let (job, source) = tail.split_first().ok_or_else(unresolvable)?;
                if !is_job_id(job) {
                    return Err(unresolvable());
                }
                Ok(Dependency::Job(JobDependency {
                    job: Some(job.clone()),
                    source: source.join("/"),
                    destination: destination.to_string(),
                    query: None,
                }))
            }
            Some((head, tail)) if head == WORKTREES_DIR => {
                let commit_at = tail
                    .iter()
                    .position(|segment| hash::is_full_object_id(segment))
                    .ok_or_else(unresolvable)?;
                // A clone key is at least host plus one path segment.
                if commit_at < 2 {
                    return Err(unresolvable());
                }
                Ok(Dependency::Git(GitDependency {
                    repository: tail[..commit_at].join("/"),
                    commit: tail[commit_at].clone(),
                    source: tail[commit_at + 1..].join("/"),
                    destination: destination.to_string(),
                }))
            }
            _ => Err(unresolvable()),
        }
    }
}

fn check_entry_conflict(
    entries: &BTreeMap<String, String>,
    destination: &str,
) -> Result<(), BuildError> {
    let conflict = entries.contains_key(destination)
        || entries.keys().any(|existing| {
            existing.starts_with(&format!("{}/", destination))
                || destination.starts_with(&format!("{}/", existing))
        });
    if conflict {
        return Err(BuildError::EntryConflict {
            path: destination.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage_minimal(dir: &Path) {
        fs::write(dir.join(MANIFEST_FILE), "parameters:\n  name: World\n").unwrap();
        fs::write(dir.join("run.py"), "print('hi')\n").unwrap();
    }

    fn build(dir: &Path) -> BuiltJob {
        let builder = JobBuilder::new(dir);
        let manifest = builder.load_manifest().unwrap();
        builder.build(&manifest).unwrap()
    }

    #[test]
    fn test_minimal_job() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());

        let built = build(dir.path());

        assert_eq!(built.id.len(), 64);
        let files = built.manifest.files.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("r3.yaml"));
        assert!(files.contains_key("run.py"));
        assert_eq!(built.payload.len(), 1);
    }

    #[test]
    fn test_deterministic() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/util.py"), "pass\n").unwrap();

        let first = build(dir.path());
        let second = build(dir.path());
        assert_eq!(first.id, second.id);

        // Same content in a different location yields the same id.
        let copy = TempDir::new().unwrap();
        stage_minimal(copy.path());
        fs::create_dir(copy.path().join("src")).unwrap();
        fs::write(copy.path().join("src/util.py"), "pass\n").unwrap();
        assert_eq!(build(copy.path()).id, first.id);
    }

    #[test]
    fn test_entries_sorted_by_path() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();

        let built = build(dir.path());
        let paths: Vec<_> = built.entries.iter().map(|e| e.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_reserved_paths_excluded() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        fs::write(dir.path().join(METADATA_FILE), "note: hello\n").unwrap();
        fs::create_dir(dir.path().join(OUTPUT_DIR)).unwrap();
        fs::write(dir.path().join(OUTPUT_DIR).join("result.txt"), "42\n").unwrap();

        let built = build(dir.path());
        assert!(!built.payload.contains_key(METADATA_FILE));
        assert!(built.payload.keys().all(|p| !p.starts_with(OUTPUT_DIR)));
    }

    #[test]
    fn test_output_and_metadata_do_not_change_id() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        let before = build(dir.path()).id;

        fs::write(dir.path().join(METADATA_FILE), "note: hello\n").unwrap();
        fs::create_dir(dir.path().join(OUTPUT_DIR)).unwrap();
        fs::write(dir.path().join(OUTPUT_DIR).join("result.txt"), "42\n").unwrap();

        assert_eq!(build(dir.path()).id, before);
    }

    #[test]
    fn test_ignored_file_does_not_change_id() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "parameters:\n  name: World\nignore:\n  - \"/__pycache__\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("run.py"), "print('hi')\n").unwrap();
        let before = build(dir.path()).id;

        fs::create_dir(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/x.pyc"), "junk").unwrap();

        let built = build(dir.path());
        assert_eq!(built.id, before);
        assert!(!built.payload.keys().any(|p| p.contains("__pycache__")));
    }

    #[test]
    fn test_ignore_matching_manifest_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "ignore:\n  - \"*.yaml\"\n",
        )
        .unwrap();

        let builder = JobBuilder::new(dir.path());
        let manifest = builder.load_manifest().unwrap();
        assert!(matches!(
            builder.build(&manifest),
            Err(BuildError::IgnoredManifest)
        ));
    }

    #[test]
    fn test_ignore_matching_recorded_file_fails() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        let frozen = build(dir.path()).manifest;

        // Re-stage the committed form with an ignore pattern that matches a
        // file recorded as hashed.
        let mut retro = frozen.clone();
        retro.ignore = vec!["run.py".to_string()];
        let builder = JobBuilder::new(dir.path());
        assert!(matches!(
            builder.build(&retro),
            Err(BuildError::IgnoredHashedFile { path }) if path == "run.py"
        ));
    }

    #[test]
    fn test_ignore_matching_destination_fails() {
        let dir = TempDir::new().unwrap();
        let text = format!(
            "dependencies:\n  - job: {}\n    destination: data\nignore:\n  - data\n",
            "a".repeat(64)
        );
        fs::write(dir.path().join(MANIFEST_FILE), text).unwrap();

        let builder = JobBuilder::new(dir.path());
        let manifest = builder.load_manifest().unwrap();
        assert!(matches!(
            builder.build(&manifest),
            Err(BuildError::IgnoredDestination { .. })
        ));
    }

    #[test]
    fn test_dependency_entry_enters_id() {
        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        let plain = build(dir.path()).id;

        let text = format!(
            "parameters:\n  name: World\ndependencies:\n  - job: {}\n    destination: data\n",
            "a".repeat(64)
        );
        fs::write(dir.path().join(MANIFEST_FILE), text).unwrap();

        let built = build(dir.path());
        assert_ne!(built.id, plain);
        assert!(built.entries.iter().any(|e| e.path == "data"));
        // Dependencies are not part of the files map.
        assert!(!built.manifest.files.as_ref().unwrap().contains_key("data"));
    }

    #[test]
    fn test_destination_colliding_with_payload_fails() {
        let dir = TempDir::new().unwrap();
        let text = format!(
            "dependencies:\n  - job: {}\n    destination: run.py\n",
            "a".repeat(64)
        );
        fs::write(dir.path().join(MANIFEST_FILE), text).unwrap();
        fs::write(dir.path().join("run.py"), "print('hi')\n").unwrap();

        let builder = JobBuilder::new(dir.path());
        let manifest = builder.load_manifest().unwrap();
        assert!(matches!(
            builder.build(&manifest),
            Err(BuildError::EntryConflict { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_symlink_rejected() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        symlink("/etc/passwd", dir.path().join("leak")).unwrap();

        let builder = JobBuilder::new(dir.path());
        let manifest = builder.load_manifest().unwrap();
        assert!(matches!(
            builder.build(&manifest),
            Err(BuildError::ForeignSymlink { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_job_symlink_resolves_to_dependency_record() {
        use std::os::unix::fs::symlink;

        let job_id = "7".repeat(64);
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join("jobs").join(&job_id).join("raw")).unwrap();

        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        symlink(
            repo.path().join("jobs").join(&job_id).join("raw"),
            dir.path().join("data"),
        )
        .unwrap();

        let builder = JobBuilder::new(dir.path()).with_repo_root(repo.path());
        let manifest = builder.load_manifest().unwrap();
        let built = builder.build(&manifest).unwrap();

        // Not hashed as a file, but resolved to a record that enters both
        // the frozen manifest and the entry list.
        assert!(!built.payload.contains_key("data"));
        assert_eq!(
            built.manifest.dependencies,
            vec![crate::dependency::Dependency::Job(
                crate::dependency::JobDependency {
                    job: Some(job_id),
                    source: "raw".to_string(),
                    destination: "data".to_string(),
                    query: None,
                }
            )]
        );
        assert!(built.entries.iter().any(|e| e.path == "data"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_enters_identity() {
        use std::os::unix::fs::symlink;

        let repo = TempDir::new().unwrap();
        let job_a = "7".repeat(64);
        let job_b = "8".repeat(64);
        fs::create_dir_all(repo.path().join("jobs").join(&job_a)).unwrap();
        fs::create_dir_all(repo.path().join("jobs").join(&job_b)).unwrap();

        let id_linking_to = |job: &str| {
            let dir = TempDir::new().unwrap();
            stage_minimal(dir.path());
            symlink(repo.path().join("jobs").join(job), dir.path().join("data")).unwrap();
            let builder = JobBuilder::new(dir.path()).with_repo_root(repo.path());
            let manifest = builder.load_manifest().unwrap();
            builder.build(&manifest).unwrap().id
        };

        assert_ne!(id_linking_to(&job_a), id_linking_to(&job_b));
    }

    #[cfg(unix)]
    #[test]
    fn test_worktree_symlink_resolves_to_git_dependency() {
        use std::os::unix::fs::symlink;

        let sha = "9".repeat(40);
        let repo = TempDir::new().unwrap();
        let worktree = repo
            .path()
            .join("worktrees/example.com/owner/repo")
            .join(&sha);
        fs::create_dir_all(worktree.join("src")).unwrap();

        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        symlink(worktree.join("src"), dir.path().join("code")).unwrap();

        let builder = JobBuilder::new(dir.path()).with_repo_root(repo.path());
        let manifest = builder.load_manifest().unwrap();
        let built = builder.build(&manifest).unwrap();

        assert_eq!(
            built.manifest.dependencies,
            vec![crate::dependency::Dependency::Git(
                crate::dependency::GitDependency {
                    repository: "example.com/owner/repo".to_string(),
                    commit: sha,
                    source: "src".to_string(),
                    destination: "code".to_string(),
                }
            )]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_declared_dependency_link_not_duplicated() {
        use std::os::unix::fs::symlink;

        let job_id = "7".repeat(64);
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join("jobs").join(&job_id)).unwrap();

        // A checkout materialized the declared record as a link; staging it
        // again must not add a second record for the same destination.
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            format!("dependencies:\n  - job: \"{}\"\n    destination: data\n", job_id),
        )
        .unwrap();
        symlink(repo.path().join("jobs").join(&job_id), dir.path().join("data")).unwrap();

        let builder = JobBuilder::new(dir.path()).with_repo_root(repo.path());
        let manifest = builder.load_manifest().unwrap();
        let built = builder.build(&manifest).unwrap();

        assert_eq!(built.manifest.dependencies.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_into_repo_internals_rejected() {
        use std::os::unix::fs::symlink;

        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join("git/example.com/owner/repo")).unwrap();

        let dir = TempDir::new().unwrap();
        stage_minimal(dir.path());
        symlink(
            repo.path().join("git/example.com/owner/repo"),
            dir.path().join("clone"),
        )
        .unwrap();

        let builder = JobBuilder::new(dir.path()).with_repo_root(repo.path());
        let manifest = builder.load_manifest().unwrap();
        assert!(matches!(
            builder.build(&manifest),
            Err(BuildError::UnresolvableSymlink { .. })
        ));
    }
}
