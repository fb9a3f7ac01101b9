//! Checkout engine
//!
//! Materializes a committed job into a working directory: payload files are
//! copied (never linked, so edits cannot reach the store), `output/` and
//! dependencies become symlinks into the store or into a git worktree at
//! the pinned commit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::dependency::Dependency;
use crate::manifest::{METADATA_FILE, OUTPUT_DIR};
use crate::store::git::GitError;
use crate::store::{Repository, StoreError};

/// Errors for checkout
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("missing dependency at {destination:?}: {detail}")]
    MissingDependency { destination: String, detail: String },

    #[error("target path already exists: {path}")]
    CheckoutConflict { path: PathBuf },

    #[error("symlink target does not exist: {target}")]
    DanglingSymlink { target: PathBuf },
}

impl CheckoutError {
    /// CLI exit code: 1 user error, 2 integrity failure, 3 I/O failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckoutError::Store(err) => err.exit_code(),
            CheckoutError::Io(_) | CheckoutError::Git(_) => 3,
            _ => 1,
        }
    }
}

/// Materialize the committed job `id` into `target`.
pub fn checkout(repo: &Repository, id: &str, target: &Path) -> Result<(), CheckoutError> {
    let manifest = repo.load_manifest(id)?;
    let job_dir = repo.job_dir(id);
    fs::create_dir_all(target)?;

    // Payload and manifest are copied read-only, exactly as committed.
    if let Some(files) = &manifest.files {
        for rel in files.keys() {
            let from = job_dir.join(rel);
            let to = target.join(rel);
            ensure_absent(&to)?;
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&from, &to)?;
        }
    }

    // Results land in the store through the output symlink.
    let output_link = target.join(OUTPUT_DIR);
    ensure_absent(&output_link)?;
    symlink(&job_dir.join(OUTPUT_DIR), &output_link)?;

    for record in &manifest.dependencies {
        let destination = target.join(record.destination());
        ensure_absent(&destination)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let link_target = match record {
            Dependency::Job(dep) => {
                let job = dep.job.as_ref().ok_or_else(|| {
                    CheckoutError::MissingDependency {
                        destination: dep.destination.clone(),
                        detail: "record carries an unresolved query".to_string(),
                    }
                })?;
                if !repo.contains(job) {
                    return Err(CheckoutError::MissingDependency {
                        destination: dep.destination.clone(),
                        detail: format!("job {} is not in the repository", job),
                    });
                }
                join_source(repo.job_dir(job), &dep.source)
            }
            Dependency::Git(dep) => {
                let worktree = repo.git_cache().ensure_worktree(
                    &dep.repository,
                    &dep.commit,
                    &repo.worktrees_dir(),
                )?;
                join_source(worktree, &dep.source)
            }
        };

        if !link_target.exists() {
            return Err(CheckoutError::DanglingSymlink {
                target: link_target,
            });
        }
        symlink(&link_target, &destination)?;
    }

    // Annotations stay editable in the checkout.
    fs::copy(job_dir.join(METADATA_FILE), target.join(METADATA_FILE))?;

    info!(id = %id, target = %target.display(), "checked out job");
    Ok(())
}

fn join_source(base: PathBuf, source: &str) -> PathBuf {
    if source.is_empty() {
        base
    } else {
        base.join(source)
    }
}

fn ensure_absent(path: &Path) -> Result<(), CheckoutError> {
    if path.symlink_metadata().is_ok() {
        return Err(CheckoutError::CheckoutConflict {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are required for checkout",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILE;
    use tempfile::TempDir;

    fn committed_repo() -> (TempDir, Repository, String) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let staged = TempDir::new().unwrap();
        fs::write(
            staged.path().join(MANIFEST_FILE),
            "parameters:\n  name: World\n",
        )
        .unwrap();
        fs::write(staged.path().join("run.py"), "print('hi')\n").unwrap();
        let outcome = repo.commit(staged.path()).unwrap();
        (dir, repo, outcome.id)
    }

    #[cfg(unix)]
    #[test]
    fn test_checkout_materializes_files_and_links() {
        let (_dir, repo, id) = committed_repo();
        let target = TempDir::new().unwrap();
        let dst = target.path().join("work");

        checkout(&repo, &id, &dst).unwrap();

        assert_eq!(
            fs::read_to_string(dst.join("run.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(dst.join(MANIFEST_FILE).is_file());
        assert!(dst.join(METADATA_FILE).is_file());

        let output = dst.join(OUTPUT_DIR);
        assert!(fs::symlink_metadata(&output).unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&output).unwrap(),
            repo.job_dir(&id).join(OUTPUT_DIR)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_checkout_output_reaches_store() {
        let (_dir, repo, id) = committed_repo();
        let target = TempDir::new().unwrap();
        let dst = target.path().join("work");

        checkout(&repo, &id, &dst).unwrap();

        fs::write(dst.join(OUTPUT_DIR).join("result.txt"), "42\n").unwrap();
        assert_eq!(
            fs::read_to_string(repo.job_dir(&id).join(OUTPUT_DIR).join("result.txt")).unwrap(),
            "42\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_checkout_conflict() {
        let (_dir, repo, id) = committed_repo();
        let target = TempDir::new().unwrap();
        let dst = target.path().join("work");

        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("run.py"), "mine").unwrap();

        assert!(matches!(
            checkout(&repo, &id, &dst),
            Err(CheckoutError::CheckoutConflict { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_checkout_job_dependency_symlink() {
        let (_dir, repo, dep_id) = committed_repo();

        let staged = TempDir::new().unwrap();
        fs::write(
            staged.path().join(MANIFEST_FILE),
            format!(
                "dependencies:\n  - job: {}\n    destination: data\n",
                dep_id
            ),
        )
        .unwrap();
        let outcome = repo.commit(staged.path()).unwrap();

        let target = TempDir::new().unwrap();
        let dst = target.path().join("work");
        checkout(&repo, &outcome.id, &dst).unwrap();

        let link = dst.join("data");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), repo.job_dir(&dep_id));
        // The dependency's payload is reachable through the link.
        assert!(link.join("run.py").is_file());
    }

    #[test]
    fn test_checkout_unknown_job() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let target = TempDir::new().unwrap();

        assert!(matches!(
            checkout(&repo, &"0".repeat(64), &target.path().join("work")),
            Err(CheckoutError::Store(StoreError::UnknownJob { .. }))
        ));
    }
}
