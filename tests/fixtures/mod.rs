//! Shared fixtures for integration tests
//!
//! Helpers to stage job directories and to build throwaway git upstreams
//! with the `git` client, mirroring how the store itself drives git.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use r3::{Repository, MANIFEST_FILE};

/// Run git in a directory, panicking on failure (fixtures must not fail
/// silently).
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a local upstream repository with one commit on `main` and return
/// its head.
pub fn init_upstream(dir: &Path) -> String {
    fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "--quiet", "--initial-branch=main"]);
    fs::write(dir.join("lib.py"), "VERSION = 1\n").unwrap();
    commit_all(dir, "initial")
}

/// Stage, commit everything, and return the new head.
pub fn commit_all(dir: &Path, message: &str) -> String {
    git(dir, &["add", "-A"]);
    git(
        dir,
        &[
            "-c",
            "user.name=fixture",
            "-c",
            "user.email=fixture@example.com",
            "commit",
            "--quiet",
            "-m",
            message,
        ],
    );
    git(dir, &["rev-parse", "HEAD"])
}

/// Seed the repository's git cache with a bare clone of a local upstream
/// under the given normalized key, the way a prior fetch would have left
/// it. `origin` keeps pointing at the local upstream so later fetches work.
pub fn seed_clone(repo: &Repository, key: &str, upstream: &Path) -> PathBuf {
    let clone_dir = repo.root().join("git").join(key);
    fs::create_dir_all(clone_dir.parent().unwrap()).unwrap();

    let output = Command::new("git")
        .args(["clone", "--quiet", "--bare"])
        .arg(upstream)
        .arg(&clone_dir)
        .output()
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "bare clone failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    git(
        &clone_dir,
        &[
            "config",
            "remote.origin.fetch",
            "+refs/heads/*:refs/heads/*",
        ],
    );
    clone_dir
}

/// Stage the minimal two-file job used across scenarios.
pub fn stage_minimal(dir: &Path) {
    fs::write(dir.join(MANIFEST_FILE), "parameters:\n  name: World\n").unwrap();
    fs::write(dir.join("run.py"), "print('hi')\n").unwrap();
}

/// Stage a job whose manifest is the given YAML text.
pub fn stage_with_manifest(dir: &Path, manifest: &str) {
    fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    fs::write(dir.join("run.py"), "print('hi')\n").unwrap();
}

/// Whether the test process can be stopped by file permissions at all
/// (root bypasses mode bits).
pub fn permissions_enforced() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() != 0 }
    }
    #[cfg(not(unix))]
    {
        true
    }
}
