//! Repository locking
//!
//! Two locks guard mutation: the repository lock serializes commits and
//! removals, and each bare clone carries its own lock so fetches into the
//! same clone cannot interleave. Readers take no lock. Both are advisory
//! flocks acquired against a deadline with backoff; the holder writes its
//! pid into the lock file so contention warnings and timeouts can name the
//! blocker.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

/// Lock file at the repository root.
const REPOSITORY_LOCK: &str = ".r3.lock";

/// Commits and removals are local filesystem work.
const REPOSITORY_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches into a clone are network-bound and may be long.
const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors from lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {lock} (held by pid {holder:?})")]
    Timeout {
        lock: PathBuf,
        waited: Duration,
        holder: Option<u32>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An exclusive advisory lock, released on drop.
pub struct Lock {
    path: PathBuf,
    file: File,
}

impl Lock {
    /// The repository-wide lock serializing commits and removals.
    pub fn repository(repo_root: &Path) -> Result<Self, LockError> {
        Self::acquire(repo_root.join(REPOSITORY_LOCK), REPOSITORY_TIMEOUT)
    }

    /// The per-clone lock under `git/`, keyed like the clone itself
    /// (`<key>.lock` next to the bare clone directory).
    pub fn git_clone(git_root: &Path, key: &str) -> Result<Self, LockError> {
        Self::acquire(git_root.join(format!("{}.lock", key)), GIT_CLONE_TIMEOUT)
    }

    fn acquire(path: PathBuf, timeout: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut backoff = Duration::from_millis(10);
        let mut warned = false;

        loop {
            if let Some(file) = try_acquire(&path)? {
                if warned {
                    warn!(
                        lock = %path.display(),
                        waited_s = start.elapsed().as_secs_f64(),
                        "lock acquired after contention"
                    );
                }
                let lock = Self { path, file };
                lock.record_holder();
                return Ok(lock);
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    holder: holder_pid(&path),
                    lock: path,
                    waited: start.elapsed(),
                });
            }
            if !warned && start.elapsed() >= Duration::from_millis(200) {
                warn!(
                    lock = %path.display(),
                    holder = ?holder_pid(&path),
                    "waiting for lock"
                );
                warned = true;
            }

            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(400));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note the holder's pid in the lock file. Best effort; the lock
    /// itself never depends on the note.
    fn record_holder(&self) {
        let _ = self.file.set_len(0);
        let _ = (&self.file).write_all(std::process::id().to_string().as_bytes());
    }
}

/// Pid noted by the current holder, for diagnostics only.
fn holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn try_acquire(path: &Path) -> io::Result<Option<File>> {
    use std::os::unix::io::AsRawFd;

    // No truncation on open: a waiter must not wipe the holder's pid note.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(Some(file));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(None),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn try_acquire(path: &Path) -> io::Result<Option<File>> {
    // Exclusive creation stands in for flock; Drop deletes the file.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err),
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        // On unix the flock goes away with the descriptor.
        #[cfg(not(unix))]
        let _ = fs::remove_file(&self.path);
    }
}
