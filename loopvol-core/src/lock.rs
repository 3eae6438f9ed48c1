//! Cross-process serialization.
//!
//! Every driver request holds an exclusive `flock` on `<state_dir>/.lock`
//! for its whole duration, so separate `loopvol` processes sharing a state
//! directory never interleave their filesystem side effects. The lock file
//! name is not a valid volume name, so it never collides with a volume's
//! lease directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock file name under the state directory.
pub const LOCK_FILE: &str = ".lock";

/// Held exclusive lock on a state directory. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    // Closing the descriptor releases the flock.
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Block until the exclusive lock on `state_dir` is held.
    ///
    /// The wait happens on the blocking pool, never on a runtime worker.
    pub async fn acquire(state_dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;

        let path = state_dir.join(LOCK_FILE);
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || lock_exclusive(&lock_path))
            .await
            .map_err(io::Error::other)??;

        debug!("Acquired state lock {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_exclusive(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;

    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret == 0 {
            return Ok(file);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_file_lives_in_state_dir() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");

        let lock = StateLock::acquire(&state_dir).await.unwrap();
        assert_eq!(lock.path(), state_dir.join(LOCK_FILE));
        assert!(lock.path().is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_holder_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().to_path_buf();

        let first = StateLock::acquire(&state_dir).await.unwrap();

        let waiter = {
            let state_dir = state_dir.clone();
            tokio::spawn(async move { StateLock::acquire(&state_dir).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "lock should still be held by the first holder");

        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap()
            .unwrap();
        assert_eq!(second.path(), state_dir.join(LOCK_FILE));
    }

    #[tokio::test]
    async fn test_relock_after_drop() {
        let dir = TempDir::new().unwrap();

        drop(StateLock::acquire(dir.path()).await.unwrap());
        StateLock::acquire(dir.path()).await.unwrap();
    }
}
