use crate::{
    distributed::util::lock_owner,
    resources::{DependencyKind, Locator},
};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

#[derive(Error, Debug)]
pub enum LockError {
    /// the lock may be obtained later, callers retry
    #[error("could not lock {path:?}: {reason}")]
    Unlockable { path: PathBuf, reason: String },
    #[error("{kind} access to {locator} can never be granted")]
    Refused {
        locator: Locator,
        kind: DependencyKind,
    },
}

impl LockError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unlockable { .. })
    }
}

/// A held lock, released when dropped
pub trait Lock: Send + fmt::Debug {
    /// Release right away and report failures, dropping afterwards is a no-op
    fn release(&mut self) -> Result<(), LockError>;
}

/// Lock file created with `O_EXCL`, visible to every host sharing the filesystem
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl FileLock {
    /// Poll for the lock file until `timeout` is over
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let start = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(error) = writeln!(file, "{}", lock_owner()) {
                        warn!(path = ?path, error = ?error, "Failed to write the lock owner");
                    }
                    debug!(path = ?path, "Acquired lock file");

                    return Ok(Self {
                        path: path.to_path_buf(),
                        held: true,
                    });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        let owner = fs::read_to_string(path).unwrap_or_default();

                        return Err(LockError::Unlockable {
                            path: path.to_path_buf(),
                            reason: format!("held by {}", owner.trim()),
                        });
                    }

                    trace!(path = ?path, "Lock file is held, polling");
                    thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
                }
                Err(error) => {
                    return Err(LockError::Unlockable {
                        path: path.to_path_buf(),
                        reason: error.to_string(),
                    })
                }
            }
        }
    }

    /// take over a lock file left by an earlier scheduler process
    pub fn adopt(path: PathBuf) -> Self {
        Self { path, held: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Lock for FileLock {
    fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "Released lock file");
                self.held = false;
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(path = ?self.path, "Lock file vanished before being released");
                self.held = false;
                Ok(())
            }
            // still held, a later release tries again
            Err(error) => Err(LockError::Unlockable {
                path: self.path.clone(),
                reason: error.to_string(),
            }),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            error!(error = %error, "Failed to release lock file");
        }
    }
}
