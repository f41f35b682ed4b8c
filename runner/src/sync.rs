//! Cross-process coordination on the files next to a resource
//!
//! Locking stays behind the [`locking::Lock`] capability: the file based
//! implementation can be swapped for a lock service as long as acquiring may
//! fail with a retryable [`locking::LockError::Unlockable`].

pub mod locking;
pub mod status;
