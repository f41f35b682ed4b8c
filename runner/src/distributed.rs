pub mod fs;
pub mod util;


/*
 * Resources live on hosts reached through connectors. Every resource keeps its
 * coordination state next to its path, as small marker files:
 *
 * <path>.status  one `holder r|w` line per process reading or writing the resource
 * <path>.lock    exclusive lock, guards rewrites of the status file
 * <path>.done    the resource was produced, its mtime is the completion time
 * <path>.code    exit code of the last run of a job
 * <path>.run     the generated launch script
 *
 * Locks are plain files created with O_EXCL so that processes on other hosts
 * sharing the same filesystem see them, which is why they are polled instead
 * of waited on.
 */

use crate::sync::locking::{Lock, LockError};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

pub use fs::LocalConnector;

/// Marker and output files kept next to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Lock,
    Status,
    Done,
    Code,
    Run,
    Out,
    Err,
}

impl Artifact {
    /// what a restart or an invalidation deletes
    pub const OUTPUTS: [Artifact; 4] = [Self::Done, Self::Code, Self::Out, Self::Err];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Status => "status",
            Self::Done => "done",
            Self::Code => "code",
            Self::Run => "run",
            Self::Out => "out",
            Self::Err => "err",
        }
    }

    /// `base` with the extension appended, `/a/b.txt` gives `/a/b.txt.done`
    pub fn path(self, base: &Path) -> PathBuf {
        util::with_suffix(base, self.extension())
    }
}

/// What a connector knows about an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub len: u64,
}

impl FileStamp {
    pub fn millis(&self) -> i64 {
        util::unix_millis(self.modified)
    }
}

/// Access to the storage of one host
///
/// All paths given to the file operations are host paths, as returned by `resolve`.
pub trait Connector: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// host path of a locator path
    fn resolve(&self, path: &str) -> PathBuf;

    /// `None` if the file does not exist
    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Replace the file content so that readers never see a partial write
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Returns false if there was nothing to remove
    fn remove(&self, path: &Path) -> io::Result<bool>;

    /// Create a lock file, polling until `timeout` if it is held by someone else
    fn create_lock_file(&self, path: &Path, timeout: Duration) -> Result<Box<dyn Lock>, LockError>;
}
