use super::{
    util::{rename, temporary_sibling},
    Connector, FileStamp,
};
use crate::sync::locking::{FileLock, Lock, LockError};
use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

/// Connector for the filesystem of the machine running the scheduler
#[derive(Debug, Clone)]
pub struct LocalConnector {
    id: String,
    /// relative locator paths are resolved against it
    basedir: Option<PathBuf>,
}

impl LocalConnector {
    pub fn new(id: impl Into<String>, basedir: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            basedir,
        }
    }
}

impl Connector for LocalConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.basedir {
            Some(basedir) => basedir.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(FileStamp {
                modified: metadata.modified()?,
                len: metadata.len(),
            })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temporary = temporary_sibling(path);
        let written = fs::File::create(&temporary).and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        });

        match written.and_then(|()| rename(&temporary, path)) {
            Ok(()) => {
                debug!(path = ?path, "Replaced file");
                Ok(())
            }
            Err(error) => {
                if let Err(cleanup) = fs::remove_file(&temporary) {
                    if cleanup.kind() != ErrorKind::NotFound {
                        warn!(path = ?temporary, error = ?cleanup, "Failed to remove temporary file");
                    }
                }
                Err(error)
            }
        }
    }

    fn remove(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn create_lock_file(&self, path: &Path, timeout: Duration) -> Result<Box<dyn Lock>, LockError> {
        FileLock::acquire(path, timeout).map(|lock| Box::new(lock) as Box<dyn Lock>)
    }
}
