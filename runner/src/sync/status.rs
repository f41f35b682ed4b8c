use super::locking::{Lock, LockError};
use crate::distributed::{util::now_millis, Artifact, Connector};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, warn};

/// a stamp this recent may hide a second write within the same clock tick
const SETTLE_MILLIS: i64 = 2000;

/// Readers and writers registered in the status file of a resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessStatus {
    pub readers: u32,
    pub writers: u32,
    /// modification time of the status file when it was last read
    pub last_update: i64,
}

impl AccessStatus {
    /// Re-read the status file if it changed, returns true if the counters moved
    pub fn refresh(&mut self, connector: &dyn Connector, path: &Path) -> io::Result<bool> {
        let Some(stamp) = connector.stat(path)? else {
            let changed = self.readers != 0 || self.writers != 0;
            self.readers = 0;
            self.writers = 0;
            return Ok(changed);
        };

        let modified = stamp.millis();
        if modified < self.last_update
            || (modified == self.last_update && now_millis() - modified > SETTLE_MILLIS)
        {
            return Ok(false);
        }

        let holders = parse(&connector.read_to_string(path)?, path);
        let writers = holders.values().filter(|write| **write).count() as u32;
        let readers = holders.len() as u32 - writers;
        let changed = readers != self.readers || writers != self.writers;

        debug!(path = ?path, readers, writers, "Read status file");
        self.readers = readers;
        self.writers = writers;
        self.last_update = modified;

        Ok(changed)
    }
}

/// holder -> true for writers
fn parse(content: &str, path: &Path) -> BTreeMap<String, bool> {
    let mut holders = BTreeMap::new();

    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match line.split_whitespace().collect_tuple() {
            Some((holder, "r")) => {
                holders.insert(holder.to_owned(), false);
            }
            Some((holder, "w")) => {
                holders.insert(holder.to_owned(), true);
            }
            _ => warn!(path = ?path, line, "Skipping malformed status line"),
        }
    }

    holders
}

fn render(holders: &BTreeMap<String, bool>) -> String {
    holders
        .iter()
        .map(|(holder, write)| format!("{holder} {}\n", if *write { "w" } else { "r" }))
        .collect()
}

/// Rewrite the status file of the resource at `base` under its lock file
///
/// `from` is removed from the holders, then `to` (holder, writes) is added.
pub fn update_status_file(
    connector: &dyn Connector,
    base: &Path,
    from: Option<&str>,
    to: Option<(&str, bool)>,
    timeout: Duration,
) -> Result<(), LockError> {
    let status_path = Artifact::Status.path(base);
    let unlockable = |error: io::Error| LockError::Unlockable {
        path: status_path.clone(),
        reason: error.to_string(),
    };

    let mut lock = connector.create_lock_file(&Artifact::Lock.path(base), timeout)?;

    let content = match connector.stat(&status_path).map_err(&unlockable)? {
        Some(_) => connector
            .read_to_string(&status_path)
            .map_err(&unlockable)?,
        None => String::new(),
    };

    let mut holders = parse(&content, &status_path);
    if let Some(holder) = from {
        if holders.remove(holder).is_none() {
            warn!(path = ?status_path, holder, "Holder was not registered");
        }
    }
    if let Some((holder, write)) = to {
        holders.insert(holder.to_owned(), write);
    }

    connector
        .write_atomic(&status_path, render(&holders).as_bytes())
        .map_err(&unlockable)?;
    debug!(path = ?status_path, from, to = ?to, "Updated status file");

    lock.release()
}

/// Registration of a reader or writer in a status file
#[derive(Debug)]
pub struct StatusLock {
    connector: Arc<dyn Connector>,
    base: PathBuf,
    holder: String,
    timeout: Duration,
    held: bool,
}

impl StatusLock {
    pub fn acquire(
        connector: Arc<dyn Connector>,
        base: &Path,
        holder: &str,
        write: bool,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        update_status_file(connector.as_ref(), base, None, Some((holder, write)), timeout)?;

        Ok(Self {
            connector,
            base: base.to_path_buf(),
            holder: holder.to_owned(),
            timeout,
            held: true,
        })
    }

    /// take over a registration made by an earlier scheduler process
    pub fn adopt(connector: Arc<dyn Connector>, base: &Path, holder: &str, timeout: Duration) -> Self {
        Self {
            connector,
            base: base.to_path_buf(),
            holder: holder.to_owned(),
            timeout,
            held: true,
        }
    }
}

impl Lock for StatusLock {
    fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }

        update_status_file(
            self.connector.as_ref(),
            &self.base,
            Some(&self.holder),
            None,
            self.timeout,
        )?;
        self.held = false;

        Ok(())
    }
}

impl Drop for StatusLock {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            error!(holder = %self.holder, error = %error, "Failed to remove status file entry");
        }
    }
}
