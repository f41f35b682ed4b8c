use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::error;

static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname: {error}");
        String::from("localhost")
    }
});

pub fn hostname() -> &'static str {
    HOSTNAME.as_str()
}

/// `pid@host`, written into lock files to know who holds them
pub fn lock_owner() -> String {
    format!("{}@{}", std::process::id(), hostname())
}

pub fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_millis() as i64),
    }
}

pub fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

/// Append `.suffix` to the full file name, unlike `Path::with_extension`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// rename(2), atomic as long as both paths are on the same filesystem
pub fn rename(from: &Path, to: &Path) -> io::Result<()> {
    nix::fcntl::renameat(None, from, None, to).map_err(io::Error::from)
}

/// temporary sibling used to build a file before renaming it into place
pub fn temporary_sibling(path: &Path) -> PathBuf {
    with_suffix(path, &format!("{}.tmp", std::process::id()))
}
