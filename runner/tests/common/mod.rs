#![allow(dead_code)]

use expman::{
    config::SchedulerConfig,
    database::SharedConnection,
    distributed::{Artifact, Connector, FileStamp, LocalConnector},
    executors::{local::LocalLauncher, Launchers},
    resources::{Commands, JobPayload, Locator, Resource},
    scheduler::Scheduler,
    sync::locking::{Lock, LockError},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
    thread,
    time::{Duration, Instant},
};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Logs are captured per test, enable them with `EXPMAN_LOG=debug`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("EXPMAN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// Local connector that can be told to fail every file access
#[derive(Debug)]
pub struct FlakyConnector {
    inner: LocalConnector,
    pub failing: AtomicBool,
}

impl FlakyConnector {
    pub fn new(inner: LocalConnector) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "storage is unreachable"))
        } else {
            Ok(())
        }
    }
}

impl Connector for FlakyConnector {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.inner.resolve(path)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        self.check()?;
        self.inner.stat(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.check()?;
        self.inner.read_to_string(path)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.write_atomic(path, contents)
    }

    fn remove(&self, path: &Path) -> io::Result<bool> {
        self.check()?;
        self.inner.remove(path)
    }

    fn create_lock_file(&self, path: &Path, timeout: Duration) -> Result<Box<dyn Lock>, LockError> {
        self.inner.create_lock_file(path, timeout)
    }
}

pub struct Setup {
    pub directory: tempfile::TempDir,
    pub scheduler: Arc<Scheduler>,
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: 50,
        runners: 2,
        lock_timeout: 200,
        retries: 5,
    }
}

fn connection() -> SharedConnection {
    let connection = SharedConnection::in_memory().unwrap();
    connection.init().unwrap();
    connection
}

/// Scheduler over an in-memory database and a temporary "local" host
pub fn setup() -> Setup {
    init_tracing();
    let directory = tempfile::tempdir().unwrap();
    let connector = LocalConnector::new("local", Some(directory.path().to_path_buf()));
    let scheduler = Scheduler::builder(connection())
        .host(Arc::new(connector), Launchers::Local(LocalLauncher::default()))
        .config(config())
        .build();

    Setup {
        directory,
        scheduler,
    }
}

/// Same as `setup`, with a connector that can be made to fail
pub fn flaky_setup() -> (Setup, Arc<FlakyConnector>) {
    init_tracing();
    let directory = tempfile::tempdir().unwrap();
    let connector = Arc::new(FlakyConnector::new(LocalConnector::new(
        "local",
        Some(directory.path().to_path_buf()),
    )));
    let scheduler = Scheduler::builder(connection())
        .host(connector.clone(), Launchers::Local(LocalLauncher::default()))
        .config(config())
        .build();

    (
        Setup {
            directory,
            scheduler,
        },
        connector,
    )
}

pub fn locator(path: &str) -> Locator {
    Locator::new("local", path)
}

pub fn job(path: &str, command: &[&str]) -> Resource {
    Resource::job(
        locator(path),
        JobPayload::new(Commands::single(command.iter().copied())),
    )
}

/// Poll `condition` until it holds, panics after a few seconds
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for the condition");
        thread::sleep(Duration::from_millis(20));
    }
}

impl Setup {
    /// Host path of an artifact of the resource at `path`
    pub fn artifact(&self, path: &str, artifact: Artifact) -> PathBuf {
        artifact.path(&self.directory.path().join(path.trim_start_matches('/')))
    }

    /// Leave the done marker of a resource, as its producer would
    pub fn touch_done(&self, path: &str) {
        let marker = self.artifact(path, Artifact::Done);
        fs::create_dir_all(marker.parent().unwrap()).unwrap();
        fs::write(marker, "").unwrap();
    }

    pub fn write_status(&self, path: &str, content: &str) {
        let status = self.artifact(path, Artifact::Status);
        fs::create_dir_all(status.parent().unwrap()).unwrap();
        fs::write(status, content).unwrap();
    }

    pub fn state(&self, path: &str) -> expman::resources::ResourceState {
        self.scheduler.get(&locator(path)).unwrap().state()
    }

    pub fn used_tokens(&self, path: &str) -> u32 {
        self.scheduler
            .get(&locator(path))
            .unwrap()
            .token_payload()
            .unwrap()
            .used_tokens()
    }

    /// Reap finished processes until `done` holds, panics after a few seconds
    pub fn reap_until(&self, mut done: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);

        while !done(self) {
            assert!(Instant::now() < deadline, "timed out waiting for the jobs");
            self.scheduler.reap();
            thread::sleep(Duration::from_millis(20));
        }
    }
}
