pub mod local;
pub mod script;
pub mod slurm;

use crate::{config::LauncherConfig, resources::{ProcessHandle, ResourceError}};
use std::{
    io,
    path::Path,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("unexpected output from {program}: '{output}'")]
    Output { program: String, output: String },
    #[error("failed to signal process {pid}: {source}")]
    Signal { pid: u32, source: nix::Error },
    #[error("a {handle:?} process cannot be controlled by a {launcher} launcher")]
    WrongLauncher {
        handle: ProcessHandle,
        launcher: &'static str,
    },
    #[error("failed to write launch files: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// What polling a launched process tells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// the exit code, when the launcher knows it
    Finished(Option<i32>),
}

/// How the jobs of a connector are started
#[derive(Clone, Debug)]
pub enum Launchers {
    Local(local::LocalLauncher),
    Slurm(slurm::SlurmLauncher),
}

impl Launchers {
    pub fn load(config: &LauncherConfig) -> Self {
        match config {
            LauncherConfig::Local => Self::Local(local::LocalLauncher::default()),
            LauncherConfig::Slurm {
                sbatch,
                squeue,
                scancel,
                options,
                timeout,
            } => Self::Slurm(slurm::SlurmLauncher::new(
                sbatch.clone(),
                squeue.clone(),
                scancel.clone(),
                options.clone(),
                Duration::from_secs(*timeout),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
        }
    }

    /// Start the generated script of a job
    pub fn launch(&self, script: &Path, working_directory: &Path) -> Result<Process, ExecutorError> {
        match self {
            Self::Local(launcher) => launcher.launch(script, working_directory).map(Process::Local),
            Self::Slurm(launcher) => launcher.launch(script, working_directory).map(Process::Slurm),
        }
    }

    /// Find a process again from its persisted handle
    pub fn reattach(&self, handle: &ProcessHandle) -> Result<Process, ExecutorError> {
        match (self, handle) {
            (Self::Local(_), ProcessHandle::Local { pid }) => {
                Ok(Process::Local(local::LocalProcess::Detached { pid: *pid }))
            }
            (Self::Slurm(launcher), ProcessHandle::Slurm { job_id }) => {
                Ok(Process::Slurm(launcher.reattach(job_id.clone())))
            }
            _ => Err(ExecutorError::WrongLauncher {
                handle: handle.clone(),
                launcher: self.name(),
            }),
        }
    }
}

/// A launched job
#[derive(Debug)]
pub enum Process {
    Local(local::LocalProcess),
    Slurm(slurm::SlurmProcess),
}

impl Process {
    pub fn handle(&self) -> ProcessHandle {
        match self {
            Self::Local(process) => ProcessHandle::Local { pid: process.pid() },
            Self::Slurm(process) => ProcessHandle::Slurm {
                job_id: process.job_id().to_owned(),
            },
        }
    }

    pub fn poll(&mut self) -> Result<ProcessState, ExecutorError> {
        match self {
            Self::Local(process) => process.poll(),
            Self::Slurm(process) => process.poll(),
        }
    }

    pub fn kill(&mut self) -> Result<(), ExecutorError> {
        match self {
            Self::Local(process) => process.kill(),
            Self::Slurm(process) => process.kill(),
        }
    }

    /// Wait at most `timeout` for the process to end
    pub fn wait(&mut self, timeout: Duration) -> Result<ProcessState, ExecutorError> {
        match self {
            Self::Local(local::LocalProcess::Child(child)) => local::wait_child(child, timeout),
            _ => {
                let start = Instant::now();
                loop {
                    let state = self.poll()?;
                    if state != ProcessState::Running || start.elapsed() >= timeout {
                        return Ok(state);
                    }
                    thread::sleep(WAIT_POLL_INTERVAL);
                }
            }
        }
    }
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
