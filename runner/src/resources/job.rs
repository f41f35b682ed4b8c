use super::command::Commands;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Launch description and run bookkeeping of a job
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobPayload {
    pub commands: Commands,
    /// defaults to the directory holding the job's artifacts
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    /// defaults to `<path>.out`
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    /// defaults to `<path>.err`
    #[serde(default)]
    pub stderr: Option<PathBuf>,

    // run bookkeeping, in milliseconds since the epoch
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    #[serde(default)]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// external process of the current run
    #[serde(default)]
    pub process: Option<ProcessHandle>,
}

/// Reference to a launched process, enough to find it again after a restart
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "launcher", rename_all = "snake_case")]
pub enum ProcessHandle {
    Local { pid: u32 },
    Slurm { job_id: String },
}

impl JobPayload {
    pub fn new(commands: Commands) -> Self {
        Self {
            commands,
            ..Self::default()
        }
    }

    /// forget everything about the previous run
    pub fn clear_run(&mut self) {
        self.start_timestamp = None;
        self.end_timestamp = None;
        self.exit_code = None;
        self.process = None;
    }
}
