/*
 * Jobs go through the usual Slurm commands:
 * 1. `sbatch --parsable` submits the generated script and prints the job id
 * 2. `squeue -h -j <id>` lists the job while it is pending or running
 * 3. `scancel <id>` stops it
 * The exit code is not asked from Slurm, the script writes it next to the job.
 */

use super::{ExecutorError, ProcessState};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Clone, Debug)]
pub struct SlurmLauncher {
    sbatch: PathBuf,
    squeue: PathBuf,
    scancel: PathBuf,
    /// extra `sbatch` options, e.g. `--partition=short`
    options: Vec<String>,
    /// limit for each Slurm command
    timeout: Duration,
}

impl SlurmLauncher {
    pub fn new(
        sbatch: PathBuf,
        squeue: PathBuf,
        scancel: PathBuf,
        options: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            sbatch,
            squeue,
            scancel,
            options,
            timeout,
        }
    }

    /// Run a Slurm command and return its standard output
    fn run(&self, program: &Path, arguments: &[String]) -> Result<String, ExecutorError> {
        let name = program.to_string_lossy().into_owned();
        debug!(program = %name, arguments = ?arguments, "Running Slurm command");

        let mut child = Command::new(program)
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: name.clone(),
                source,
            })?;

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                if let Err(error) = child.kill() {
                    warn!(program = %name, error = ?error, "Failed to kill a hanging Slurm command");
                }
                return Err(ExecutorError::Timeout {
                    program: name,
                    timeout: self.timeout,
                });
            }
            Err(source) => return Err(ExecutorError::Spawn { program: name, source }),
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(ExecutorError::Failed {
                program: name,
                status: status.to_string(),
                stderr: stderr.trim().to_owned(),
            })
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub fn launch(&self, script: &Path, working_directory: &Path) -> Result<SlurmProcess, ExecutorError> {
        let mut arguments = vec![
            "--parsable".to_owned(),
            format!("--chdir={}", working_directory.to_string_lossy()),
            "--output=/dev/null".to_owned(),
        ];
        arguments.extend(self.options.iter().cloned());
        arguments.push(script.to_string_lossy().into_owned());

        let output = self.run(&self.sbatch, &arguments)?;
        // `<id>` or `<id>;<cluster>`
        let job_id = output
            .lines()
            .next()
            .and_then(|line| line.split(';').next())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| ExecutorError::Output {
                program: self.sbatch.to_string_lossy().into_owned(),
                output: output.trim().to_owned(),
            })?;

        info!(job_id, "Submitted Slurm job");

        Ok(self.reattach(job_id.to_owned()))
    }

    pub fn reattach(&self, job_id: String) -> SlurmProcess {
        SlurmProcess {
            launcher: self.clone(),
            job_id,
        }
    }
}

#[derive(Debug)]
pub struct SlurmProcess {
    launcher: SlurmLauncher,
    job_id: String,
}

impl SlurmProcess {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// A job unknown to `squeue` is finished
    pub fn poll(&mut self) -> Result<ProcessState, ExecutorError> {
        let arguments = ["-h".to_owned(), "-j".to_owned(), self.job_id.clone()];

        match self.launcher.run(&self.launcher.squeue, &arguments) {
            Ok(output) if output.trim().is_empty() => Ok(ProcessState::Finished(None)),
            Ok(_) => Ok(ProcessState::Running),
            // purged jobs make squeue fail with "Invalid job id specified"
            Err(ExecutorError::Failed { stderr, .. }) if stderr.contains("Invalid job id") => {
                Ok(ProcessState::Finished(None))
            }
            Err(error) => Err(error),
        }
    }

    pub fn kill(&mut self) -> Result<(), ExecutorError> {
        self.launcher
            .run(&self.launcher.scancel, &[self.job_id.clone()])?;
        info!(job_id = %self.job_id, "Cancelled Slurm job");

        Ok(())
    }
}
