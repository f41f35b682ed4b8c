use super::{ExecutorError, ProcessState};
use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use std::{
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Launcher running job scripts as processes of this machine
#[derive(Clone, Debug)]
pub struct LocalLauncher {
    shell: PathBuf,
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl LocalLauncher {
    /// Spawn the script in its own process group, so that stopping it reaches its children
    #[instrument(skip(self), level = "debug")]
    pub fn launch(&self, script: &Path, working_directory: &Path) -> Result<LocalProcess, ExecutorError> {
        let child = Command::new(&self.shell)
            .arg(script)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.shell.to_string_lossy().into_owned(),
                source,
            })?;

        info!(pid = child.id(), "Started local process");

        Ok(LocalProcess::Child(child))
    }
}

/// A local job process
#[derive(Debug)]
pub enum LocalProcess {
    /// spawned by this scheduler process
    Child(Child),
    /// spawned by an earlier scheduler process, only its pid is known
    Detached { pid: u32 },
}

impl LocalProcess {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Child(child) => child.id(),
            Self::Detached { pid } => *pid,
        }
    }

    pub fn poll(&mut self) -> Result<ProcessState, ExecutorError> {
        match self {
            Self::Child(child) => match child.try_wait() {
                Ok(Some(status)) => Ok(ProcessState::Finished(status.code())),
                Ok(None) => Ok(ProcessState::Running),
                Err(source) => Err(ExecutorError::Spawn {
                    program: format!("process {}", child.id()),
                    source,
                }),
            },
            Self::Detached { pid } => match kill(Pid::from_raw(*pid as i32), None) {
                Ok(()) | Err(Errno::EPERM) => Ok(ProcessState::Running),
                Err(Errno::ESRCH) => Ok(ProcessState::Finished(None)),
                Err(source) => Err(ExecutorError::Signal { pid: *pid, source }),
            },
        }
    }

    /// Send `SIGTERM` to the process group, a vanished group is not an error
    pub fn kill(&mut self) -> Result<(), ExecutorError> {
        let pid = self.pid();

        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, "Sent SIGTERM to process group");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                warn!(pid, "Process group is already gone");
                Ok(())
            }
            Err(source) => Err(ExecutorError::Signal { pid, source }),
        }
    }
}

pub(super) fn wait_child(child: &mut Child, timeout: Duration) -> Result<ProcessState, ExecutorError> {
    match child.wait_timeout(timeout) {
        Ok(Some(status)) => Ok(ProcessState::Finished(status.code())),
        Ok(None) => Ok(ProcessState::Running),
        Err(source) => Err(ExecutorError::Spawn {
            program: format!("process {}", child.id()),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn runs_a_script_to_completion() {
        let directory = tempfile::tempdir().unwrap();
        let script = directory.path().join("job.run");
        fs::write(&script, "echo hello > out\nexit 3\n").unwrap();

        let mut process = LocalLauncher::default()
            .launch(&script, directory.path())
            .unwrap();

        let LocalProcess::Child(child) = &mut process else {
            panic!("expected a child process");
        };
        assert_eq!(
            wait_child(child, Duration::from_secs(10)).unwrap(),
            ProcessState::Finished(Some(3))
        );
        assert_eq!(
            fs::read_to_string(directory.path().join("out")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn killed_processes_stop() {
        let directory = tempfile::tempdir().unwrap();
        let script = directory.path().join("job.run");
        fs::write(&script, "sleep 30\n").unwrap();

        let mut process = LocalLauncher::default()
            .launch(&script, directory.path())
            .unwrap();
        assert_eq!(process.poll().unwrap(), ProcessState::Running);

        process.kill().unwrap();
        let LocalProcess::Child(child) = &mut process else {
            panic!("expected a child process");
        };
        assert!(matches!(
            wait_child(child, Duration::from_secs(10)).unwrap(),
            ProcessState::Finished(_)
        ));
    }

    #[test]
    fn detached_processes_are_polled_by_pid() {
        let directory = tempfile::tempdir().unwrap();
        let script = directory.path().join("job.run");
        fs::write(&script, "sleep 30\n").unwrap();

        let mut process = LocalLauncher::default()
            .launch(&script, directory.path())
            .unwrap();
        let mut detached = LocalProcess::Detached { pid: process.pid() };
        assert_eq!(detached.poll().unwrap(), ProcessState::Running);

        detached.kill().unwrap();
        let LocalProcess::Child(child) = &mut process else {
            panic!("expected a child process");
        };
        wait_child(child, Duration::from_secs(10)).unwrap();
        assert_eq!(detached.poll().unwrap(), ProcessState::Finished(None));
    }
}
