use crate::resources::Locator;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, io::Error> {
    File::open(path)
        .and_then(|file| file.metadata())
        .map(|metadata| metadata.is_file() && (metadata.mode() & 0o111) != 0)
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read the configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse the configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration did not pass the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ExpmanConfig {
    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    // Hosts by connector id, the first part of every locator
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,
    // Token resources created when the scheduler starts, by name
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // milliseconds between two status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    // threads turning ready jobs into running ones
    #[serde(default = "default_runners")]
    pub runners: usize,
    // milliseconds a lock file is polled for before giving up
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    // attempts of a write that lost against a concurrent one
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            runners: default_runners(),
            lock_timeout: default_lock_timeout(),
            retries: default_retries(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ConnectorConfig {
    Local {
        // relative locator paths are resolved against it
        #[serde(default)]
        basedir: Option<PathBuf>,
        #[serde(default)]
        launcher: LauncherConfig,
    },
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::Local {
            basedir: None,
            launcher: LauncherConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum LauncherConfig {
    #[default]
    Local,
    Slurm {
        #[serde(default = "default_sbatch")]
        sbatch: PathBuf,
        #[serde(default = "default_squeue")]
        squeue: PathBuf,
        #[serde(default = "default_scancel")]
        scancel: PathBuf,
        // passed to sbatch as is
        #[serde(default)]
        options: Vec<String>,
        // seconds each Slurm command may take
        #[serde(default = "default_slurm_timeout")]
        timeout: u64,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub locator: Locator,
    pub limit: u32,
}

impl ExpmanConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the whole configuration, returns true if an error was found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.scheduler.runners == 0 {
            error!("scheduler.runners is 0, no job would ever be started");
            contains_error = true;
        }

        if self.scheduler.poll_interval == 0 {
            error!("scheduler.poll_interval cannot be 0");
            contains_error = true;
        }

        if self.scheduler.retries == 0 {
            error!("scheduler.retries cannot be 0, every write needs at least one attempt");
            contains_error = true;
        }

        if let Some(parent) = self
            .database
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            if !parent.is_dir() {
                error!(
                    "database.path {} is in a directory that does not exist",
                    self.database.path.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.connectors.is_empty() {
            warn!("No connector was defined, falling back to a single 'local' connector");
            self.connectors
                .insert("local".to_owned(), ConnectorConfig::default());
        }

        for (name, connector) in self.connectors.iter() {
            if name.is_empty() || name.contains(':') {
                error!("connectors.{name} is not a valid connector id, it must be non empty and without ':'");
                contains_error = true;
            }

            let ConnectorConfig::Local { basedir, launcher } = connector;

            if let Some(basedir) = basedir {
                if !basedir.is_dir() {
                    error!(
                        "connectors.{name}.basedir {} is not a directory",
                        basedir.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if let LauncherConfig::Slurm {
                sbatch,
                squeue,
                scancel,
                timeout,
                ..
            } = launcher
            {
                if *timeout == 0 {
                    error!("connectors.{name}.launcher.timeout cannot be 0");
                    contains_error = true;
                }

                // bare command names are looked up in PATH when they are run
                for command in [sbatch, squeue, scancel]
                    .into_iter()
                    .filter(|command| command.is_absolute())
                {
                    match check_executable(command) {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(
                                "connectors.{name}.launcher: {} is not an executable file",
                                command.to_string_lossy()
                            );
                            contains_error = true;
                        }
                        Err(e) => {
                            error!(
                                "connectors.{name}.launcher: failed to inspect {}: {e}",
                                command.to_string_lossy()
                            );
                            contains_error = true;
                        }
                    }
                }
            }
        }

        for (name, token) in self.tokens.iter() {
            if !self.connectors.contains_key(token.locator.connector()) {
                error!(
                    "tokens.{name}.locator {} references connector '{}' which is not defined",
                    token.locator,
                    token.locator.connector()
                );
                contains_error = true;
            }

            if token.limit == 0 {
                warn!("tokens.{name}.limit is 0, jobs depending on it will wait until the limit is raised");
            }
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("expman.db")
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_runners() -> usize {
    1
}

fn default_lock_timeout() -> u64 {
    2000
}

fn default_retries() -> u32 {
    5
}

fn default_sbatch() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_squeue() -> PathBuf {
    PathBuf::from("squeue")
}

fn default_scancel() -> PathBuf {
    PathBuf::from("scancel")
}

fn default_slurm_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_configuration_parses() {
        let config: ExpmanConfig = serde_yaml::from_str(
            "
db:
  path: /tmp/expman.db
scheduler:
  poll_interval: 100
  runners: 4
connectors:
  local:
    type: local
  cluster:
    type: local
    basedir: /scratch
    launcher:
      type: slurm
      options: [--partition=short]
tokens:
  cpus:
    locator: local:/tokens/cpus
    limit: 8
",
        )
        .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/expman.db"));
        assert_eq!(config.scheduler.runners, 4);
        assert_eq!(config.scheduler.retries, 5);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.connectors["local"], ConnectorConfig::default());
        assert_eq!(
            config.connectors["cluster"],
            ConnectorConfig::Local {
                basedir: Some(PathBuf::from("/scratch")),
                launcher: LauncherConfig::Slurm {
                    sbatch: PathBuf::from("sbatch"),
                    squeue: PathBuf::from("squeue"),
                    scancel: PathBuf::from("scancel"),
                    options: vec!["--partition=short".to_owned()],
                    timeout: 30,
                },
            }
        );
        assert_eq!(config.tokens["cpus"].limit, 8);
        assert_eq!(config.tokens["cpus"].locator.path(), "/tokens/cpus");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<ExpmanConfig>("scheduler:\n  threads: 2\n").is_err());
    }

    #[test]
    fn preflight_adds_a_local_connector() {
        let mut config = ExpmanConfig::default();

        assert!(!config.preflight_checks());
        assert_eq!(config.connectors.len(), 1);
        assert!(config.connectors.contains_key("local"));
    }

    #[test]
    fn preflight_reports_every_problem() {
        let mut config: ExpmanConfig = serde_yaml::from_str(
            "
scheduler:
  runners: 0
connectors:
  local:
    type: local
    basedir: /this/path/does/not/exist
tokens:
  gpus:
    locator: remote:/tokens/gpus
    limit: 1
",
        )
        .unwrap();

        assert!(config.preflight_checks());
    }
}
