pub mod access;
pub mod command;
pub mod dependency;
pub mod job;
pub mod state;
pub mod token;

pub use access::{DependencyStatus, LockMode, LockType};
pub use command::{Argument, Command, Commands, Placeholder};
pub use dependency::{Dependencies, Dependency, DependencyKind, DependencyMap};
pub use job::{JobPayload, ProcessHandle};
pub use state::ResourceState;
pub use token::TokenPayload;

use crate::{
    distributed::{Artifact, Connector},
    sync::{
        locking::{Lock, LockError},
        status::{AccessStatus, StatusLock},
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt, io,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("{kind} access to {producer} can never be granted (lock mode {mode})")]
    Unsatisfiable {
        producer: Locator,
        kind: DependencyKind,
        mode: LockMode,
    },
    #[error("cannot add a dependency to {locator} while it is {state}")]
    InvalidDependencyState {
        locator: Locator,
        state: ResourceState,
    },
    #[error("cannot overwrite {locator} while it is {state}")]
    CannotOverwrite {
        locator: Locator,
        state: ResourceState,
    },
    #[error("cannot restart {locator} while it is {state}")]
    CannotRestart {
        locator: Locator,
        state: ResourceState,
    },
    #[error("cannot start {locator} while it is {state}")]
    NotReady {
        locator: Locator,
        state: ResourceState,
    },
    #[error("cannot invalidate {locator} while it is {state}")]
    CannotInvalidate {
        locator: Locator,
        state: ResourceState,
    },
    #[error("{0} is a token, it has no outputs to produce again")]
    TokenNotRestartable(Locator),
    #[error("dependencies of {0} were used before being loaded")]
    DependenciesNotLoaded(Locator),
    #[error("{0} is not a token resource")]
    NotAToken(Locator),
    #[error("{0} is not a job")]
    NotAJob(Locator),
    #[error("invalid locator '{0}', expected <connector>:<path>")]
    InvalidLocator(String),
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Stable identity of a resource: the connector it lives on and its path there
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    connector: String,
    path: String,
}

impl Locator {
    pub fn new(connector: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            path: path.into(),
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector, self.path)
    }
}

impl FromStr for Locator {
    type Err = ResourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((connector, path)) if !connector.is_empty() && !path.is_empty() => {
                Ok(Self::new(connector, path))
            }
            _ => Err(ResourceError::InvalidLocator(value.to_owned())),
        }
    }
}

impl TryFrom<String> for Locator {
    type Error = ResourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.to_string()
    }
}

/// Variant specific part of a resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    /// produced elsewhere, only its markers are tracked
    Data,
    Token(TokenPayload),
    Job(JobPayload),
}

/// Why a status update put a resource on hold
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Hold {
    pub reason: String,
    /// state interrupted by the failure
    pub previous: ResourceState,
}

/// What an operation changed and has to be written back
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Changes {
    /// the resource row itself
    pub state: bool,
    pub dependencies: BTreeSet<Locator>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        !self.state && self.dependencies.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub(crate) locator: Locator,
    pub(crate) group: Option<String>,
    pub(crate) state: ResourceState,
    pub(crate) lock_mode: LockMode,
    pub(crate) dependencies: Dependencies,
    pub(crate) nb_unsatisfied: u32,
    pub(crate) nb_holding: u32,
    pub(crate) locked: bool,
    pub(crate) access: AccessStatus,
    pub(crate) hold: Option<Hold>,
    pub(crate) kind: ResourceKind,
    /// 0 until the resource has been stored
    pub(crate) version: u64,
}

impl Resource {
    /// Tokens start out done, everything else waits
    pub fn new(locator: Locator, kind: ResourceKind) -> Self {
        let state = match kind {
            ResourceKind::Token(_) => ResourceState::Done,
            _ => ResourceState::Waiting,
        };

        Self {
            locator,
            group: None,
            state,
            lock_mode: LockMode::default(),
            dependencies: Dependencies::empty(),
            nb_unsatisfied: 0,
            nb_holding: 0,
            locked: false,
            access: AccessStatus::default(),
            hold: None,
            kind,
            version: 0,
        }
    }

    pub fn data(locator: Locator) -> Self {
        Self::new(locator, ResourceKind::Data)
    }

    pub fn token(locator: Locator, limit: u32) -> Self {
        Self::new(locator, ResourceKind::Token(TokenPayload::new(limit)))
    }

    pub fn job(locator: Locator, payload: JobPayload) -> Self {
        Self::new(locator, ResourceKind::Job(payload))
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn nb_unsatisfied(&self) -> u32 {
        self.nb_unsatisfied
    }

    pub fn nb_holding(&self) -> u32 {
        self.nb_holding
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn access(&self) -> &AccessStatus {
        &self.access
    }

    pub fn hold(&self) -> Option<&Hold> {
        self.hold.as_ref()
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ResourceKind::Data => "data",
            ResourceKind::Token(_) => "token",
            ResourceKind::Job(_) => "job",
        }
    }

    /// `None` while the dependencies have not been read from storage
    pub fn dependencies(&self) -> Option<&DependencyMap> {
        self.dependencies.loaded()
    }

    pub fn job_payload(&self) -> Option<&JobPayload> {
        match &self.kind {
            ResourceKind::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn job_mut(&mut self) -> Option<&mut JobPayload> {
        match &mut self.kind {
            ResourceKind::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn token_payload(&self) -> Option<&TokenPayload> {
        match &self.kind {
            ResourceKind::Token(token) => Some(token),
            _ => None,
        }
    }

    pub fn is_blocking_token(&self) -> bool {
        self.token_payload().map_or(false, TokenPayload::is_blocking)
    }

    /// name used for this resource in the status files of its producers
    pub fn holder_id(&self) -> String {
        self.locator
            .to_string()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect()
    }

    /// the dependency to blame first when the resource does not move
    pub fn blocking_dependency(&self) -> Option<&Dependency> {
        let dependencies = self.dependencies.loaded()?;

        dependencies
            .values()
            .find(|dependency| dependency.is_holding())
            .or_else(|| dependencies.values().find(|dependency| !dependency.satisfied))
    }

    fn set_state(&mut self, state: ResourceState) -> bool {
        if self.state == state {
            false
        } else {
            self.state = state;
            true
        }
    }

    /// Answer of this resource to a dependent asking for `kind`
    pub fn accept(&self, kind: DependencyKind) -> DependencyStatus {
        match (kind, &self.kind) {
            (DependencyKind::Token, ResourceKind::Token(token)) => {
                if self.state.is_blocking() {
                    DependencyStatus::Hold
                } else {
                    token.accept()
                }
            }
            (DependencyKind::Token, _) => DependencyStatus::Error,
            (DependencyKind::Lock(lock_type), _) => access::accept(
                self.state,
                self.lock_mode,
                self.access.readers,
                self.access.writers,
                lock_type,
            ),
        }
    }

    /// Edge from this resource to `dependent`, evaluated against the current state
    pub fn create_dependency(&self, dependent: &Locator, lock_type: LockType) -> Dependency {
        let kind = match self.kind {
            ResourceKind::Token(_) => DependencyKind::Token,
            _ => DependencyKind::Lock(lock_type),
        };

        Dependency {
            from: self.locator.clone(),
            to: dependent.clone(),
            kind,
            satisfied: self.accept(kind).is_ok(),
            producer_state: self.state,
            locked: false,
        }
    }

    /// Register `producer` as a dependency, before the resource is submitted
    pub fn add_dependency(
        &mut self,
        producer: &Resource,
        lock_type: LockType,
    ) -> Result<(), ResourceError> {
        if !matches!(
            self.state,
            ResourceState::Waiting | ResourceState::Ready | ResourceState::OnHold
        ) {
            return Err(ResourceError::InvalidDependencyState {
                locator: self.locator.clone(),
                state: self.state,
            });
        }

        let dependency = producer.create_dependency(&self.locator, lock_type);
        if producer.accept(dependency.kind) == DependencyStatus::Error {
            return Err(ResourceError::Unsatisfiable {
                producer: producer.locator.clone(),
                kind: dependency.kind,
                mode: producer.lock_mode,
            });
        }

        let Some(dependencies) = self.dependencies.loaded_mut() else {
            return Err(ResourceError::DependenciesNotLoaded(self.locator.clone()));
        };

        let (satisfied, holding) = (dependency.satisfied, dependency.is_holding());
        if let Some(previous) = dependencies.insert(producer.locator.clone(), dependency) {
            if !previous.satisfied {
                self.nb_unsatisfied = self.nb_unsatisfied.saturating_sub(1);
            }
            if previous.is_holding() {
                self.nb_holding = self.nb_holding.saturating_sub(1);
            }
        }

        if !satisfied {
            self.nb_unsatisfied += 1;
        }

        if holding {
            self.nb_holding += 1;
            self.state = ResourceState::OnHold;
        } else if self.nb_holding == 0 && self.state == ResourceState::OnHold && self.hold.is_none()
        {
            self.state = ResourceState::Waiting;
        }

        if self.state == ResourceState::Ready && self.nb_unsatisfied > 0 {
            self.state = ResourceState::Waiting;
        }

        Ok(())
    }

    /// Promote a waiting resource once nothing is missing, or demote a ready one
    pub fn ready(&mut self) -> bool {
        if !matches!(self.state, ResourceState::Waiting | ResourceState::Ready) {
            return false;
        }

        if self.nb_unsatisfied == 0 && self.nb_holding == 0 {
            self.set_state(ResourceState::Ready)
        } else {
            self.set_state(ResourceState::Waiting)
        }
    }

    /// Re-evaluate the dependency on `producer` after it changed
    ///
    /// Evaluating the same producer state twice is a no-op.
    pub fn check_dependency(
        &mut self,
        producer: &Resource,
        reset: bool,
        changes: &mut Changes,
    ) -> Result<(), ResourceError> {
        let Some(dependencies) = self.dependencies.loaded_mut() else {
            return Err(ResourceError::DependenciesNotLoaded(self.locator.clone()));
        };

        let Some(dependency) = dependencies.get_mut(&producer.locator) else {
            error!(
                locator = %self.locator,
                producer = %producer.locator,
                "Could not retrieve the dependency of a notifying producer"
            );
            self.nb_holding += 1;
            self.nb_unsatisfied += 1;
            if self.set_state(ResourceState::OnHold) {
                changes.state = true;
            }
            return Ok(());
        };

        if reset {
            dependency.satisfied = true;
        }

        // a dependent holding its lock keeps it whatever the producer says
        let now_ok = dependency.locked || producer.accept(dependency.kind).is_ok();
        let diff = dependency.satisfied as i64 - now_ok as i64;
        let was_holding = dependency.is_holding();
        let now_holding = producer.state.is_blocking();

        debug!(
            locator = %self.locator,
            producer = %producer.locator,
            kind = %dependency.kind,
            ok = now_ok,
            diff,
            "Checking dependency"
        );

        // same answer, same side of the blocking boundary
        if diff == 0 && was_holding == now_holding {
            return Ok(());
        }

        if now_holding && !was_holding {
            self.nb_holding += 1;

            // a running process is left alone, its counters still follow
            if self.state != ResourceState::Running && self.state != ResourceState::OnHold {
                debug!(locator = %self.locator, "Putting resource on hold");
                self.state = ResourceState::OnHold;
            }
        } else if was_holding && !now_holding {
            self.nb_holding = self.nb_holding.saturating_sub(1);
            if self.nb_holding == 0 && self.state == ResourceState::OnHold && self.hold.is_none() {
                self.state = ResourceState::Waiting;
            }
        }

        self.nb_unsatisfied = self.nb_unsatisfied.saturating_add_signed(diff as i32);
        dependency.satisfied = now_ok;
        dependency.producer_state = producer.state;
        changes.dependencies.insert(producer.locator.clone());

        if self.nb_unsatisfied == 0 {
            if self.state == ResourceState::Waiting && self.nb_holding == 0 {
                self.state = ResourceState::Ready;
            }
        } else if self.state == ResourceState::Ready {
            self.state = ResourceState::Waiting;
        }

        changes.state = true;
        debug!(
            locator = %self.locator,
            state = %self.state,
            unsatisfied = self.nb_unsatisfied,
            holding = self.nb_holding,
            "Checked dependency"
        );

        Ok(())
    }

    /// Poll the markers of the resource, a failure puts it on hold instead of propagating
    #[instrument(skip(self, connector, changes), fields(locator = %self.locator), level = "debug")]
    pub fn update_status(&mut self, connector: &dyn Connector, changes: &mut Changes) {
        if let Err(error) = self.do_update_status(connector, changes) {
            warn!(error = %error, "Status update failed, putting the resource on hold");

            match &mut self.hold {
                Some(hold) => hold.reason = error.to_string(),
                None => {
                    self.hold = Some(Hold {
                        reason: error.to_string(),
                        previous: self.state,
                    })
                }
            }
            self.state = ResourceState::OnHold;
            changes.state = true;
        }
    }

    fn do_update_status(
        &mut self,
        connector: &dyn Connector,
        changes: &mut Changes,
    ) -> Result<(), io::Error> {
        let base = connector.resolve(self.locator.path());

        if self
            .access
            .refresh(connector, &Artifact::Status.path(&base))?
        {
            changes.state = true;
        }

        let locked = connector.stat(&Artifact::Lock.path(&base))?.is_some();
        if locked != self.locked {
            self.locked = locked;
            changes.state = true;
        }

        if let Some(hold) = self.hold.take() {
            info!(reason = %hold.reason, "Status update succeeded again, lifting the hold");

            if self.state == ResourceState::OnHold && self.nb_holding == 0 {
                self.state = match hold.previous {
                    ResourceState::OnHold => ResourceState::Waiting,
                    previous => previous,
                };
                self.ready();
            }
            changes.state = true;
        }

        if matches!(self.kind, ResourceKind::Token(_)) {
            return Ok(());
        }

        if let Some(done) = connector.stat(&Artifact::Done.path(&base))? {
            if self.state != ResourceState::Done {
                debug!("Found the done marker");
                self.state = ResourceState::Done;
                if let ResourceKind::Job(job) = &mut self.kind {
                    job.end_timestamp = Some(done.millis());
                    job.exit_code.get_or_insert(0);
                }
                changes.state = true;
            }
        } else if self.state == ResourceState::Running {
            if let ResourceKind::Job(job) = &mut self.kind {
                let code_path = Artifact::Code.path(&base);

                if let Some(stamp) = connector.stat(&code_path)? {
                    let content = connector.read_to_string(&code_path)?;
                    let code = content.trim().parse::<i32>().unwrap_or_else(|_| {
                        warn!(content = %content.trim(), "Malformed exit code file");
                        -1
                    });

                    // a zero code is followed by the done marker
                    if code != 0 {
                        info!(code, "Job failed");
                        self.state = ResourceState::Error;
                        job.exit_code = Some(code);
                        job.end_timestamp = Some(stamp.millis());
                        changes.state = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Take the lock a dependency of kind `kind` needs on this resource
    ///
    /// `None` means no physical lock is needed (generated outputs, tokens).
    pub fn lock(
        &self,
        connector: &Arc<dyn Connector>,
        holder: &str,
        kind: DependencyKind,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Lock>>, LockError> {
        let base = connector.resolve(self.locator.path());

        match self.accept(kind) {
            DependencyStatus::Wait | DependencyStatus::Hold => Err(LockError::Unlockable {
                path: base,
                reason: format!("{kind} access is not available yet"),
            }),
            DependencyStatus::Error => Err(LockError::Refused {
                locator: self.locator.clone(),
                kind,
            }),
            DependencyStatus::OkLock => connector
                .create_lock_file(&Artifact::Lock.path(&base), timeout)
                .map(Some),
            DependencyStatus::Ok => match kind {
                DependencyKind::Lock(lock_type @ (LockType::ReadAccess | LockType::WriteAccess)) => {
                    let lock = StatusLock::acquire(
                        connector.clone(),
                        &base,
                        holder,
                        lock_type == LockType::WriteAccess,
                        timeout,
                    )?;

                    Ok(Some(Box::new(lock)))
                }
                _ => Ok(None),
            },
        }
    }

    /// Back to waiting, forgetting the previous run
    pub fn restart(&mut self) -> Result<(), ResourceError> {
        if matches!(self.kind, ResourceKind::Token(_)) {
            return Err(ResourceError::TokenNotRestartable(self.locator.clone()));
        }
        if self.state.is_active() {
            return Err(ResourceError::CannotRestart {
                locator: self.locator.clone(),
                state: self.state,
            });
        }

        self.reset_run();
        Ok(())
    }

    /// Back to waiting from done, the outputs have to be produced again
    pub fn invalidate(&mut self) -> Result<(), ResourceError> {
        if matches!(self.kind, ResourceKind::Token(_)) {
            return Err(ResourceError::TokenNotRestartable(self.locator.clone()));
        }
        if self.state != ResourceState::Done {
            return Err(ResourceError::CannotInvalidate {
                locator: self.locator.clone(),
                state: self.state,
            });
        }

        self.reset_run();
        Ok(())
    }

    fn reset_run(&mut self) {
        self.state = if self.nb_holding > 0 {
            ResourceState::OnHold
        } else {
            ResourceState::Waiting
        };
        self.hold = None;
        if let ResourceKind::Job(job) = &mut self.kind {
            job.clear_run();
        }
        self.ready();
    }

    /// Move a ready job to running, `held` are the producers it took a lock or slot on
    pub fn start_run(
        &mut self,
        held: &BTreeSet<Locator>,
        timestamp: i64,
        changes: &mut Changes,
    ) -> Result<(), ResourceError> {
        if self.state != ResourceState::Ready {
            return Err(ResourceError::NotReady {
                locator: self.locator.clone(),
                state: self.state,
            });
        }

        let Some(dependencies) = self.dependencies.loaded_mut() else {
            return Err(ResourceError::DependenciesNotLoaded(self.locator.clone()));
        };
        for producer in held {
            if let Some(dependency) = dependencies.get_mut(producer) {
                dependency.locked = true;
                changes.dependencies.insert(producer.clone());
            }
        }

        self.state = ResourceState::Running;
        self.hold = None;
        if let ResourceKind::Job(job) = &mut self.kind {
            job.clear_run();
            job.start_timestamp = Some(timestamp);
        }
        changes.state = true;

        Ok(())
    }

    /// Forget every lock held on producers once the run is over
    pub fn unlock_dependencies(&mut self, changes: &mut Changes) {
        if let Some(dependencies) = self.dependencies.loaded_mut() {
            for dependency in dependencies.values_mut().filter(|dependency| dependency.locked) {
                dependency.locked = false;
                changes.dependencies.insert(dependency.from.clone());
            }
        }
    }

    /// Whether a run is in progress, also when a failed poll put it on hold
    pub fn in_run(&self) -> bool {
        match (self.state, &self.hold) {
            (ResourceState::Running, _) => true,
            (ResourceState::OnHold, Some(hold)) => hold.previous == ResourceState::Running,
            _ => false,
        }
    }

    /// A run ended without leaving a done marker
    ///
    /// On hold after a failed poll, the error is what lifting the hold restores.
    pub fn fail(&mut self, code: Option<i32>, timestamp: i64) {
        match &mut self.hold {
            Some(hold) if self.state == ResourceState::OnHold => hold.previous = ResourceState::Error,
            _ => self.state = ResourceState::Error,
        }
        if let ResourceKind::Job(job) = &mut self.kind {
            if code.is_some() {
                job.exit_code = code;
            }
            job.end_timestamp.get_or_insert(timestamp);
        }
    }

    /// A running job was stopped, back in line if `restart` is set
    pub fn stop(&mut self, restart: bool, timestamp: i64) {
        if restart {
            self.reset_run();
        } else {
            self.fail(None, timestamp);
        }
    }

    /// Dependencies as declared, counters reset, to be evaluated again against stored producers
    pub(crate) fn take_dependencies(&mut self) -> Vec<(Locator, LockType)> {
        let declared = self
            .dependencies
            .loaded()
            .map(|dependencies| {
                dependencies
                    .values()
                    .map(|dependency| {
                        let lock_type = match dependency.kind {
                            DependencyKind::Lock(lock_type) => lock_type,
                            DependencyKind::Token => LockType::Generated,
                        };
                        (dependency.from.clone(), lock_type)
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.dependencies = Dependencies::empty();
        self.nb_unsatisfied = 0;
        self.nb_holding = 0;
        if self.state == ResourceState::OnHold && self.hold.is_none() {
            self.state = ResourceState::Waiting;
        }

        declared
    }

    /// Delete the markers and outputs of the last run
    pub fn clean(&self, connector: &dyn Connector) -> Result<(), io::Error> {
        let base = connector.resolve(self.locator.path());

        for artifact in Artifact::OUTPUTS {
            if connector.remove(&artifact.path(&base))? {
                debug!(locator = %self.locator, artifact = ?artifact, "Removed artifact");
            }
        }

        Ok(())
    }

    /// Check that this resource may take the place of `old`
    pub fn replace(&self, old: &Resource) -> Result<(), ResourceError> {
        if old.state.is_updatable() {
            Ok(())
        } else {
            Err(ResourceError::CannotOverwrite {
                locator: old.locator.clone(),
                state: old.state,
            })
        }
    }

    /// Take a token slot, failing while all slots are used
    pub fn acquire_token(&mut self) -> Result<(), LockError> {
        let ResourceKind::Token(token) = &mut self.kind else {
            return Err(LockError::Refused {
                locator: self.locator.clone(),
                kind: DependencyKind::Token,
            });
        };

        if token.is_blocking() {
            return Err(LockError::Unlockable {
                path: self.locator.path().into(),
                reason: format!("all {} tokens are in use", token.limit),
            });
        }

        token.increase_used_tokens();
        debug!(locator = %self.locator, used = token.used_tokens(), limit = token.limit, "Token acquired");

        Ok(())
    }

    /// Give a token slot back, over-releasing is reported and ignored
    pub fn release_token(&mut self) -> Result<(), ResourceError> {
        let ResourceKind::Token(token) = &mut self.kind else {
            return Err(ResourceError::NotAToken(self.locator.clone()));
        };

        if token.unlock() {
            debug!(locator = %self.locator, used = token.used_tokens(), limit = token.limit, "Token released");
        } else {
            warn!(locator = %self.locator, "Released a token that was not taken");
        }

        Ok(())
    }

    pub fn set_token_limit(&mut self, limit: u32) -> Result<(), ResourceError> {
        let ResourceKind::Token(token) = &mut self.kind else {
            return Err(ResourceError::NotAToken(self.locator.clone()));
        };

        info!(locator = %self.locator, from = token.limit, to = limit, "Changing token limit");
        token.limit = limit;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(path: &str) -> Locator {
        Locator::new("local", path)
    }

    fn waiting_job(path: &str) -> Resource {
        Resource::job(locator(path), JobPayload::default())
    }

    fn check(resource: &mut Resource, producer: &Resource) -> Changes {
        let mut changes = Changes::default();
        resource
            .check_dependency(producer, false, &mut changes)
            .unwrap();
        changes
    }

    #[test]
    fn locators_round_trip_through_strings() {
        let locator: Locator = "local:/tmp/a:b".parse().unwrap();
        assert_eq!(locator.connector(), "local");
        assert_eq!(locator.path(), "/tmp/a:b");
        assert_eq!(locator.to_string(), "local:/tmp/a:b");

        assert!("/tmp/no-connector".parse::<Locator>().is_err());
        assert!(":/tmp/empty".parse::<Locator>().is_err());
    }

    #[test]
    fn add_dependency_counts_unsatisfied_producers() {
        let producer = Resource::data(locator("/p")).with_lock_mode(LockMode::MultipleWriter);
        let mut job = waiting_job("/j");

        job.add_dependency(&producer, LockType::ReadAccess).unwrap();

        assert_eq!(job.nb_unsatisfied(), 1);
        assert_eq!(job.nb_holding(), 0);
        assert_eq!(job.state(), ResourceState::Waiting);
        assert!(!job.dependencies().unwrap()[producer.locator()].satisfied);
    }

    #[test]
    fn add_dependency_on_a_blocked_producer_holds() {
        let producer = Resource::data(locator("/p")).with_state(ResourceState::Error);
        let mut job = waiting_job("/j");

        job.add_dependency(&producer, LockType::Generated).unwrap();

        assert_eq!(job.nb_holding(), 1);
        assert_eq!(job.state(), ResourceState::OnHold);
    }

    #[test]
    fn write_access_on_read_only_is_refused() {
        let producer = Resource::data(locator("/p")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j");

        let error = job
            .add_dependency(&producer, LockType::WriteAccess)
            .unwrap_err();

        assert!(matches!(error, ResourceError::Unsatisfiable { .. }));
        assert_eq!(job.dependencies().unwrap().len(), 0);
        assert_eq!(job.nb_unsatisfied(), 0);
    }

    #[test]
    fn add_dependency_requires_a_fresh_resource() {
        let producer = Resource::data(locator("/p")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j").with_state(ResourceState::Running);

        assert!(matches!(
            job.add_dependency(&producer, LockType::Generated),
            Err(ResourceError::InvalidDependencyState { .. })
        ));
    }

    #[test]
    fn producer_completion_makes_the_dependent_ready() {
        let mut producer = Resource::data(locator("/p")).with_lock_mode(LockMode::MultipleWriter);
        let mut job = waiting_job("/j");
        job.add_dependency(&producer, LockType::ReadAccess).unwrap();
        assert_eq!(job.nb_unsatisfied(), 1);

        producer.state = ResourceState::Done;
        let changes = check(&mut job, &producer);

        assert!(changes.state);
        assert!(changes.dependencies.contains(producer.locator()));
        assert_eq!(job.nb_unsatisfied(), 0);
        assert_eq!(job.state(), ResourceState::Ready);
    }

    #[test]
    fn second_notification_is_a_no_op() {
        let mut producer = Resource::data(locator("/p"));
        let mut job = waiting_job("/j");
        job.add_dependency(&producer, LockType::Generated).unwrap();

        producer.state = ResourceState::Done;
        check(&mut job, &producer);
        let snapshot = job.clone();

        let changes = check(&mut job, &producer);
        assert!(changes.is_empty());
        assert_eq!(job, snapshot);
    }

    #[test]
    fn regression_of_a_producer_demotes_ready() {
        let mut producer = Resource::data(locator("/p")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j");
        job.add_dependency(&producer, LockType::Generated).unwrap();
        job.ready();
        assert_eq!(job.state(), ResourceState::Ready);

        producer.state = ResourceState::Waiting;
        check(&mut job, &producer);

        assert_eq!(job.state(), ResourceState::Waiting);
        assert_eq!(job.nb_unsatisfied(), 1);
    }

    #[test]
    fn failing_producer_holds_then_releases() {
        let mut producer = Resource::data(locator("/p")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j");
        job.add_dependency(&producer, LockType::Generated).unwrap();
        job.ready();

        producer.state = ResourceState::Error;
        check(&mut job, &producer);
        assert_eq!(job.state(), ResourceState::OnHold);
        assert_eq!(job.nb_holding(), 1);
        assert_eq!(job.nb_unsatisfied(), 1);

        producer.state = ResourceState::Done;
        check(&mut job, &producer);
        assert_eq!(job.nb_holding(), 0);
        assert_eq!(job.nb_unsatisfied(), 0);
        assert_eq!(job.state(), ResourceState::Ready);
    }

    #[test]
    fn restarted_producer_lifts_the_hold() {
        let mut producer = Resource::data(locator("/p")).with_state(ResourceState::Error);
        let mut job = waiting_job("/j");
        job.add_dependency(&producer, LockType::Generated).unwrap();
        assert_eq!(job.state(), ResourceState::OnHold);

        producer.state = ResourceState::Waiting;
        let changes = check(&mut job, &producer);

        assert!(changes.state);
        assert_eq!(job.nb_holding(), 0);
        assert_eq!(job.nb_unsatisfied(), 1);
        assert_eq!(job.state(), ResourceState::Waiting);
    }

    #[test]
    fn unknown_producer_puts_the_dependent_on_hold() {
        let stranger = Resource::data(locator("/stranger")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j");

        let changes = check(&mut job, &stranger);

        assert!(changes.state);
        assert_eq!(job.state(), ResourceState::OnHold);
        assert_eq!(job.nb_holding(), 1);
        assert_eq!(job.nb_unsatisfied(), 1);
    }

    #[test]
    fn unloaded_dependencies_are_a_contract_violation() {
        let producer = Resource::data(locator("/p"));
        let mut job = waiting_job("/j");
        job.dependencies = Dependencies::NotLoaded;

        assert!(matches!(
            job.check_dependency(&producer, false, &mut Changes::default()),
            Err(ResourceError::DependenciesNotLoaded(_))
        ));
    }

    #[test]
    fn token_slots_gate_dependents() {
        let mut token = Resource::token(locator("/token"), 1);
        let mut first = waiting_job("/a");
        let mut second = waiting_job("/b");
        first.add_dependency(&token, LockType::Generated).unwrap();
        second.add_dependency(&token, LockType::Generated).unwrap();
        first.ready();
        second.ready();

        token.acquire_token().unwrap();
        first
            .dependencies
            .loaded_mut()
            .unwrap()
            .get_mut(token.locator())
            .unwrap()
            .locked = true;
        assert!(token.is_blocking_token());
        assert!(matches!(
            token.acquire_token(),
            Err(LockError::Unlockable { .. })
        ));

        check(&mut first, &token);
        check(&mut second, &token);
        assert_eq!(first.state(), ResourceState::Ready);
        assert_eq!(second.state(), ResourceState::Waiting);

        token.release_token().unwrap();
        check(&mut second, &token);
        assert_eq!(second.state(), ResourceState::Ready);
    }

    #[test]
    fn replace_only_overwrites_updatable_states() {
        let new = waiting_job("/j");

        for state in ResourceState::ALL {
            let old = waiting_job("/j").with_state(state);
            let snapshot = old.clone();
            let result = new.replace(&old);

            assert_eq!(result.is_ok(), state.is_updatable(), "{state}");
            assert_eq!(old, snapshot);
        }
    }

    #[test]
    fn restart_and_invalidate_preconditions() {
        let mut running = waiting_job("/r").with_state(ResourceState::Running);
        assert!(matches!(
            running.restart(),
            Err(ResourceError::CannotRestart { .. })
        ));

        let mut failed = waiting_job("/f").with_state(ResourceState::Error);
        failed.restart().unwrap();
        assert_eq!(failed.state(), ResourceState::Ready);

        let mut waiting = waiting_job("/w");
        assert!(matches!(
            waiting.invalidate(),
            Err(ResourceError::CannotInvalidate { .. })
        ));

        let mut done = waiting_job("/d").with_state(ResourceState::Done);
        done.job_mut().unwrap().exit_code = Some(0);
        done.invalidate().unwrap();
        assert_eq!(done.state(), ResourceState::Ready);
        assert_eq!(done.job_payload().unwrap().exit_code, None);

        let mut token = Resource::token(locator("/t"), 1).with_state(ResourceState::Done);
        assert!(matches!(
            token.restart(),
            Err(ResourceError::TokenNotRestartable(_))
        ));
        assert!(matches!(
            token.invalidate(),
            Err(ResourceError::TokenNotRestartable(_))
        ));
        assert_eq!(token.state(), ResourceState::Done);
    }

    #[test]
    fn runs_failing_on_hold_fail_once_the_hold_lifts() {
        let mut job = waiting_job("/j").with_state(ResourceState::OnHold);
        job.hold = Some(Hold {
            reason: "storage is unreachable".to_owned(),
            previous: ResourceState::Running,
        });
        assert!(job.in_run());

        job.fail(Some(0), 3000);

        assert_eq!(job.state(), ResourceState::OnHold);
        assert_eq!(job.hold().map(|hold| hold.previous), Some(ResourceState::Error));
        assert!(!job.in_run());
        assert_eq!(job.job_payload().unwrap().exit_code, Some(0));
        assert_eq!(job.job_payload().unwrap().end_timestamp, Some(3000));

        // held by a producer, not by a failed poll
        let held = waiting_job("/k").with_state(ResourceState::OnHold);
        assert!(!held.in_run());
    }

    #[test]
    fn run_lifecycle_marks_and_unmarks_locks() {
        let token = Resource::token(locator("/token"), 1);
        let data = Resource::data(locator("/d")).with_state(ResourceState::Done);
        let mut job = waiting_job("/j");
        job.add_dependency(&token, LockType::Generated).unwrap();
        job.add_dependency(&data, LockType::Generated).unwrap();
        job.ready();

        let mut changes = Changes::default();
        let held = BTreeSet::from([token.locator().clone()]);
        job.start_run(&held, 1000, &mut changes).unwrap();

        assert_eq!(job.state(), ResourceState::Running);
        assert_eq!(job.job_payload().unwrap().start_timestamp, Some(1000));
        assert!(job.dependencies().unwrap()[token.locator()].locked);
        assert!(!job.dependencies().unwrap()[data.locator()].locked);
        assert!(matches!(
            job.start_run(&held, 1000, &mut changes),
            Err(ResourceError::NotReady { .. })
        ));

        let mut changes = Changes::default();
        job.unlock_dependencies(&mut changes);
        job.fail(Some(2), 2000);

        assert_eq!(changes.dependencies, held);
        assert_eq!(job.state(), ResourceState::Error);
        assert_eq!(job.job_payload().unwrap().exit_code, Some(2));
        assert_eq!(job.job_payload().unwrap().end_timestamp, Some(2000));
    }

    #[test]
    fn stopping_with_restart_requeues() {
        let mut job = waiting_job("/j").with_state(ResourceState::Running);
        job.stop(true, 10);
        assert_eq!(job.state(), ResourceState::Ready);

        let mut job = waiting_job("/j").with_state(ResourceState::Running);
        job.stop(false, 10);
        assert_eq!(job.state(), ResourceState::Error);
    }

    #[test]
    fn taking_dependencies_resets_counters() {
        let failed = Resource::data(locator("/f")).with_state(ResourceState::Error);
        let mut job = waiting_job("/j");
        job.add_dependency(&failed, LockType::ReadAccess).unwrap();
        assert_eq!(job.state(), ResourceState::OnHold);

        let declared = job.take_dependencies();

        assert_eq!(declared, vec![(failed.locator().clone(), LockType::ReadAccess)]);
        assert_eq!((job.nb_unsatisfied(), job.nb_holding()), (0, 0));
        assert_eq!(job.state(), ResourceState::Waiting);
        assert_eq!(job.dependencies().unwrap().len(), 0);
    }

    #[test]
    fn blocking_dependency_prefers_holders() {
        let waiting = Resource::data(locator("/a"));
        let failed = Resource::data(locator("/b")).with_state(ResourceState::Error);
        let mut job = waiting_job("/j");
        job.add_dependency(&waiting, LockType::Generated).unwrap();
        job.add_dependency(&failed, LockType::Generated).unwrap();

        assert_eq!(
            job.blocking_dependency().map(|dependency| &dependency.from),
            Some(failed.locator())
        );
    }
}
