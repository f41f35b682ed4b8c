use super::{runner::Outcome, Message, Scheduler, SchedulerError};
use crate::{
    distributed::util::now_millis,
    executors::{script, ProcessState},
    resources::{
        Dependency, DependencyKind, Hold, LockMode, Locator, Resource, ResourceError,
        ResourceKind, ResourceState,
    },
};
use globset::Glob;
use serde::Serialize;
use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// how long a killed process gets to exit before its run is closed anyway
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Outcome of an operation over several resources, the batch goes on after a failure
#[derive(Debug, Default)]
pub struct BatchReport {
    pub count: usize,
    pub failures: Vec<(Locator, SchedulerError)>,
}

impl BatchReport {
    fn record(&mut self, locator: &Locator, result: Result<usize, SchedulerError>) {
        match result {
            Ok(count) => self.count += count,
            Err(error) => {
                warn!(locator = %locator, error = %error, "Operation failed");
                self.failures.push((locator.clone(), error));
            }
        }
    }
}

/// What an operator sees of a resource
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceInformation {
    pub locator: Locator,
    pub group: Option<String>,
    pub state: ResourceState,
    pub lock_mode: LockMode,
    pub nb_unsatisfied: u32,
    pub nb_holding: u32,
    pub locked: bool,
    pub readers: u32,
    pub writers: u32,
    pub hold: Option<Hold>,
    /// first dependency keeping the resource from running
    pub blocking: Option<Dependency>,
    pub details: ResourceKind,
}

impl From<&Resource> for ResourceInformation {
    fn from(resource: &Resource) -> Self {
        Self {
            locator: resource.locator().clone(),
            group: resource.group().map(str::to_owned),
            state: resource.state(),
            lock_mode: resource.lock_mode(),
            nb_unsatisfied: resource.nb_unsatisfied(),
            nb_holding: resource.nb_holding(),
            locked: resource.is_locked(),
            readers: resource.access().readers,
            writers: resource.access().writers,
            hold: resource.hold().cloned(),
            blocking: resource.blocking_dependency().cloned(),
            details: resource.kind().clone(),
        }
    }
}

fn has_glob_characters(target: &str) -> bool {
    target.contains(&['*', '?', '[', '{'][..])
}

impl Scheduler {
    /// Put a resource back in line, returns the number of resources restarted
    ///
    /// Active resources are left alone, done ones only with `restart_done`.
    /// With `recursive`, the dependents of a restarted done resource are
    /// invalidated too.
    #[instrument(skip(self), fields(locator = %locator), level = "info")]
    pub fn restart(
        &self,
        locator: &Locator,
        restart_done: bool,
        recursive: bool,
    ) -> Result<usize, SchedulerError> {
        let connector = self.connector(locator)?.clone();

        let (restarted, notice) = self.apply(locator, |_, resource, changes| {
            match resource.state() {
                ResourceState::Running => return Err(SchedulerError::Running(locator.clone())),
                state if state.is_active() => return Ok(None),
                ResourceState::Done if !restart_done => return Ok(None),
                _ => {}
            }

            let previous = resource.state();
            // refused restarts leave the files alone
            resource.restart()?;
            resource.clean(connector.as_ref())?;
            changes.state = true;
            Ok(Some(previous))
        })?;
        self.settle(notice);

        let Some(previous) = restarted else {
            debug!("Nothing to restart");
            return Ok(0);
        };
        info!(from = %previous, "Restarted resource");

        let mut count = 1;
        if recursive && previous == ResourceState::Done {
            count += self.invalidate_dependents(locator, true)?;
        }

        Ok(count)
    }

    /// Make a done resource produce its outputs again, along with its done dependents
    ///
    /// With `recursive`, dependents that are running are stopped and put
    /// back in line, failed or held ones are restarted. Invalidating a
    /// resource that is waiting again is a no-op.
    #[instrument(skip(self), fields(locator = %locator), level = "info")]
    pub fn invalidate(&self, locator: &Locator, recursive: bool) -> Result<usize, SchedulerError> {
        if !self.invalidate_resource(locator)? {
            return Ok(0);
        }

        Ok(1 + self.invalidate_dependents(locator, recursive)?)
    }

    /// Done back to waiting with its outputs deleted, false if it was not done
    fn invalidate_resource(&self, locator: &Locator) -> Result<bool, SchedulerError> {
        let connector = self.connector(locator)?.clone();

        let (invalidated, notice) = self.apply(locator, |_, resource, changes| {
            match resource.state() {
                ResourceState::Done => {}
                state @ (ResourceState::Running | ResourceState::Error) => {
                    return Err(ResourceError::CannotInvalidate {
                        locator: locator.clone(),
                        state,
                    }
                    .into())
                }
                _ => return Ok(false),
            }

            resource.invalidate()?;
            resource.clean(connector.as_ref())?;
            changes.state = true;
            Ok(true)
        })?;
        self.settle(notice);

        Ok(invalidated)
    }

    /// Walk the lock dependents of `root` breadth first
    fn invalidate_dependents(&self, root: &Locator, recursive: bool) -> Result<usize, SchedulerError> {
        let mut visited = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        let mut count = 0;

        while let Some(producer) = queue.pop_front() {
            let dependents = self
                .connection
                .read(|transaction| transaction.dependents(&producer))?;

            for dependency in dependents {
                if !matches!(dependency.kind, DependencyKind::Lock(_))
                    || !visited.insert(dependency.to.clone())
                {
                    continue;
                }

                let locator = dependency.to;
                let Some(dependent) = self.find(&locator)? else {
                    continue;
                };

                let touched = match dependent.state() {
                    ResourceState::Done => self.invalidate_resource(&locator)?,
                    ResourceState::Running if recursive => {
                        self.stop_one(&locator, true)?;
                        true
                    }
                    ResourceState::Error | ResourceState::OnHold if recursive => {
                        self.restart(&locator, false, false)? > 0
                    }
                    _ => false,
                };

                if touched {
                    debug!(dependent = %locator, "Invalidated dependent");
                    count += 1;
                    queue.push_back(locator);
                }
            }
        }

        Ok(count)
    }

    /// Remove a resource, or every resource whose locator matches a glob pattern
    ///
    /// Only resources in `states` are removed (all of them if empty). A
    /// resource with dependents needs `recursive`, which removes them first.
    /// Files on disk are kept.
    #[instrument(skip(self), level = "info")]
    pub fn remove(
        &self,
        target: &str,
        states: &[ResourceState],
        recursive: bool,
    ) -> Result<BatchReport, SchedulerError> {
        let selected = |state: ResourceState| states.is_empty() || states.contains(&state);

        if let Ok(locator) = target.parse::<Locator>() {
            if let Some(resource) = self.find(&locator)? {
                if !selected(resource.state()) {
                    return Err(SchedulerError::StateMismatch {
                        locator,
                        state: resource.state(),
                    });
                }

                let count = self.remove_one(&locator, recursive, &mut HashSet::new())?;
                return Ok(BatchReport {
                    count,
                    failures: Vec::new(),
                });
            }
        }

        if !has_glob_characters(target) {
            let locator = target.parse::<Locator>()?;
            return Err(SchedulerError::NotFound(locator));
        }

        let matcher = Glob::new(target)?.compile_matcher();
        let matching = self
            .connection
            .read(|transaction| transaction.resources(None))?
            .into_iter()
            .filter(|resource| {
                selected(resource.state()) && matcher.is_match(resource.locator().to_string())
            })
            .map(|resource| resource.locator().clone())
            .collect::<Vec<_>>();

        let mut report = BatchReport::default();
        let mut visited = HashSet::new();
        for locator in matching {
            // already gone with a removed producer
            if visited.contains(&locator) {
                continue;
            }
            let result = self.remove_one(&locator, recursive, &mut visited);
            report.record(&locator, result);
        }

        Ok(report)
    }

    fn remove_one(
        &self,
        locator: &Locator,
        recursive: bool,
        visited: &mut HashSet<Locator>,
    ) -> Result<usize, SchedulerError> {
        // nothing is removed if any part of the tree is running
        if recursive {
            if let Some(running) = self.running_dependent(locator)? {
                return Err(SchedulerError::Running(running));
            }
        }

        self.remove_tree(locator, recursive, visited)
    }

    /// First running resource among `root` and its dependents, breadth first
    fn running_dependent(&self, root: &Locator) -> Result<Option<Locator>, SchedulerError> {
        let mut visited = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(locator) = queue.pop_front() {
            if self.get(&locator)?.state() == ResourceState::Running {
                return Ok(Some(locator));
            }

            let dependents = self
                .connection
                .read(|transaction| transaction.dependents(&locator))?;
            for dependency in dependents {
                if visited.insert(dependency.to.clone()) {
                    queue.push_back(dependency.to);
                }
            }
        }

        Ok(None)
    }

    fn remove_tree(
        &self,
        locator: &Locator,
        recursive: bool,
        visited: &mut HashSet<Locator>,
    ) -> Result<usize, SchedulerError> {
        visited.insert(locator.clone());
        let resource = self.get(locator)?;
        if resource.state() == ResourceState::Running {
            return Err(SchedulerError::Running(locator.clone()));
        }

        let dependents = self
            .connection
            .read(|transaction| transaction.dependents(locator))?;
        let mut count = 0;
        if !dependents.is_empty() {
            if !recursive {
                return Err(SchedulerError::HasDependents {
                    locator: locator.clone(),
                    count: dependents.len(),
                });
            }

            for dependency in dependents {
                if !visited.contains(&dependency.to) {
                    count += self.remove_tree(&dependency.to, true, visited)?;
                }
            }
        }

        {
            let _guard = self.locks.lock(locator);
            let transaction = self.connection.begin()?;
            let removed = transaction.remove(locator)?;
            transaction.commit()?;
            if !removed {
                return Err(SchedulerError::NotFound(locator.clone()));
            }
        }
        self.locks.forget(locator);

        info!(locator = %locator, "Removed resource");
        self.listeners.notify(&Message::ResourceRemoved {
            locator: locator.clone(),
        });

        Ok(count + 1)
    }

    /// Poll the markers of every resource in `states`, counts the resources that changed
    pub fn update_all(&self, states: &[ResourceState]) -> Result<BatchReport, SchedulerError> {
        let mut report = BatchReport::default();

        for locator in self.query_by_state(states)? {
            let result = self.update_status(&locator).map(usize::from);
            report.record(&locator, result);
        }

        Ok(report)
    }

    /// Kill running jobs, which go back in line with `restart` and fail otherwise
    pub fn stop(&self, locators: &[Locator], restart: bool) -> BatchReport {
        let mut report = BatchReport::default();

        for locator in locators {
            let result = self.stop_one(locator, restart).map(|_| 1);
            report.record(locator, result);
        }

        report
    }

    #[instrument(skip(self), fields(locator = %locator), level = "info")]
    fn stop_one(&self, locator: &Locator, restart: bool) -> Result<(), SchedulerError> {
        let running = self.running.lock().remove(locator);

        if let Some(mut running) = running {
            if let Err(error) = running.process.kill() {
                warn!(error = %error, "Failed to kill the process");
            }
            match running.process.wait(STOP_GRACE) {
                Ok(ProcessState::Running) => warn!("Process is still running after being killed"),
                Ok(ProcessState::Finished(_)) => {}
                Err(error) => warn!(error = %error, "Failed to wait for the process"),
            }

            return self.finish_job(locator, running, Outcome::Stopped { restart });
        }

        // started by another scheduler process
        let job = self.get(locator)?;
        if job.state() != ResourceState::Running {
            return Err(SchedulerError::NotRunning(locator.clone()));
        }
        let host = self.host(locator.connector())?.clone();
        if let Some(handle) = job.job_payload().and_then(|payload| payload.process.as_ref()) {
            match host.launcher.reattach(handle).and_then(|mut process| process.kill()) {
                Ok(()) => info!(process = ?handle, "Killed process"),
                Err(error) => warn!(process = ?handle, error = %error, "Failed to kill the process"),
            }
        }

        let (locks, tokens) = self.adopt_locks(&job, &host);
        let (_, notice) = self.apply(locator, |_, job, changes| {
            if job.state() == ResourceState::Running {
                job.stop(restart, now_millis());
                job.unlock_dependencies(changes);
                changes.state = true;
            }
            Ok(())
        })?;
        let mut notices = self.release(locks, tokens);
        notices.extend(notice);
        self.settle(notices);

        Ok(())
    }

    /// Resources of a group (all of them without one) in one of `states`
    pub fn list(
        &self,
        group: Option<&str>,
        states: &[ResourceState],
    ) -> Result<Vec<Resource>, SchedulerError> {
        Ok(self
            .connection
            .read(|transaction| transaction.resources(group))?
            .into_iter()
            .filter(|resource| states.is_empty() || states.contains(&resource.state()))
            .collect())
    }

    pub fn information(&self, locator: &Locator) -> Result<ResourceInformation, SchedulerError> {
        Ok(ResourceInformation::from(&self.get(locator)?))
    }

    /// Write the launch scripts and parameter files of jobs again
    pub fn generate_files(&self, locators: &[Locator]) -> BatchReport {
        let mut report = BatchReport::default();

        for locator in locators {
            let result = self.get(locator).and_then(|job| {
                let files = script::generate(self.connector(locator)?.as_ref(), &job)?;
                debug!(locator = %locator, script = ?files.script, "Generated launch files");
                Ok(1)
            });
            report.record(locator, result);
        }

        report
    }

    /// Change the number of slots of a token, dependents are re-evaluated if it starts or stops blocking
    #[instrument(skip(self), fields(locator = %locator), level = "info")]
    pub fn set_token_limit(&self, locator: &Locator, limit: u32) -> Result<(), SchedulerError> {
        let (_, notice) = self.apply(locator, |_, token, changes| {
            token.set_token_limit(limit)?;
            changes.state = true;
            Ok(())
        })?;
        self.settle(notice);

        Ok(())
    }
}
