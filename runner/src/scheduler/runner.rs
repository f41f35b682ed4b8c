/*
 * Turns ready jobs into running processes and back:
 * 1. runner threads take the locks and token slots a ready job needs, write
 *    its launch files and hand it to the launcher of its connector
 * 2. the poller thread reaps finished processes, releases what they held and
 *    polls the markers of every resource that may still move
 * 3. `recover` rebuilds the running set after a restart of the scheduler
 */

use super::{Host, Notice, Scheduler, SchedulerError};
use crate::{
    distributed::{util::now_millis, Artifact},
    executors::{script, Process, ProcessState},
    resources::{
        access, DependencyKind, DependencyStatus, LockType, Locator, Resource, ResourceKind,
        ResourceState,
    },
    sync::{
        locking::{FileLock, Lock, LockError},
        status::StatusLock,
    },
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeSet, HashSet},
    io,
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, instrument, trace, warn};

/// States the poller keeps an eye on, errors only move through operators
pub const POLLED_STATES: [ResourceState; 5] = [
    ResourceState::Waiting,
    ResourceState::Ready,
    ResourceState::Running,
    ResourceState::OnHold,
    ResourceState::Done,
];

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Locks and slots held by a launched job
#[derive(Debug)]
pub struct RunningJob {
    pub(super) process: Process,
    /// producer -> its lock file or status file registration
    pub(super) locks: Vec<(Locator, Box<dyn Lock>)>,
    pub(super) tokens: Vec<Locator>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    Exited(Option<i32>),
    Stopped { restart: bool },
}

/// Condition variable with a generation counter, so that no wake up is lost
#[derive(Debug, Default)]
pub(super) struct Wakeup {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Wakeup {
    pub(super) fn notify(&self) {
        *self.generation.lock() += 1;
        self.condvar.notify_all();
    }

    pub(super) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wait for a notification newer than `seen`, at most `timeout`
    pub(super) fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.condvar.wait_for(&mut generation, timeout);
        }

        *generation
    }
}

/// Ready job a runner thread is busy with, released when dropped
struct Claim<'a> {
    starting: &'a Mutex<HashSet<Locator>>,
    locator: Locator,
}

impl<'a> Claim<'a> {
    fn take(starting: &'a Mutex<HashSet<Locator>>, locator: &Locator) -> Option<Self> {
        if starting.lock().insert(locator.clone()) {
            Some(Self {
                starting,
                locator: locator.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.locator);
    }
}

/// What `acquire` got before it succeeded or gave up
#[derive(Default)]
struct Acquired {
    locks: Vec<(Locator, Box<dyn Lock>)>,
    tokens: Vec<Locator>,
    notices: Vec<Notice>,
}

impl Acquired {
    fn held(&self) -> BTreeSet<Locator> {
        self.locks
            .iter()
            .map(|(producer, _)| producer.clone())
            .chain(self.tokens.iter().cloned())
            .collect()
    }
}

impl Scheduler {
    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Start every ready job, returns how many were launched
    pub fn start_ready_jobs(&self) -> Result<usize, SchedulerError> {
        let mut started = 0;

        for locator in self.query_by_state(&[ResourceState::Ready])? {
            if self.is_shutdown() {
                break;
            }

            match self.start_job(&locator) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(error) => error!(locator = %locator, error = %error, "Failed to start job"),
            }
        }

        Ok(started)
    }

    /// Launch a ready job, returns false if it was not startable right now
    #[instrument(skip(self), fields(locator = %locator), level = "debug")]
    pub fn start_job(&self, locator: &Locator) -> Result<bool, SchedulerError> {
        let Some(_claim) = Claim::take(&self.starting, locator) else {
            trace!("Another runner is starting the job");
            return Ok(false);
        };
        if self.running.lock().contains_key(locator) {
            return Ok(false);
        }

        let host = self.host(locator.connector())?.clone();
        let job = self.get(locator)?;
        if job.job_payload().is_none() || job.state() != ResourceState::Ready {
            return Ok(false);
        }

        let (acquired, files) = {
            // one start at a time until the job is marked running, since the
            // producers are polled before their status files are trusted
            let _guard = self.acquisition.lock();

            let mut acquired = match self.acquire(&job) {
                Ok(acquired) => acquired,
                Err((error, acquired)) => {
                    debug!(error = %error, "Could not take the locks of the job");
                    let mut notices = acquired.notices;
                    notices.extend(self.release(acquired.locks, acquired.tokens));
                    notices.extend(self.recheck_dependencies(locator)?);
                    self.settle(notices);

                    return match error {
                        SchedulerError::Lock(error) if error.is_retryable() => Ok(false),
                        error => Err(error),
                    };
                }
            };

            let files = match script::generate(host.connector.as_ref(), &job) {
                Ok(files) => files,
                Err(error) => {
                    self.abort_start(locator, acquired, true);
                    return Err(error.into());
                }
            };

            let held = acquired.held();
            match self.apply(locator, |_, job, changes| {
                job.start_run(&held, now_millis(), changes)?;
                Ok(())
            }) {
                Ok((_, notice)) => acquired.notices.extend(notice),
                Err(error) => {
                    // somebody moved the job in the meantime
                    warn!(error = %error, "Job is not startable anymore");
                    self.abort_start(locator, acquired, false);
                    return Ok(false);
                }
            }

            // the registrations are visible to the other dependents now
            for (producer, _) in acquired.locks.iter() {
                match self.poll_status(producer) {
                    Ok(notice) => acquired.notices.extend(notice),
                    Err(error) => warn!(producer = %producer, error = %error, "Failed to poll producer"),
                }
            }

            (acquired, files)
        };

        let process = match host.launcher.launch(&files.script, &files.working_directory) {
            Ok(process) => process,
            Err(error) => {
                error!(error = %error, "Failed to launch job");
                self.abort_start(locator, acquired, true);
                return Err(error.into());
            }
        };

        let handle = process.handle();
        info!(launcher = host.launcher.name(), process = ?handle, "Launched job");
        let Acquired {
            locks,
            tokens,
            mut notices,
        } = acquired;
        let recorded = self.apply(locator, |_, job, changes| {
            if let Some(payload) = job.job_mut() {
                payload.process = Some(handle.clone());
                changes.state = true;
            }
            Ok(())
        });
        match recorded {
            Ok((_, notice)) => notices.extend(notice),
            Err(error) => error!(error = %error, "Failed to record the process of the job"),
        }

        self.running.lock().insert(
            locator.clone(),
            RunningJob {
                process,
                locks,
                tokens,
            },
        );
        self.settle(notices);
        self.poller_wakeup.notify();

        Ok(true)
    }

    /// Take every lock and slot the job needs, handing back what was taken on failure
    fn acquire(&self, job: &Resource) -> Result<Acquired, (SchedulerError, Acquired)> {
        let mut acquired = Acquired::default();
        let holder = job.holder_id();
        let dependencies = job.dependencies().cloned().unwrap_or_default();

        for dependency in dependencies.values() {
            let result = match dependency.kind {
                DependencyKind::Token => self.acquire_token(&dependency.from).map(|notice| {
                    acquired.tokens.push(dependency.from.clone());
                    acquired.notices.extend(notice);
                }),
                DependencyKind::Lock(LockType::Generated) => Ok(()),
                DependencyKind::Lock(_) => self
                    .lock_producer(&dependency.from, &holder, dependency.kind)
                    .map(|lock| {
                        if let Some(lock) = lock {
                            acquired.locks.push((dependency.from.clone(), lock));
                        }
                    }),
            };

            if let Err(error) = result {
                return Err((error, acquired));
            }
        }

        Ok(acquired)
    }

    /// Lock a producer against its freshly polled status
    fn lock_producer(
        &self,
        producer: &Locator,
        holder: &str,
        kind: DependencyKind,
    ) -> Result<Option<Box<dyn Lock>>, SchedulerError> {
        self.update_status(producer)?;
        let connector = self.connector(producer)?;
        let lock = self
            .get(producer)?
            .lock(connector, holder, kind, self.config.lock_timeout())?;

        debug!(producer = %producer, kind = %kind, "Locked producer");
        Ok(lock)
    }

    /// Evaluate every dependency of a job again against the stored producers
    fn recheck_dependencies(&self, locator: &Locator) -> Result<Option<Notice>, SchedulerError> {
        let (_, notice) = self.apply(locator, |transaction, job, changes| {
            let producers = job
                .dependencies()
                .map(|dependencies| dependencies.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();

            for producer in producers {
                if let Some(producer) = transaction.find(&producer)? {
                    job.check_dependency(&producer, false, changes)?;
                }
            }
            Ok(())
        })?;

        Ok(notice)
    }

    /// Give back what a failed start took, marking the job failed if `failed` is set
    fn abort_start(&self, locator: &Locator, acquired: Acquired, failed: bool) {
        let Acquired {
            locks,
            tokens,
            mut notices,
        } = acquired;

        if failed {
            let marked = self.apply(locator, |_, job, changes| {
                if matches!(job.state(), ResourceState::Ready | ResourceState::Running) {
                    job.fail(None, now_millis());
                    job.unlock_dependencies(changes);
                    changes.state = true;
                }
                Ok(())
            });
            match marked {
                Ok((_, notice)) => notices.extend(notice),
                Err(error) => error!(locator = %locator, error = %error, "Failed to mark the job failed"),
            }
        }

        notices.extend(self.release(locks, tokens));
        self.settle(notices);
    }

    /// Release locks and token slots, the token notices are for the caller to settle
    pub(super) fn release(
        &self,
        locks: Vec<(Locator, Box<dyn Lock>)>,
        tokens: Vec<Locator>,
    ) -> Vec<Notice> {
        let mut notices = Vec::new();

        for (producer, lock) in locks {
            if let Err((producer, lock, error)) = self.release_lock(producer, lock, &mut notices) {
                warn!(producer = %producer, error = %error, "Failed to release lock, retrying later");
                self.releases.lock().push((producer, lock));
            }
        }

        for token in tokens {
            match self.release_token(&token) {
                Ok(notice) => notices.extend(notice),
                Err(error) => error!(token = %token, error = %error, "Failed to release token"),
            }
        }

        notices
    }

    /// Release a lock then poll its producer, handing the lock back on failure
    #[allow(clippy::type_complexity)]
    fn release_lock(
        &self,
        producer: Locator,
        mut lock: Box<dyn Lock>,
        notices: &mut Vec<Notice>,
    ) -> Result<(), (Locator, Box<dyn Lock>, LockError)> {
        if let Err(error) = lock.release() {
            return Err((producer, lock, error));
        }

        match self.poll_status(&producer) {
            Ok(notice) => notices.extend(notice),
            Err(error) => warn!(producer = %producer, error = %error, "Failed to poll producer"),
        }
        Ok(())
    }

    /// Try again the lock releases that failed, returns how many went through
    pub fn retry_releases(&self) -> usize {
        let pending = std::mem::take(&mut *self.releases.lock());
        if pending.is_empty() {
            return 0;
        }

        let mut notices = Vec::new();
        let mut released = 0;
        for (producer, lock) in pending {
            match self.release_lock(producer, lock, &mut notices) {
                Ok(()) => released += 1,
                Err((producer, lock, error)) => {
                    debug!(producer = %producer, error = %error, "Lock is still not releasable");
                    self.releases.lock().push((producer, lock));
                }
            }
        }
        if released > 0 {
            info!(released, "Released pending locks");
        }
        self.settle(notices);

        released
    }

    /// Finish the jobs whose process ended, returns how many were finished
    pub fn reap(&self) -> usize {
        let finished = {
            let mut running = self.running.lock();
            let mut finished = Vec::new();

            for (locator, job) in running.iter_mut() {
                match job.process.poll() {
                    Ok(ProcessState::Running) => {}
                    Ok(ProcessState::Finished(code)) => finished.push((locator.clone(), code)),
                    Err(error) => warn!(locator = %locator, error = %error, "Failed to poll process"),
                }
            }

            let finished = finished
                .into_iter()
                .filter_map(|(locator, code)| {
                    running
                        .remove(&locator)
                        .map(|job| (locator, job, code))
                })
                .collect::<Vec<_>>();
            // seen by `is_idle` until the dependents are settled
            self.finishing.fetch_add(finished.len(), Ordering::SeqCst);
            finished
        };

        let count = finished.len();
        for (locator, job, code) in finished {
            if let Err(error) = self.finish_job(&locator, job, Outcome::Exited(code)) {
                error!(locator = %locator, error = %error, "Failed to finish job");
            }
            self.finishing.fetch_sub(1, Ordering::SeqCst);
        }

        count
    }

    /// Record the end of a run and release what it held
    #[instrument(skip(self, running), fields(locator = %locator), level = "info")]
    pub(super) fn finish_job(
        &self,
        locator: &Locator,
        running: RunningJob,
        outcome: Outcome,
    ) -> Result<(), SchedulerError> {
        let connector = self.connector(locator)?.clone();
        let mut held = BTreeSet::new();

        if let Outcome::Exited(Some(code)) = outcome {
            let path = Artifact::Code.path(&connector.resolve(locator.path()));
            let written = connector.stat(&path).and_then(|stamp| match stamp {
                Some(_) => Ok(()),
                None => connector.write_atomic(&path, format!("{code}\n").as_bytes()),
            });
            // the database keeps the code, the locks still have to go
            if let Err(error) = written {
                warn!(code, error = %error, "Failed to write the exit code file");
            }
        }

        let result = self.apply(locator, |_, job, changes| {
            held = job
                .dependencies()
                .map(|dependencies| {
                    dependencies
                        .values()
                        .filter(|dependency| dependency.locked)
                        .map(|dependency| dependency.from.clone())
                        .collect()
                })
                .unwrap_or_default();
            job.update_status(connector.as_ref(), changes);

            match outcome {
                Outcome::Exited(code) if job.in_run() => {
                    job.fail(code, now_millis());
                    changes.state = true;
                }
                Outcome::Stopped { restart }
                    if job.in_run()
                        || (restart && job.state() == ResourceState::Error) =>
                {
                    job.stop(restart, now_millis());
                    changes.state = true;
                }
                _ => {}
            }
            job.unlock_dependencies(changes);

            Ok(job.state())
        });

        let RunningJob { locks, mut tokens, .. } = running;
        let mut notices = Vec::new();
        let state = match result {
            Ok((state, notice)) => {
                notices.extend(notice);
                // slots given back by whoever stopped the job are not released twice
                tokens.retain(|token| held.contains(token));
                Some(state)
            }
            Err(error) => {
                error!(error = %error, "Failed to record the end of the run");
                None
            }
        };
        notices.extend(self.release(locks, tokens));
        self.settle(notices);

        info!(state = ?state, outcome = ?outcome, "Job finished");
        Ok(())
    }

    /// Rebuild the running set from storage, then recount token slots
    #[instrument(skip(self), level = "info")]
    pub fn recover(&self) -> Result<(), SchedulerError> {
        for locator in self.query_by_state(&[ResourceState::Running])? {
            let job = self.get(&locator)?;
            let host = self.host(locator.connector())?.clone();
            let (locks, tokens) = self.adopt_locks(&job, &host);

            let process = job
                .job_payload()
                .and_then(|payload| payload.process.as_ref())
                .map(|handle| host.launcher.reattach(handle));

            match process {
                Some(Ok(process)) => {
                    info!(locator = %locator, process = ?process.handle(), "Reattached running job");
                    self.running.lock().insert(
                        locator,
                        RunningJob {
                            process,
                            locks,
                            tokens,
                        },
                    );
                }
                other => {
                    if let Some(Err(error)) = other {
                        warn!(locator = %locator, error = %error, "Failed to reattach job");
                    } else {
                        warn!(locator = %locator, "Running job has no process");
                    }

                    let (_, notice) = self.apply(&locator, |_, job, changes| {
                        job.fail(None, now_millis());
                        job.unlock_dependencies(changes);
                        changes.state = true;
                        Ok(())
                    })?;
                    // no slot is released, the recount below accounts for them
                    let mut notices = self.release(locks, Vec::new());
                    notices.extend(notice);
                    self.settle(notices);
                }
            }
        }

        let tokens = self
            .connection
            .read(|transaction| transaction.resources(None))?
            .into_iter()
            .filter(|resource| matches!(resource.kind(), ResourceKind::Token(_)))
            .map(|resource| resource.locator().clone())
            .collect::<Vec<_>>();
        for token in tokens {
            let (_, notice) = self.apply(&token, |transaction, token, changes| {
                let holders = transaction.count_token_holders(token.locator())?;
                if let ResourceKind::Token(payload) = &mut token.kind {
                    if payload.used_tokens() != holders {
                        info!(locator = %token.locator, from = payload.used_tokens(), to = holders, "Recounted token");
                        payload.set_used_tokens(holders);
                        changes.state = true;
                    }
                }
                Ok(())
            })?;
            self.settle(notice);
        }

        Ok(())
    }

    /// Take over the locks a running job held before the scheduler restarted
    pub(super) fn adopt_locks(&self, job: &Resource, host: &Host) -> (Vec<(Locator, Box<dyn Lock>)>, Vec<Locator>) {
        let mut locks: Vec<(Locator, Box<dyn Lock>)> = Vec::new();
        let mut tokens = Vec::new();
        let holder = job.holder_id();
        let dependencies = job.dependencies().cloned().unwrap_or_default();

        for dependency in dependencies.values().filter(|dependency| dependency.locked) {
            let lock_type = match dependency.kind {
                DependencyKind::Token => {
                    tokens.push(dependency.from.clone());
                    continue;
                }
                DependencyKind::Lock(lock_type) => lock_type,
            };

            let producer = match self.get(&dependency.from) {
                Ok(producer) => producer,
                Err(error) => {
                    warn!(producer = %dependency.from, error = %error, "Cannot adopt lock");
                    continue;
                }
            };
            let connector = match self.connector(&dependency.from) {
                Ok(connector) => connector.clone(),
                Err(_) => host.connector.clone(),
            };
            let base = connector.resolve(dependency.from.path());

            // what the lock would have been when nobody else held the producer
            match access::accept(ResourceState::Done, producer.lock_mode(), 0, 0, lock_type) {
                DependencyStatus::OkLock => locks.push((
                    dependency.from.clone(),
                    Box::new(FileLock::adopt(Artifact::Lock.path(&base))),
                )),
                DependencyStatus::Ok
                    if matches!(lock_type, LockType::ReadAccess | LockType::WriteAccess) =>
                {
                    locks.push((
                        dependency.from.clone(),
                        Box::new(StatusLock::adopt(
                            connector,
                            &base,
                            &holder,
                            self.config.lock_timeout(),
                        )),
                    ))
                }
                _ => {}
            }
        }

        (locks, tokens)
    }

    /// Recover, then spawn the runner threads and the poller
    pub fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, SchedulerError> {
        self.recover()?;
        self.shutdown.store(false, Ordering::SeqCst);

        let mut handles = Vec::new();
        for index in 0..self.config.runners {
            let scheduler = self.clone();
            handles.push(spawn(format!("runner-{index}"), move || {
                scheduler.runner_loop()
            })?);
        }

        let scheduler = self.clone();
        handles.push(spawn("poller".to_owned(), move || scheduler.poller_loop())?);
        info!(runners = self.config.runners, "Scheduler started");

        Ok(handles)
    }

    fn runner_loop(&self) {
        let mut seen = self.runners_wakeup.generation();

        while !self.is_shutdown() {
            match self.start_ready_jobs() {
                Ok(0) => {}
                Ok(started) => debug!(started, "Started jobs"),
                Err(error) => error!(error = %error, "Failed to look for ready jobs"),
            }

            seen = self.runners_wakeup.wait(seen, self.config.poll_interval());
        }
        debug!("Runner stopped");
    }

    fn poller_loop(&self) {
        let mut seen = self.poller_wakeup.generation();

        while !self.is_shutdown() {
            self.reap();
            self.retry_releases();
            match self.update_all(&POLLED_STATES) {
                Ok(report) => {
                    for (locator, error) in report.failures.iter() {
                        warn!(locator = %locator, error = %error, "Failed to poll resource");
                    }
                }
                Err(error) => error!(error = %error, "Failed to poll resources"),
            }

            seen = self.poller_wakeup.wait(seen, self.config.poll_interval());
        }
        debug!("Poller stopped");
    }

    /// Ask the threads to stop, running processes are left alone
    pub fn shutdown(&self) {
        info!("Shutting down the scheduler");
        self.shutdown.store(true, Ordering::SeqCst);
        self.runners_wakeup.notify();
        self.poller_wakeup.notify();
    }

    /// Run until no job is ready or running anymore
    pub fn run_until_idle(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let handles = self.start()?;

        let result = loop {
            match self.is_idle() {
                Ok(true) => break Ok(()),
                Ok(false) => thread::sleep(IDLE_CHECK_INTERVAL),
                Err(error) => break Err(error),
            }
        };

        self.shutdown();
        for handle in handles {
            if handle.join().is_err() {
                error!("A scheduler thread panicked");
            }
        }

        result
    }
}

fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>, io::Error> {
    thread::Builder::new().name(name).spawn(body)
}
