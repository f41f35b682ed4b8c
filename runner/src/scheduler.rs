pub mod admin;
pub mod notify;
pub mod runner;

pub use admin::{BatchReport, ResourceInformation};
pub use notify::{Listener, ListenerId, Message};

use crate::{
    config::{ConfigErrors, ConnectorConfig, ExpmanConfig, SchedulerConfig},
    database::{ConnectionError, SharedConnection, Transaction},
    distributed::{Connector, LocalConnector},
    executors::{ExecutorError, Launchers},
    resources::{Changes, Locator, Resource, ResourceError, ResourceState},
    sync::locking::{Lock, LockError},
};
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] globset::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no connector '{0}' is configured")]
    UnknownConnector(String),
    #[error("{0} does not exist")]
    NotFound(Locator),
    #[error("{0} is running")]
    Running(Locator),
    #[error("{0} is not running")]
    NotRunning(Locator),
    #[error("{locator} has {count} dependents")]
    HasDependents { locator: Locator, count: usize },
    #[error("{locator} is {state}, which was not selected")]
    StateMismatch {
        locator: Locator,
        state: ResourceState,
    },
}

/// A host: where files live and how jobs are started there
#[derive(Clone, Debug)]
pub struct Host {
    pub connector: Arc<dyn Connector>,
    pub launcher: Launchers,
}

/// Outcome of a committed change, consumed by `Scheduler::settle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub locator: Locator,
    pub old: ResourceState,
    pub new: ResourceState,
    /// dependents have to evaluate the resource again
    pub propagate: bool,
    /// runners have something to start
    pub wake: bool,
}

/// In-process lock of every resource, taken before the database
#[derive(Default, Debug)]
struct ResourceLocks(Mutex<HashMap<Locator, Arc<Mutex<()>>>>);

impl ResourceLocks {
    fn lock(&self, locator: &Locator) -> ArcMutexGuard<RawMutex, ()> {
        let lock = self
            .0
            .lock()
            .entry(locator.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        lock.lock_arc()
    }

    fn forget(&self, locator: &Locator) {
        self.0.lock().remove(locator);
    }
}

#[derive(Debug)]
pub struct Scheduler {
    connection: SharedConnection,
    hosts: BTreeMap<String, Host>,
    config: SchedulerConfig,
    locks: ResourceLocks,
    listeners: notify::Listeners,
    running: Mutex<HashMap<Locator, runner::RunningJob>>,
    /// ready jobs a runner is busy starting
    starting: Mutex<HashSet<Locator>>,
    /// reaped jobs whose end is not recorded yet
    finishing: AtomicUsize,
    /// locks whose release failed, retried by the poller
    releases: Mutex<Vec<(Locator, Box<dyn Lock>)>>,
    /// serializes lock acquisition between runner threads
    acquisition: Mutex<()>,
    runners_wakeup: runner::Wakeup,
    poller_wakeup: runner::Wakeup,
    shutdown: AtomicBool,
}

pub struct SchedulerBuilder {
    connection: SharedConnection,
    hosts: BTreeMap<String, Host>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn host(mut self, connector: Arc<dyn Connector>, launcher: Launchers) -> Self {
        self.hosts.insert(
            connector.id().to_owned(),
            Host {
                connector,
                launcher,
            },
        );
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            connection: self.connection,
            hosts: self.hosts,
            config: self.config,
            locks: ResourceLocks::default(),
            listeners: notify::Listeners::default(),
            running: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            finishing: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
            acquisition: Mutex::new(()),
            runners_wakeup: runner::Wakeup::default(),
            poller_wakeup: runner::Wakeup::default(),
            shutdown: AtomicBool::new(false),
        })
    }
}

impl Scheduler {
    pub fn builder(connection: SharedConnection) -> SchedulerBuilder {
        SchedulerBuilder {
            connection,
            hosts: BTreeMap::new(),
            config: SchedulerConfig::default(),
        }
    }

    /// Open the database and the hosts of a checked configuration, creating its tokens
    pub fn load(config: &ExpmanConfig) -> Result<Arc<Self>, SchedulerError> {
        let connection = SharedConnection::load(&config.database)?;
        connection.init()?;

        let mut builder = Self::builder(connection).config(config.scheduler.clone());
        for (id, connector) in config.connectors.iter() {
            let ConnectorConfig::Local { basedir, launcher } = connector;
            builder = builder.host(
                Arc::new(LocalConnector::new(id.clone(), basedir.clone())),
                Launchers::load(launcher),
            );
        }
        let scheduler = builder.build();

        for (name, token) in config.tokens.iter() {
            debug!(name = %name, locator = %token.locator, "Declaring token");
            scheduler.declare_token(&token.locator, token.limit)?;
        }

        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn host(&self, connector: &str) -> Result<&Host, SchedulerError> {
        self.hosts
            .get(connector)
            .ok_or_else(|| SchedulerError::UnknownConnector(connector.to_owned()))
    }

    pub fn connector(&self, locator: &Locator) -> Result<&Arc<dyn Connector>, SchedulerError> {
        Ok(&self.host(locator.connector())?.connector)
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// The resource with its dependencies
    pub fn find(&self, locator: &Locator) -> Result<Option<Resource>, SchedulerError> {
        Ok(self.connection.read(|transaction| {
            match transaction.find(locator)? {
                Some(mut resource) => {
                    transaction.load_dependencies(&mut resource)?;
                    Ok(Some(resource))
                }
                None => Ok(None),
            }
        })?)
    }

    pub fn get(&self, locator: &Locator) -> Result<Resource, SchedulerError> {
        self.find(locator)?
            .ok_or_else(|| SchedulerError::NotFound(locator.clone()))
    }

    pub fn query_by_state(&self, states: &[ResourceState]) -> Result<Vec<Locator>, SchedulerError> {
        Ok(self
            .connection
            .read(|transaction| transaction.query_by_state(states))?)
    }

    /// Run `body` in a transaction, again from scratch while its write loses
    /// against a concurrent one, at most `retries` times
    fn transact<R>(
        &self,
        mut body: impl FnMut(&Transaction) -> Result<R, SchedulerError>,
    ) -> Result<R, SchedulerError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let transaction = self.connection.begin()?;

            match body(&transaction) {
                Ok(result) => {
                    transaction.commit()?;
                    return Ok(result);
                }
                Err(SchedulerError::Connection(error))
                    if error.is_stale() && attempt < self.config.retries =>
                {
                    warn!(attempt, error = %error, "Concurrent modification, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Mutate a stored resource under its lock and write it back
    ///
    /// `mutate` reports what it changed in `Changes`, nothing is written if it
    /// reports nothing. A write that lost against another process is retried
    /// against a fresh read, so `mutate` may run more than once. The returned
    /// notice has to be handed to `settle` by the caller.
    pub fn apply<R>(
        &self,
        locator: &Locator,
        mut mutate: impl FnMut(&Transaction, &mut Resource, &mut Changes) -> Result<R, SchedulerError>,
    ) -> Result<(R, Option<Notice>), SchedulerError> {
        let _guard = self.locks.lock(locator);

        self.transact(|transaction| {
            let mut resource = transaction
                .find(locator)?
                .ok_or_else(|| SchedulerError::NotFound(locator.clone()))?;
            transaction.load_dependencies(&mut resource)?;

            let old = resource.state();
            let old_access = resource.access().clone();
            let was_blocking = resource.is_blocking_token();

            let mut changes = Changes::default();
            let result = mutate(transaction, &mut resource, &mut changes)?;
            if changes.is_empty() {
                return Ok((result, None));
            }
            transaction.store(&mut resource)?;

            let new = resource.state();
            let access = resource.access();
            let propagate = old != new
                || old_access.readers != access.readers
                || old_access.writers != access.writers
                || was_blocking != resource.is_blocking_token();

            Ok((
                result,
                Some(Notice {
                    locator: locator.clone(),
                    old,
                    new,
                    propagate,
                    wake: new == ResourceState::Ready && old != new,
                }),
            ))
        })
    }

    /// Deliver notices: listeners first, then every dependent re-evaluates the producer
    ///
    /// Dependents are handled one at a time, each under its own lock, and
    /// their own notices are queued in turn.
    pub fn settle(&self, notices: impl IntoIterator<Item = Notice>) {
        let mut queue: VecDeque<Notice> = notices.into_iter().collect();
        let mut wake = false;

        while let Some(notice) = queue.pop_front() {
            wake |= notice.wake;

            if notice.old != notice.new {
                self.listeners.notify(&Message::StateChanged {
                    locator: notice.locator.clone(),
                    old: notice.old,
                    new: notice.new,
                });
            }

            if !notice.propagate {
                continue;
            }

            let dependents = match self
                .connection
                .read(|transaction| transaction.dependents(&notice.locator))
            {
                Ok(dependents) => dependents,
                Err(error) => {
                    error!(locator = %notice.locator, error = %error, "Failed to list dependents");
                    continue;
                }
            };
            if dependents.is_empty() {
                continue;
            }

            let producer = match self
                .connection
                .read(|transaction| transaction.find(&notice.locator))
            {
                Ok(Some(producer)) => producer,
                Ok(None) => continue,
                Err(error) => {
                    error!(locator = %notice.locator, error = %error, "Failed to read a producer");
                    continue;
                }
            };

            for dependency in dependents {
                let checked = self.apply(&dependency.to, |_, dependent, changes| {
                    Ok(dependent.check_dependency(&producer, false, changes)?)
                });

                match checked {
                    Ok((_, Some(notice))) => queue.push_back(notice),
                    Ok((_, None)) => {}
                    Err(error) => error!(
                        producer = %producer.locator(),
                        dependent = %dependency.to,
                        error = %error,
                        "Failed to notify a dependent"
                    ),
                }
            }
        }

        if wake {
            self.notify_runners();
        }
    }

    /// Wake the runners up, they look for ready jobs again
    pub fn notify_runners(&self) {
        self.runners_wakeup.notify();
    }

    /// Store a new resource, or replace one that is not running nor done
    ///
    /// The dependencies are evaluated again against the stored producers,
    /// which have to exist.
    #[instrument(skip(self, resource), fields(locator = %resource.locator()), level = "info")]
    pub fn submit(&self, mut resource: Resource) -> Result<Resource, SchedulerError> {
        let locator = resource.locator().clone();
        self.host(locator.connector())?;
        let declared = resource.take_dependencies();

        let (resource, replaced) = {
            let _guard = self.locks.lock(&locator);

            self.transact(|transaction| {
                let replaced = match transaction.find(&locator)? {
                    Some(old) => {
                        resource.replace(&old)?;
                        resource.version = old.version();
                        transaction.clear_dependencies(&locator)?;
                        debug!(state = %old.state(), "Replacing stored resource");
                        Some(old.state())
                    }
                    None => {
                        resource.version = 0;
                        None
                    }
                };

                let mut fresh = resource.clone();
                for (producer, lock_type) in declared.iter() {
                    let producer = transaction
                        .find(producer)?
                        .ok_or_else(|| SchedulerError::NotFound(producer.clone()))?;
                    fresh.add_dependency(&producer, *lock_type)?;
                }
                fresh.ready();
                transaction.store(&mut fresh)?;

                Ok((fresh, replaced))
            })?
        };

        info!(state = %resource.state(), unsatisfied = resource.nb_unsatisfied(), "Submitted resource");
        self.listeners.notify(&Message::ResourceAdded {
            locator: locator.clone(),
            state: resource.state(),
        });
        // dependents of the replaced resource follow its new state
        if let Some(old) = replaced {
            self.settle(Some(Notice {
                locator,
                old,
                new: resource.state(),
                propagate: true,
                wake: false,
            }));
        }
        if resource.state() == ResourceState::Ready {
            self.notify_runners();
        }

        Ok(resource)
    }

    /// Create a token, or align the limit of an existing one
    pub fn declare_token(&self, locator: &Locator, limit: u32) -> Result<(), SchedulerError> {
        match self.find(locator)? {
            Some(token) => match token.token_payload() {
                Some(payload) if payload.limit == limit => Ok(()),
                Some(_) => self.set_token_limit(locator, limit),
                None => Err(ResourceError::NotAToken(locator.clone()).into()),
            },
            None => self.submit(Resource::token(locator.clone(), limit)).map(|_| ()),
        }
    }

    /// Poll the markers of a resource, returns true if its state changed
    pub fn update_status(&self, locator: &Locator) -> Result<bool, SchedulerError> {
        let notice = self.poll_status(locator)?;
        let changed = notice.as_ref().map_or(false, |notice| notice.old != notice.new);
        self.settle(notice);

        Ok(changed)
    }

    /// Poll the markers of a resource, the notice is for the caller to settle
    pub fn poll_status(&self, locator: &Locator) -> Result<Option<Notice>, SchedulerError> {
        let connector = self.connector(locator)?.clone();
        let (_, notice) = self.apply(locator, |_, resource, changes| {
            resource.update_status(connector.as_ref(), changes);
            Ok(())
        })?;

        Ok(notice)
    }

    /// Take a slot of a token, the notice is for the caller to settle
    pub fn acquire_token(&self, token: &Locator) -> Result<Option<Notice>, SchedulerError> {
        let (_, notice) = self.apply(token, |_, token, changes| {
            token.acquire_token()?;
            changes.state = true;
            Ok(())
        })?;

        Ok(notice)
    }

    pub fn release_token(&self, token: &Locator) -> Result<Option<Notice>, SchedulerError> {
        let (_, notice) = self.apply(token, |_, token, changes| {
            token.release_token()?;
            changes.state = true;
            Ok(())
        })?;

        Ok(notice)
    }

    /// true once no job is ready nor running
    pub fn is_idle(&self) -> Result<bool, SchedulerError> {
        {
            let running = self.running.lock();
            if !running.is_empty() || self.finishing.load(Ordering::SeqCst) > 0 {
                return Ok(false);
            }
        }
        // a status file still names a finished job
        if !self.releases.lock().is_empty() {
            return Ok(false);
        }

        // data resources may sit in ready forever, only jobs are started
        for locator in self.query_by_state(&[ResourceState::Ready, ResourceState::Running])? {
            if self.find(&locator)?.map_or(false, |resource| resource.job_payload().is_some()) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    pub fn close(self: Arc<Self>) -> Result<(), SchedulerError> {
        match Arc::try_unwrap(self) {
            Ok(scheduler) => Ok(scheduler.connection.close()?),
            Err(_) => {
                warn!("Scheduler is still shared, the database stays open");
                Ok(())
            }
        }
    }
}
