use super::{ConnectionError, SQL_SCHEMA, SQL_SCHEMA_NUMBER};
use crate::{
    config::DatabaseConfig,
    resources::{
        Dependencies, Dependency, DependencyKind, DependencyMap, Hold, LockMode, Locator,
        Resource, ResourceError, ResourceKind, ResourceState,
    },
    sync::status::AccessStatus,
};
use itertools::Itertools;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{
    params, params_from_iter,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef},
    Connection, OptionalExtension, Row,
};
use std::{fmt::Debug, sync::Arc, time::Duration};
use tracing::{debug, error, info, trace, warn};

/// how long a writer waits for another process holding the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const RESOURCE_COLUMNS: &str = "locator, grp, state, lock_mode, nb_unsatisfied, nb_holding, \
    locked, readers, writers, last_update, hold_reason, hold_previous, payload, version";

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl ToSql for ResourceState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.code())))
    }
}

impl FromSql for ResourceState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_i64()?;
        Self::from_code(code).ok_or(FromSqlError::OutOfRange(code))
    }
}

impl ToSql for LockMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.code())))
    }
}

impl FromSql for LockMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_i64()?;
        Self::from_code(code).ok_or(FromSqlError::OutOfRange(code))
    }
}

impl ToSql for Locator {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Locator {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: ResourceError| FromSqlError::Other(Box::new(error)))
    }
}

impl ToSql for DependencyKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DependencyKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: ResourceError| FromSqlError::Other(Box::new(error)))
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(config)?))
    }

    /// Private database, used by tests and dry runs
    pub fn in_memory() -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::new(Connection::open_in_memory()?)))
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        self.lock().init()
    }

    /// Start a write transaction, the connection stays locked until it ends
    pub fn begin(&self) -> Result<Transaction, ConnectionError> {
        Transaction::begin(self.lock())
    }

    /// Run `read` in a transaction that is committed afterwards
    pub fn read<R>(
        &self,
        read: impl FnOnce(&Transaction) -> Result<R, ConnectionError>,
    ) -> Result<R, ConnectionError> {
        let transaction = self.begin()?;
        let result = read(&transaction)?;
        transaction.commit()?;

        Ok(result)
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        match Arc::try_unwrap(self.0) {
            Ok(inner) => inner.into_inner().close(),
            Err(_) => {
                warn!("SQLite connection is still shared, leaving it to the remaining handles");
                Ok(())
            }
        }
    }
}

impl InnerConnection {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn load(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        let connection = Connection::open(&config.path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        info!(path = ?config.path, "Opened SQLite database");

        Ok(Self::new(connection))
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close the SQLite connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }
}

/// An immediate transaction, rolled back unless committed
///
/// Holding one keeps every other thread away from the database, callers must
/// not begin a second one on the same thread.
pub struct Transaction {
    guard: ArcMutexGuard<RawFairMutex, InnerConnection>,
    open: bool,
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("open", &self.open)
            .finish()
    }
}

fn resource_from_row(row: &Row) -> rusqlite::Result<Resource> {
    let payload: String = row.get(12)?;
    let kind: ResourceKind = serde_yaml::from_str(&payload)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(error)))?;

    let hold = match (row.get::<_, Option<String>>(10)?, row.get(11)?) {
        (Some(reason), Some(previous)) => Some(Hold { reason, previous }),
        _ => None,
    };

    Ok(Resource {
        locator: row.get(0)?,
        group: row.get(1)?,
        state: row.get(2)?,
        lock_mode: row.get(3)?,
        dependencies: Dependencies::NotLoaded,
        nb_unsatisfied: row.get(4)?,
        nb_holding: row.get(5)?,
        locked: row.get(6)?,
        access: AccessStatus {
            readers: row.get(7)?,
            writers: row.get(8)?,
            last_update: row.get(9)?,
        },
        hold,
        kind,
        version: row.get::<_, i64>(13)? as u64,
    })
}

fn dependency_from_row(row: &Row) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        from: row.get(0)?,
        to: row.get(1)?,
        kind: row.get(2)?,
        satisfied: row.get(3)?,
        producer_state: row.get(4)?,
        locked: row.get(5)?,
    })
}

impl Transaction {
    fn begin(guard: ArcMutexGuard<RawFairMutex, InnerConnection>) -> Result<Self, ConnectionError> {
        guard.connection.execute_batch("begin immediate")?;
        trace!("Began transaction");

        Ok(Self { guard, open: true })
    }

    fn connection(&self) -> &Connection {
        &self.guard.connection
    }

    pub fn commit(mut self) -> Result<(), ConnectionError> {
        self.connection().execute_batch("commit")?;
        self.open = false;
        trace!("Committed transaction");

        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), ConnectionError> {
        self.open = false;
        self.connection().execute_batch("rollback")?;
        debug!("Rolled back transaction");

        Ok(())
    }

    /// The resource without its dependencies
    pub fn find(&self, locator: &Locator) -> Result<Option<Resource>, ConnectionError> {
        self.connection()
            .prepare_cached(&format!(
                "select {RESOURCE_COLUMNS} from resources where locator = ?"
            ))?
            .query_row(params![locator], resource_from_row)
            .optional()
            .map_err(ConnectionError::SQLite)
    }

    /// The resource with its dependencies
    pub fn load(&self, locator: &Locator) -> Result<Resource, ConnectionError> {
        let mut resource = self
            .find(locator)?
            .ok_or_else(|| ConnectionError::NotFound(locator.clone()))?;
        self.load_dependencies(&mut resource)?;

        Ok(resource)
    }

    pub fn load_dependencies(&self, resource: &mut Resource) -> Result<(), ConnectionError> {
        resource.dependencies = Dependencies::Loaded(self.dependencies(&resource.locator)?);

        Ok(())
    }

    /// Edges towards `to`, keyed by producer
    pub fn dependencies(&self, to: &Locator) -> Result<DependencyMap, ConnectionError> {
        self.connection()
            .prepare_cached(
                "select from_locator, to_locator, kind, satisfied, producer_state, locked
                 from dependencies where to_locator = ?",
            )?
            .query_map(params![to], dependency_from_row)?
            .try_fold(DependencyMap::new(), |mut init, result| {
                let dependency = result?;
                init.insert(dependency.from.clone(), dependency);

                Ok::<DependencyMap, ConnectionError>(init)
            })
    }

    /// Edges leaving `from`, one per dependent
    pub fn dependents(&self, from: &Locator) -> Result<Vec<Dependency>, ConnectionError> {
        self.connection()
            .prepare_cached(
                "select from_locator, to_locator, kind, satisfied, producer_state, locked
                 from dependencies where from_locator = ? order by to_locator",
            )?
            .query_map(params![from], dependency_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Dependency>, ConnectionError>(init)
            })
    }

    /// Write the resource, and its dependencies if they are loaded
    ///
    /// Fails with `StaleVersion` if the stored row changed since it was read.
    pub fn store(&self, resource: &mut Resource) -> Result<(), ConnectionError> {
        let payload = serde_yaml::to_string(&resource.kind)?;
        let (hold_reason, hold_previous) = match &resource.hold {
            Some(hold) => (Some(hold.reason.as_str()), Some(hold.previous)),
            None => (None, None),
        };
        let version = resource.version as i64;
        let next = version + 1;

        let values: [&dyn ToSql; 15] = [
            &resource.locator,
            &resource.group,
            &resource.state,
            &resource.lock_mode,
            &resource.nb_unsatisfied,
            &resource.nb_holding,
            &resource.locked,
            &resource.access.readers,
            &resource.access.writers,
            &resource.access.last_update,
            &hold_reason,
            &hold_previous,
            &payload,
            &next,
            &version,
        ];

        let updated = if version == 0 {
            self.connection()
                .prepare_cached(&format!(
                    "insert into resources ({RESOURCE_COLUMNS})
                     values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     on conflict (locator) do nothing"
                ))?
                .execute(&values[..14])?
        } else {
            self.connection()
                .prepare_cached(
                    "update resources set grp = ?2, state = ?3, lock_mode = ?4,
                     nb_unsatisfied = ?5, nb_holding = ?6, locked = ?7, readers = ?8,
                     writers = ?9, last_update = ?10, hold_reason = ?11, hold_previous = ?12,
                     payload = ?13, version = ?14
                     where locator = ?1 and version = ?15",
                )?
                .execute(&values[..])?
        };

        if updated == 0 {
            return Err(if version == 0 {
                ConnectionError::AlreadyExists(resource.locator.clone())
            } else {
                ConnectionError::StaleVersion {
                    locator: resource.locator.clone(),
                    version: resource.version,
                }
            });
        }

        if let Some(dependencies) = resource.dependencies.loaded() {
            for dependency in dependencies.values() {
                self.store_dependency(dependency)?;
            }
        }

        resource.version = next as u64;
        debug!(locator = %resource.locator, state = %resource.state, version = next, "Stored resource");

        Ok(())
    }

    fn store_dependency(&self, dependency: &Dependency) -> Result<(), ConnectionError> {
        self.connection()
            .prepare_cached(
                "insert into dependencies
                 (from_locator, to_locator, kind, satisfied, producer_state, locked)
                 values (?, ?, ?, ?, ?, ?)
                 on conflict (from_locator, to_locator) do update set
                 kind = excluded.kind, satisfied = excluded.satisfied,
                 producer_state = excluded.producer_state, locked = excluded.locked",
            )?
            .execute(params![
                dependency.from,
                dependency.to,
                dependency.kind,
                dependency.satisfied,
                dependency.producer_state,
                dependency.locked
            ])?;

        Ok(())
    }

    /// Forget the edges towards `to`, before they are replaced
    pub fn clear_dependencies(&self, to: &Locator) -> Result<usize, ConnectionError> {
        Ok(self
            .connection()
            .prepare_cached("delete from dependencies where to_locator = ?")?
            .execute(params![to])?)
    }

    /// Delete the resource and every edge touching it, returns false if it was not stored
    pub fn remove(&self, locator: &Locator) -> Result<bool, ConnectionError> {
        self.connection()
            .prepare_cached("delete from dependencies where to_locator = ?1 or from_locator = ?1")?
            .execute(params![locator])?;

        let removed = self
            .connection()
            .prepare_cached("delete from resources where locator = ?")?
            .execute(params![locator])?;

        Ok(removed > 0)
    }

    /// Locators of the resources in one of `states`, all of them if `states` is empty
    pub fn query_by_state(&self, states: &[ResourceState]) -> Result<Vec<Locator>, ConnectionError> {
        let states = if states.is_empty() {
            &ResourceState::ALL[..]
        } else {
            states
        };
        let placeholders = std::iter::repeat("?").take(states.len()).join(", ");

        self.connection()
            .prepare_cached(&format!(
                "select locator from resources where state in ({placeholders}) order by locator"
            ))?
            .query_map(params_from_iter(states.iter()), |row| row.get(0))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Locator>, ConnectionError>(init)
            })
    }

    /// Resources without their dependencies, optionally restricted to a group
    pub fn resources(&self, group: Option<&str>) -> Result<Vec<Resource>, ConnectionError> {
        self.connection()
            .prepare_cached(&format!(
                "select {RESOURCE_COLUMNS} from resources
                 where ?1 is null or grp = ?1 order by locator"
            ))?
            .query_map(params![group], resource_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Resource>, ConnectionError>(init)
            })
    }

    /// Running jobs holding a slot of `token`
    pub fn count_token_holders(&self, token: &Locator) -> Result<u32, ConnectionError> {
        Ok(self
            .connection()
            .prepare_cached(
                "select count(*) from dependencies d
                 join resources r on r.locator = d.to_locator
                 where d.from_locator = ? and d.locked = 1 and r.state = ?",
            )?
            .query_row(params![token, ResourceState::Running], |row| row.get(0))?)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            match self.connection().execute_batch("rollback") {
                Ok(()) => debug!("Rolled back unfinished transaction"),
                Err(error) => error!(error = ?error, "Failed to roll back transaction: {error}"),
            }
        }
    }
}
