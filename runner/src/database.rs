pub mod sqlite;

pub use sqlite::{SharedConnection, Transaction};

use crate::resources::Locator;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(rusqlite::Error),
    /// someone else stored the resource since it was read, the operation is retried
    #[error("{locator} was modified concurrently (expected version {version})")]
    StaleVersion { locator: Locator, version: u64 },
    #[error("{0} is already stored")]
    AlreadyExists(Locator),
    #[error("{0} is not stored")]
    NotFound(Locator),
    #[error("failed to encode the payload: {0}")]
    Payload(#[from] serde_yaml::Error),
}

impl ConnectionError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }
}

// Resources and their dependency edges. The variant specific part of a
// resource is kept as YAML in `payload`, everything the scheduler queries on
// has its own column. `version` is bumped on every write, writers compare it
// against the version they read.
pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists resources (
    locator text primary key not null,
    grp text,
    state integer not null,
    lock_mode integer not null,
    nb_unsatisfied integer not null default 0,
    nb_holding integer not null default 0,
    locked integer not null default 0,
    readers integer not null default 0,
    writers integer not null default 0,
    last_update integer not null default 0,
    hold_reason text,
    hold_previous integer,
    payload text not null,
    version integer not null
);",
    "create table if not exists dependencies (
    from_locator text not null,
    to_locator text not null,
    kind text not null,
    satisfied integer not null,
    producer_state integer not null,
    locked integer not null default 0,
    primary key (from_locator, to_locator)
);",
    "create index if not exists dependencies_to on dependencies (to_locator);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
