use super::{access::LockType, Locator, ResourceError, ResourceState};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// What a dependency waits for on its producer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// lock-mode based access to the producer's output
    Lock(LockType),
    /// a slot of a token resource
    Token,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock(lock_type) => lock_type.as_str(),
            Self::Token => "token",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = ResourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "token" {
            Ok(Self::Token)
        } else {
            value.parse().map(Self::Lock)
        }
    }
}

/// Edge from a producer (`from`) to the dependent resource owning it (`to`)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub from: Locator,
    pub to: Locator,
    pub kind: DependencyKind,
    /// cached result of the last evaluation
    pub satisfied: bool,
    /// producer state seen at the last evaluation
    pub producer_state: ResourceState,
    /// the dependent currently holds the lock (or token slot) on the producer
    #[serde(default)]
    pub locked: bool,
}

impl Dependency {
    pub fn is_holding(&self) -> bool {
        self.producer_state.is_blocking()
    }
}

pub type DependencyMap = BTreeMap<Locator, Dependency>;

/// Incoming dependencies of a resource, read lazily from storage
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Dependencies {
    #[default]
    NotLoaded,
    Loaded(DependencyMap),
}

impl Dependencies {
    pub fn empty() -> Self {
        Self::Loaded(DependencyMap::new())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&DependencyMap> {
        match self {
            Self::Loaded(map) => Some(map),
            Self::NotLoaded => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut DependencyMap> {
        match self {
            Self::Loaded(map) => Some(map),
            Self::NotLoaded => None,
        }
    }
}
