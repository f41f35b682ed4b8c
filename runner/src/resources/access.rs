use super::{ResourceError, ResourceState};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// How other resources may use a resource once it is done
#[derive(Serialize, Deserialize, ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    ReadOnly = 0,
    SingleWriter = 1,
    MultipleWriter = 2,
    ExclusiveWriter = 3,
}

/// The kind of access a dependent requests from its producer
#[derive(Serialize, Deserialize, ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    Generated,
    ReadAccess,
    WriteAccess,
    ExclusiveAccess,
}

/// Answer of a producer to a requested lock type
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    /// usable right away
    Ok,
    /// usable once the lock file of the producer is held
    OkLock,
    Wait,
    /// blocked until an operator steps in
    Hold,
    /// can never be satisfied
    Error,
}

impl DependencyStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkLock)
    }
}

/// Decision table for a lock type against a producer's state, mode and current holders
pub fn accept(
    state: ResourceState,
    mode: LockMode,
    readers: u32,
    writers: u32,
    lock_type: LockType,
) -> DependencyStatus {
    use DependencyStatus::*;

    if state.is_blocking() {
        return Hold;
    }

    if state != ResourceState::Done {
        return Wait;
    }

    let free = readers == 0 && writers == 0;

    match lock_type {
        LockType::Generated => Ok,
        LockType::ExclusiveAccess => {
            if free {
                OkLock
            } else {
                Wait
            }
        }
        LockType::ReadAccess => match mode {
            LockMode::ExclusiveWriter | LockMode::SingleWriter => {
                if writers == 0 {
                    Ok
                } else {
                    Wait
                }
            }
            LockMode::MultipleWriter | LockMode::ReadOnly => Ok,
        },
        LockType::WriteAccess => match mode {
            LockMode::ExclusiveWriter => {
                if free {
                    OkLock
                } else {
                    Wait
                }
            }
            LockMode::SingleWriter => {
                if writers == 0 {
                    OkLock
                } else {
                    Wait
                }
            }
            LockMode::MultipleWriter => Ok,
            LockMode::ReadOnly => Error,
        },
    }
}

impl LockMode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        [
            Self::ReadOnly,
            Self::SingleWriter,
            Self::MultipleWriter,
            Self::ExclusiveWriter,
        ]
        .into_iter()
        .find(|mode| mode.code() as i64 == code)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadOnly => "read_only",
            Self::SingleWriter => "single_writer",
            Self::MultipleWriter => "multiple_writer",
            Self::ExclusiveWriter => "exclusive_writer",
        })
    }
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::ReadAccess => "read_access",
            Self::WriteAccess => "write_access",
            Self::ExclusiveAccess => "exclusive_access",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = ResourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "generated" => Ok(Self::Generated),
            "read_access" | "read" => Ok(Self::ReadAccess),
            "write_access" | "write" => Ok(Self::WriteAccess),
            "exclusive_access" | "exclusive" => Ok(Self::ExclusiveAccess),
            _ => Err(ResourceError::UnknownVariant {
                kind: "lock type",
                value: value.to_owned(),
            }),
        }
    }
}
