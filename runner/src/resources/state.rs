use super::ResourceError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// States a resource moves through
///
/// The integer codes are what gets persisted, do not reorder them.
#[derive(
    Serialize, Deserialize, ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Waiting = 0,
    Ready = 1,
    Running = 2,
    Done = 3,
    Error = 4,
    OnHold = 5,
}

impl ResourceState {
    pub const ALL: [ResourceState; 6] = [
        Self::Waiting,
        Self::Ready,
        Self::Running,
        Self::Done,
        Self::Error,
        Self::OnHold,
    ];

    /// true if the resource still has work ahead of it
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Waiting)
    }

    /// states a resubmission is allowed to overwrite
    pub fn is_updatable(self) -> bool {
        matches!(self, Self::Ready | Self::OnHold | Self::Error | Self::Waiting)
    }

    /// states that put the dependents of a resource on hold
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Error | Self::OnHold)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() as i64 == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = ResourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");

        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| ResourceError::UnknownVariant {
                kind: "resource state",
                value: value.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_and_updatable_sets() {
        let active: Vec<_> = ResourceState::ALL
            .into_iter()
            .filter(|state| state.is_active())
            .collect();
        assert_eq!(
            active,
            [
                ResourceState::Waiting,
                ResourceState::Ready,
                ResourceState::Running
            ]
        );

        assert!(ResourceState::OnHold.is_updatable());
        assert!(ResourceState::Error.is_updatable());
        assert!(!ResourceState::Done.is_updatable());
        assert!(!ResourceState::Running.is_updatable());
    }

    #[test]
    fn codes_survive_the_trip_through_storage() {
        for state in ResourceState::ALL {
            assert_eq!(ResourceState::from_code(state.code() as i64), Some(state));
        }
        assert_eq!(ResourceState::from_code(42), None);
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!(
            "on-hold".parse::<ResourceState>().ok(),
            Some(ResourceState::OnHold)
        );
        assert_eq!(
            "DONE".parse::<ResourceState>().ok(),
            Some(ResourceState::Done)
        );
        assert!("finished".parse::<ResourceState>().is_err());
    }
}
