//! Resources described in YAML, the input of `expman submit`.
//!
//! ```yaml
//! - locator: local:/data/corpus
//!   type: data
//!   state: done
//! - locator: local:/tokens/cpus
//!   type: token
//!   limit: 4
//! - locator: local:/runs/train
//!   type: job
//!   lock_mode: single_writer
//!   commands:
//!     - [python, train.py]
//!   dependencies:
//!     - locator: local:/data/corpus
//!       lock_type: read_access
//!     - locator: local:/tokens/cpus
//! ```
//!
//! Producers are looked up in storage, so a description may only depend on
//! resources stored before it (earlier entries of the same file included).

use crate::{
    config::ConfigErrors,
    resources::{LockMode, LockType, Locator, Resource, ResourceKind, ResourceState},
    scheduler::{BatchReport, Scheduler, SchedulerError},
};
use serde::Deserialize;
use std::{fs::File, path::Path};
use tracing::info;

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResourceDescription {
    pub locator: Locator,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub lock_mode: LockMode,
    /// initial state, e.g. `done` for data that already exists
    #[serde(default)]
    pub state: Option<ResourceState>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDescription>,
    #[serde(flatten)]
    pub kind: ResourceKind,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DependencyDescription {
    pub locator: Locator,
    /// ignored for tokens
    #[serde(default)]
    pub lock_type: LockType,
}

pub fn load(path: &Path) -> Result<Vec<ResourceDescription>, ConfigErrors> {
    let file = File::open(path)?;

    Ok(serde_yaml::from_reader(file)?)
}

impl ResourceDescription {
    /// Build the resource against the stored producers
    pub fn build(self, scheduler: &Scheduler) -> Result<Resource, SchedulerError> {
        let mut resource = Resource::new(self.locator, self.kind).with_lock_mode(self.lock_mode);
        if let Some(group) = self.group {
            resource = resource.with_group(group);
        }
        if let Some(state) = self.state {
            resource = resource.with_state(state);
        }

        for dependency in self.dependencies {
            let producer = scheduler.get(&dependency.locator)?;
            resource.add_dependency(&producer, dependency.lock_type)?;
        }

        Ok(resource)
    }
}

/// Submit descriptions in order, a failure does not stop the others
pub fn submit_all(scheduler: &Scheduler, descriptions: Vec<ResourceDescription>) -> BatchReport {
    let mut report = BatchReport::default();

    for description in descriptions {
        let locator = description.locator.clone();
        match description
            .build(scheduler)
            .and_then(|resource| scheduler.submit(resource))
        {
            Ok(resource) => {
                info!(locator = %locator, state = %resource.state(), "Submitted");
                report.count += 1;
            }
            Err(error) => report.failures.push((locator, error)),
        }
    }

    report
}
