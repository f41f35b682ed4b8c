use super::ExecutorError;
use crate::{
    distributed::{Artifact, Connector},
    resources::{command::shell_quote, command::RenderContext, Resource, ResourceError},
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files written before a job is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFiles {
    pub script: PathBuf,
    pub working_directory: PathBuf,
}

fn quoted(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Write the `.run` script and the parameter files of a job
///
/// The script records the exit code through a rename, so that a poll never
/// reads a partial `.code`, then touches `.done` on success.
pub fn generate(connector: &dyn Connector, resource: &Resource) -> Result<LaunchFiles, ExecutorError> {
    let job = resource
        .job_payload()
        .ok_or_else(|| ResourceError::NotAJob(resource.locator().clone()))?;

    let base = connector.resolve(resource.locator().path());
    let working_directory = match &job.working_directory {
        Some(directory) => directory.clone(),
        None => base
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/")),
    };
    let context = RenderContext {
        base: &base,
        working_directory: &working_directory,
    };

    for (key, content) in job.commands.parameter_files() {
        let path = context.parameter_file(key);
        connector.write_atomic(&path, content.as_bytes())?;
        debug!(path = ?path, "Wrote parameter file");
    }

    let stdin = job
        .stdin
        .clone()
        .unwrap_or_else(|| PathBuf::from("/dev/null"));
    let stdout = job
        .stdout
        .clone()
        .unwrap_or_else(|| Artifact::Out.path(&base));
    let stderr = job
        .stderr
        .clone()
        .unwrap_or_else(|| Artifact::Err.path(&base));
    let code = Artifact::Code.path(&base);
    let mut code_temporary = code.clone().into_os_string();
    code_temporary.push(".tmp");
    let code_temporary = PathBuf::from(code_temporary);

    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("# {}\n", resource.locator()));
    script.push_str(&format!("cd {} || exit 1\n\n", quoted(&working_directory)));
    script.push_str("(\nset -e\n");
    for line in job.commands.render(&context) {
        script.push_str(&line);
        script.push('\n');
    }
    script.push_str(&format!(
        ") < {} > {} 2> {}\n",
        quoted(&stdin),
        quoted(&stdout),
        quoted(&stderr)
    ));
    script.push_str("code=$?\n\n");
    script.push_str(&format!(
        "echo $code > {} && mv -f {} {}\n",
        quoted(&code_temporary),
        quoted(&code_temporary),
        quoted(&code)
    ));
    script.push_str(&format!(
        "if [ $code -eq 0 ]; then touch {}; fi\n",
        quoted(&Artifact::Done.path(&base))
    ));
    script.push_str("exit $code\n");

    let path = Artifact::Run.path(&base);
    connector.write_atomic(&path, script.as_bytes())?;
    debug!(path = ?path, "Wrote launch script");

    Ok(LaunchFiles {
        script: path,
        working_directory,
    })
}
