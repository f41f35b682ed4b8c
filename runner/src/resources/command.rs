use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Commands of a job, run one after the other
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Commands(pub Vec<Command>);

/// A single command line
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Command(pub Vec<Argument>);

/// Plain strings are taken literally, maps are resolved when the job is launched
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Argument {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Placeholder {
    /// a path on the job's host
    Path { path: PathBuf },
    /// content written next to the job and passed as a path
    ParameterFile { key: String, content: String },
    WorkingDirectory,
}

/// Where placeholders resolve to for one launch
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    /// host path of the job, the artifacts are named after it
    pub base: &'a Path,
    pub working_directory: &'a Path,
}

impl RenderContext<'_> {
    pub fn parameter_file(&self, key: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_owned();
        name.push(format!(".{key}.input"));
        PathBuf::from(name)
    }
}

impl Commands {
    pub fn single<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(vec![Command::literal(arguments)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|command| command.0.is_empty())
    }

    /// all parameter files with their content, to be written before launching
    pub fn parameter_files<'a>(&'a self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.0
            .iter()
            .flat_map(|command| command.0.iter())
            .filter_map(|argument| match argument {
                Argument::Placeholder(Placeholder::ParameterFile { key, content }) => {
                    Some((key.as_str(), content.as_str()))
                }
                _ => None,
            })
    }

    /// one shell line per command
    pub fn render(&self, context: &RenderContext) -> Vec<String> {
        self.0
            .iter()
            .filter(|command| !command.0.is_empty())
            .map(|command| command.render(context))
            .collect()
    }
}

impl Command {
    pub fn literal<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            arguments
                .into_iter()
                .map(|argument| Argument::Literal(argument.into()))
                .collect(),
        )
    }

    pub fn render(&self, context: &RenderContext) -> String {
        self.0
            .iter()
            .map(|argument| match argument {
                Argument::Literal(value) => shell_quote(value),
                Argument::Placeholder(Placeholder::Path { path }) => {
                    shell_quote(&path.to_string_lossy())
                }
                Argument::Placeholder(Placeholder::ParameterFile { key, .. }) => {
                    shell_quote(&context.parameter_file(key).to_string_lossy())
                }
                Argument::Placeholder(Placeholder::WorkingDirectory) => {
                    shell_quote(&context.working_directory.to_string_lossy())
                }
            })
            .join(" ")
    }
}

/// Quote a word for `/bin/sh`, leaving simple words untouched
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ',' | ':' | '=' | '+' | '@' | '%')
        });

    if safe {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
