//! Subscriber set up by the binary.
//!
//! The filter comes from `EXPMAN_LOG` (any `EnvFilter` directive, e.g.
//! `expman::scheduler=debug`), else from `--log-level`, else `info`.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "EXPMAN_LOG";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

fn filter(cli_level: Option<LogLevel>) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(cli_level.unwrap_or(LogLevel::Info).directive())
    })
}

/// Install the global subscriber, writing to stderr, once at startup
pub fn init_logging(cli_level: Option<LogLevel>) {
    fmt()
        .with_env_filter(filter(cli_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .init();
}
