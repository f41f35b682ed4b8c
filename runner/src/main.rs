use clap::{Parser, Subcommand};
use expman::{
    config::ExpmanConfig,
    description,
    logging::{init_logging, LogLevel},
    resources::{Locator, ResourceState},
    scheduler::{BatchReport, Message, Scheduler},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dependency-driven experiment scheduler")]
struct Cli {
    /// YAML configuration, defaults apply without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// overridden by EXPMAN_LOG
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start ready jobs and poll resources
    Run {
        /// stop once no job is ready or running
        #[arg(long)]
        until_idle: bool,
    },
    /// Submit the resources described in a YAML file
    Submit { file: PathBuf },
    /// List resources
    List {
        #[arg(long)]
        group: Option<String>,
        #[arg(long = "state", value_enum)]
        states: Vec<ResourceState>,
    },
    /// Show the state, counters and blocking dependency of a resource
    Info { locator: Locator },
    /// Put failed or held resources back in line
    Restart {
        locators: Vec<Locator>,
        /// restart done resources too
        #[arg(long)]
        done: bool,
        /// invalidate the dependents of restarted done resources
        #[arg(long)]
        recursive: bool,
    },
    /// Make done resources produce their outputs again
    Invalidate {
        locators: Vec<Locator>,
        /// also stop running dependents and restart failed ones
        #[arg(long)]
        recursive: bool,
    },
    /// Remove a resource, or the resources matching a glob pattern
    Remove {
        target: String,
        #[arg(long = "state", value_enum)]
        states: Vec<ResourceState>,
        /// remove the dependents too
        #[arg(long)]
        recursive: bool,
    },
    /// Poll the markers of resources
    Update {
        #[arg(long = "state", value_enum)]
        states: Vec<ResourceState>,
    },
    /// Kill running jobs
    Stop {
        locators: Vec<Locator>,
        /// put them back in line instead of failing them
        #[arg(long)]
        restart: bool,
    },
    /// Write the launch scripts of jobs again
    Generate { locators: Vec<Locator> },
    /// Change the number of slots of a token
    TokenLimit { locator: Locator, limit: u32 },
}

fn report(operation: &str, report: BatchReport) -> ExitCode {
    for (locator, failure) in report.failures.iter() {
        error!(locator = %locator, "{operation} failed: {failure}");
    }
    println!("{operation}: {}", report.count);

    if report.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn batch<F>(locators: &[Locator], mut operation: F) -> BatchReport
where
    F: FnMut(&Locator) -> Result<usize, expman::scheduler::SchedulerError>,
{
    let mut report = BatchReport::default();
    for locator in locators {
        match operation(locator) {
            Ok(count) => report.count += count,
            Err(failure) => report.failures.push((locator.clone(), failure)),
        }
    }
    report
}

fn execute(scheduler: &Arc<Scheduler>, command: Commands) -> ExitCode {
    match command {
        Commands::Run { until_idle } => {
            scheduler.add_listener(Arc::new(|message: &Message| match message {
                Message::StateChanged { locator, old, new } => {
                    info!(locator = %locator, "{old} -> {new}")
                }
                Message::ResourceAdded { locator, state } => {
                    info!(locator = %locator, state = %state, "Resource added")
                }
                Message::ResourceRemoved { locator } => info!(locator = %locator, "Resource removed"),
            }));

            if until_idle {
                scheduler.run_until_idle().unwrap_or_log();
            } else {
                for handle in scheduler.start().unwrap_or_log() {
                    if handle.join().is_err() {
                        error!("A scheduler thread panicked");
                        return ExitCode::FAILURE;
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Submit { file } => {
            let descriptions = description::load(&file).unwrap_or_log();
            debug!(count = descriptions.len(), "Read descriptions");
            report("submitted", description::submit_all(scheduler, descriptions))
        }
        Commands::List { group, states } => {
            let resources = scheduler.list(group.as_deref(), &states).unwrap_or_log();
            for resource in resources {
                println!(
                    "{:<8} {:<5} {}",
                    resource.state().as_str(),
                    resource.kind_name(),
                    resource.locator()
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Info { locator } => {
            let information = scheduler.information(&locator).unwrap_or_log();
            print!("{}", serde_yaml::to_string(&information).unwrap_or_log());
            ExitCode::SUCCESS
        }
        Commands::Restart {
            locators,
            done,
            recursive,
        } => report(
            "restarted",
            batch(&locators, |locator| scheduler.restart(locator, done, recursive)),
        ),
        Commands::Invalidate {
            locators,
            recursive,
        } => report(
            "invalidated",
            batch(&locators, |locator| scheduler.invalidate(locator, recursive)),
        ),
        Commands::Remove {
            target,
            states,
            recursive,
        } => report(
            "removed",
            scheduler.remove(&target, &states, recursive).unwrap_or_log(),
        ),
        Commands::Update { states } => report(
            "changed",
            scheduler.update_all(&states).unwrap_or_log(),
        ),
        Commands::Stop { locators, restart } => {
            report("stopped", scheduler.stop(&locators, restart))
        }
        Commands::Generate { locators } => report("generated", scheduler.generate_files(&locators)),
        Commands::TokenLimit { locator, limit } => {
            scheduler.set_token_limit(&locator, limit).unwrap_or_log();
            ExitCode::SUCCESS
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let mut config = match &cli.config {
        Some(path) => ExpmanConfig::load(path).unwrap_or_log(),
        None => ExpmanConfig::default(),
    };
    if config.preflight_checks() {
        error!("Configuration has errors, aborting");
        return ExitCode::FAILURE;
    }

    let scheduler = Scheduler::load(&config).unwrap_or_log();
    let code = execute(&scheduler, cli.command);

    if let Err(error) = scheduler.close() {
        error!(error = %error, "Failed to close the database");
        return ExitCode::FAILURE;
    }

    code
}
