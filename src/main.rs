//! shardrun CLI - Sharded parallel runner for JUnit-style test suites.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use shardrun::config::{self, RunnerSettings};
use shardrun::listing::{TestLister, WrapperLister};
use shardrun::report::RunStatus;
use shardrun::runner::{RunnerError, TestRun};

#[derive(Parser)]
#[command(name = "shardrun")]
#[command(about = "Sharded parallel test suite runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shardrun.toml")]
    config: PathBuf,

    /// Verbose output (includes device log lines)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite
    Run {
        /// Override number of concurrent shard processes
        #[arg(short, long)]
        workers: Option<usize>,

        /// Only run these shard indices, e.g. `--shard-filter 0,2`
        #[arg(long, value_delimiter = ',')]
        shard_filter: Option<Vec<usize>>,

        /// Run shards one at a time for debugger attachment
        #[arg(long)]
        debug: bool,

        /// Write the unfiltered merged output to this file
        #[arg(long)]
        raw_log: Option<PathBuf>,
    },

    /// List the suite's tests without running them
    List,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            workers,
            shard_filter,
            debug,
            raw_log,
        } => run_suite(&cli.config, workers, shard_filter, debug, raw_log, cli.verbose).await,
        Commands::List => list_tests(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

async fn run_suite(
    config_path: &Path,
    workers_override: Option<usize>,
    shard_filter: Option<Vec<usize>>,
    debug: bool,
    raw_log: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if workers_override.is_some() {
        config.runner.workers = workers_override;
    }
    if shard_filter.is_some() {
        config.runner.shard_filter = shard_filter;
    }
    config.runner.debug = debug || config.runner.debug;
    config.runner.verbose = verbose || config.runner.verbose;
    if raw_log.is_some() {
        config.runner.raw_log = raw_log;
    }

    info!("Loaded configuration from {}", config_path.display());

    let lister = WrapperLister::from_settings(&config.runner)?;
    let run = TestRun::new(config.runner, lister);

    let report = match run.run().await {
        Ok(report) => report,
        Err(RunnerError::ShardsTimedOut(dumps)) => {
            for dump in &dumps {
                error!(
                    "Shard {} timed out after {} seconds",
                    dump.shard_index,
                    dump.timeout.as_secs()
                );
            }
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    let passed = report
        .results
        .iter()
        .filter(|r| r.status == RunStatus::Pass)
        .count();
    let failing = report
        .results
        .iter()
        .filter(|r| r.status.is_failing())
        .count();
    info!(
        "{} test(s): {} passed, {} failing",
        report.results.len(),
        passed,
        failing
    );

    std::process::exit(report.exit_code());
}

async fn list_tests(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let tests = WrapperLister::from_settings(&config.runner)?
        .list_tests()
        .await;

    println!("Found {} tests:", tests.len());
    for test in &tests {
        println!("  {}", test);
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            print_settings(&config.runner);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_settings(runner: &RunnerSettings) {
    println!("Settings:");
    println!("  Command: {}", runner.command);
    println!("  List command: {}", runner.list_command_line());
    match &runner.dump_command {
        Some(cmd) => println!("  Dump command: {}", cmd),
        None => println!("  Dump command: (none)"),
    }
    println!("  Max tests per group: {}", runner.max_tests_per_group);
    match runner.workers {
        Some(workers) => println!("  Workers: {}", workers),
        None => println!("  Workers: (half of available CPUs)"),
    }
}

fn init_config() -> Result<()> {
    let config = r##"# shardrun configuration file

[runner]
# Command line that runs one shard of the suite. shardrun appends
# -json-results-file and -gtest-filter arguments per shard.
command = "bin/run_suite"

# Command line that prints the suite's tests, one per line, each
# prefixed with "#TEST# ". Defaults to the run command with
# --list-tests appended.
# list_command = "bin/run_suite --list-tests"

# Diagnostic command for hung shards; {pid} is substituted.
# dump_command = "jcmd {pid} Thread.print"

max_tests_per_group = 150
"##;

    let path = PathBuf::from("shardrun.toml");
    if path.exists() {
        eprintln!("shardrun.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created shardrun.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  shardrun run");

    Ok(())
}
