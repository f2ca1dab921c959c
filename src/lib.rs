//! shardrun: a sharded parallel runner for JUnit-style test suites.
//!
//! This crate drives a suite wrapper binary in parallel: it lists the
//! suite's tests, groups them into shards, runs one wrapper process
//! per shard on a bounded worker pool, streams and filters the merged
//! console output, and aggregates per-shard JSON result files into a
//! single report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Grouping**: Sort tests into same-SDK, bounded-size shard groups
//! - **Listing**: Obtain the suite's test names from the wrapper
//! - **Executor**: Run shard processes concurrently and merge output
//! - **Report**: Aggregate shard result files and suggest retries
//!
//! # Example
//!
//! ```no_run
//! use shardrun::config::load_config;
//! use shardrun::listing::WrapperLister;
//! use shardrun::runner::TestRun;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardrun.toml"))?;
//!     let lister = WrapperLister::from_settings(&config.runner)?;
//!     let report = TestRun::new(config.runner, lister).run().await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod config;
pub mod executor;
pub mod grouping;
pub mod listing;
pub mod report;
pub mod runner;

// Re-export commonly used types
pub use config::{load_config, Config, RunnerSettings};
pub use executor::{DumpCommand, Executor, Job, ShardCommand};
pub use grouping::{group_tests, ShardGroup, TestIdentifier};
pub use listing::{StaticLister, TestLister, WrapperLister};
pub use report::{RunReport, RunResult, RunStatus};
pub use runner::{RunnerError, TestRun};
