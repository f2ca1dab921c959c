//! Configuration loading and schema definitions.
//!
//! Run configuration lives in a TOML file; the CLI overlays a handful
//! of per-invocation options (worker count, shard filter, debug mode)
//! on top of the loaded values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::grouping::DEFAULT_MAX_TESTS_PER_GROUP;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Runner settings.
    pub runner: RunnerSettings,
}

/// Settings for one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Command line that invokes one shard of the suite. Filter and
    /// result-file arguments are appended per job.
    pub command: String,

    /// Command line that lists the suite's tests. Defaults to
    /// `command` with `--list-tests` appended.
    #[serde(default)]
    pub list_command: Option<String>,

    /// Diagnostic dump command for hung shard processes; `{pid}` is
    /// replaced with the process id, e.g. `jcmd {pid} Thread.print`.
    #[serde(default)]
    pub dump_command: Option<String>,

    /// Maximum number of tests per shard group.
    #[serde(default = "default_max_tests_per_group")]
    pub max_tests_per_group: usize,

    /// Number of concurrent shard processes. Defaults to half the
    /// available CPU parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Only run the listed shard indices.
    #[serde(default)]
    pub shard_filter: Option<Vec<usize>>,

    /// Interactive debugger attachment is requested for this run; only
    /// one process may hold the debug socket, so the pool shrinks to 1.
    #[serde(default)]
    pub debug: bool,

    /// Show device log lines instead of eliding them.
    #[serde(default)]
    pub verbose: bool,

    /// Optional file the raw console stream is also written to.
    #[serde(default)]
    pub raw_log: Option<PathBuf>,
}

impl RunnerSettings {
    /// The listing command line, applying the default when unset.
    pub fn list_command_line(&self) -> String {
        self.list_command
            .clone()
            .unwrap_or_else(|| format!("{} --list-tests", self.command))
    }
}

fn default_max_tests_per_group() -> usize {
    DEFAULT_MAX_TESTS_PER_GROUP
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = load_config_str(
            r#"
            [runner]
            command = "out/Debug/bin/helper/chrome_junit_tests"
            "#,
        )
        .unwrap();

        let runner = &config.runner;
        assert_eq!(runner.command, "out/Debug/bin/helper/chrome_junit_tests");
        assert_eq!(runner.max_tests_per_group, DEFAULT_MAX_TESTS_PER_GROUP);
        assert!(runner.workers.is_none());
        assert!(!runner.debug);
        assert_eq!(
            runner.list_command_line(),
            "out/Debug/bin/helper/chrome_junit_tests --list-tests"
        );
    }

    #[test]
    fn test_full_config_round_trip() {
        let config = load_config_str(
            r#"
            [runner]
            command = "bin/suite"
            list_command = "bin/suite --list"
            dump_command = "jcmd {pid} Thread.print"
            max_tests_per_group = 25
            workers = 4
            shard_filter = [0, 2]
            debug = true
            verbose = true
            raw_log = "run.log"
            "#,
        )
        .unwrap();

        let runner = &config.runner;
        assert_eq!(runner.max_tests_per_group, 25);
        assert_eq!(runner.workers, Some(4));
        assert_eq!(runner.shard_filter, Some(vec![0, 2]));
        assert!(runner.debug);
        assert_eq!(runner.list_command_line(), "bin/suite --list");
        assert_eq!(runner.raw_log, Some(PathBuf::from("run.log")));
    }

    #[test]
    fn test_missing_command_is_an_error() {
        assert!(load_config_str("[runner]\nverbose = true\n").is_err());
    }
}
