//! The listing step: enumerating the suite's tests before grouping.
//!
//! Listing runs the suite wrapper once with its list flag and keeps the
//! marker-prefixed lines (the wrapper logs freely to stdout, so plain
//! lines are filtered out). A listing failure is tolerated as "zero
//! tests": grouping then yields one empty group and the shard process
//! itself reports that no tests matched.

use async_trait::async_trait;
use tracing::warn;

use crate::config::RunnerSettings;
use crate::executor::{ExecutorResult, ShardCommand};

/// Prefix the suite wrapper puts in front of each listed test name.
const TEST_MARKER: &str = "#TEST# ";

/// Source of the ordered test-identifier list for a run.
#[async_trait]
pub trait TestLister: Send + Sync {
    /// Enumerate the suite's test identifiers, sorted.
    ///
    /// Implementations must not fail: an unenumerable suite is reported
    /// as an empty list.
    async fn list_tests(&self) -> Vec<String>;
}

/// Lists tests by invoking the suite wrapper's list mode.
pub struct WrapperLister {
    command: ShardCommand,
}

impl WrapperLister {
    /// Create a lister around the given listing command.
    pub fn new(command: ShardCommand) -> Self {
        Self { command }
    }

    /// Build the lister from a run's configured listing command line.
    pub fn from_settings(settings: &RunnerSettings) -> ExecutorResult<Self> {
        Ok(Self::new(ShardCommand::from_line(
            &settings.list_command_line(),
        )?))
    }
}

#[async_trait]
impl TestLister for WrapperLister {
    async fn list_tests(&self) -> Vec<String> {
        let output = match self.command.to_command().output().await {
            Ok(output) => output,
            Err(e) => {
                warn!("test listing failed to launch: {e}");
                return Vec::new();
            }
        };
        if !output.status.success() {
            // The shard runner will surface the error from having no
            // tests to run.
            warn!("test listing exited with {}", output.status);
            return Vec::new();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tests: Vec<String> = stdout
            .lines()
            .filter_map(|line| line.strip_prefix(TEST_MARKER))
            .map(str::to_string)
            .collect();
        tests.sort();
        tests
    }
}

/// A fixed, in-memory test list. Useful for tests and for callers that
/// already performed their own listing step.
pub struct StaticLister {
    tests: Vec<String>,
}

impl StaticLister {
    /// Create a lister that always returns `tests`.
    pub fn new(tests: Vec<String>) -> Self {
        Self { tests }
    }
}

#[async_trait]
impl TestLister for StaticLister {
    async fn list_tests(&self) -> Vec<String> {
        self.tests.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wrapper_lister_keeps_marked_lines_sorted() {
        let command = ShardCommand::new("/bin/sh").arg("-c").arg(
            "echo 'Robolectric noise'; \
             echo '#TEST# z.Y#b[28]'; \
             echo '#TEST# a.B#c[28]'; \
             echo 'more noise'",
        );
        let tests = WrapperLister::new(command).list_tests().await;
        assert_eq!(tests, vec!["a.B#c[28]".to_string(), "z.Y#b[28]".to_string()]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_zero_tests() {
        let command = ShardCommand::new("/bin/sh").arg("-c").arg("exit 3");
        assert!(WrapperLister::new(command).list_tests().await.is_empty());
    }

    #[tokio::test]
    async fn test_unlaunchable_lister_is_zero_tests() {
        let command = ShardCommand::new("/nonexistent/helper");
        assert!(WrapperLister::new(command).list_tests().await.is_empty());
    }
}
