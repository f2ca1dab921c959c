//! End-to-end test run orchestration.
//!
//! A [`TestRun`] wires the pieces together: list the suite's tests,
//! group them into shards, build one job per selected shard inside a
//! run-scoped scratch directory, execute the jobs on the bounded pool,
//! scan and echo the merged console stream, then aggregate the shard
//! result files into a [`RunReport`].

use std::io::Write;
use std::path::Path;

use tracing::{error, warn};

use crate::config::RunnerSettings;
use crate::executor::logscan::{self, LogScanner};
use crate::executor::{DumpCommand, Executor, ExecutorError, Job, ShardCommand, TimeoutDump};
use crate::grouping::{self, ShardGroup};
use crate::listing::TestLister;
use crate::report::{self, RunReport};

/// Result type for run orchestration.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Grouping(#[from] grouping::GroupingError),

    /// One or more shards exceeded their deadline. Raised only after
    /// every line of output already produced has been flushed.
    #[error("{} shard(s) timed out", .0.len())]
    ShardsTimedOut(Vec<TimeoutDump>),

    #[error(transparent)]
    Executor(ExecutorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One full sharded run of a test suite.
pub struct TestRun<L> {
    settings: RunnerSettings,
    lister: L,
}

impl<L: TestLister> TestRun<L> {
    /// Create a run from settings and a test-listing source.
    pub fn new(settings: RunnerSettings, lister: L) -> Self {
        Self { settings, lister }
    }

    /// Run the suite, echoing the merged console stream to stdout.
    pub async fn run(&self) -> RunnerResult<RunReport> {
        let mut stdout = std::io::stdout();
        self.run_with_console(&mut stdout).await
    }

    /// Run the suite, echoing the merged console stream to `console`.
    ///
    /// Returns the aggregated report, or
    /// [`RunnerError::ShardsTimedOut`] if any shard overran its
    /// deadline (fatal to the run; shard results are not aggregated).
    pub async fn run_with_console<W: Write + Send>(
        &self,
        console: &mut W,
    ) -> RunnerResult<RunReport> {
        let tests = self.lister.list_tests().await;
        let groups = grouping::group_tests(&tests, self.settings.max_tests_per_group)?;

        let selected: Vec<usize> = match &self.settings.shard_filter {
            Some(filter) => (0..groups.len()).filter(|i| filter.contains(i)).collect(),
            None => (0..groups.len()).collect(),
        };
        if selected.is_empty() {
            warn!("shard filter selected no shards; nothing to run");
            return Ok(RunReport::invalid_shard_filter());
        }

        let num_workers = self.choose_num_workers(selected.len());
        if self.settings.shard_filter.is_some() {
            let indices: Vec<String> = selected.iter().map(|i| i.to_string()).collect();
            warn!(
                "Running test shards: {} using {} concurrent process(es)",
                indices.join(", "),
                num_workers
            );
        } else {
            warn!(
                "Running tests with {} shard(s) using {} concurrent process(es).",
                selected.len(),
                num_workers
            );
        }

        // Result files live here and are removed when the run ends,
        // whatever the outcome.
        let scratch_dir = tempfile::tempdir()?;
        let base =
            ShardCommand::from_line(&self.settings.command).map_err(RunnerError::Executor)?;
        let jobs: Vec<Job> = selected
            .iter()
            .map(|&i| make_job(i, &groups[i], &base, scratch_dir.path()))
            .collect();

        let dump_command = match &self.settings.dump_command {
            Some(line) => Some(DumpCommand::from_line(line).map_err(RunnerError::Executor)?),
            None => None,
        };

        let (mut rx, exec_handle) = Executor::new(num_workers, dump_command).run(jobs.clone());

        let mut raw_log = match &self.settings.raw_log {
            Some(path) => Some(std::fs::File::create(path)?),
            None => None,
        };
        let mut scanner = LogScanner::new();
        let mut elided = 0usize;
        while let Some(line) = rx.recv().await {
            if let Some(sink) = raw_log.as_mut() {
                writeln!(sink, "{line}")?;
            }
            if self.settings.verbose || !logscan::is_device_log(&line) {
                writeln!(console, "{line}")?;
            } else {
                elided += 1;
            }
            scanner.observe(&line);
        }
        console.flush()?;
        if let Some(sink) = raw_log.as_mut() {
            sink.flush()?;
        }

        if elided > 0 {
            error!("{elided} log lines omitted.");
        }

        match exec_handle
            .await
            .map_err(|e| RunnerError::Executor(ExecutorError::Join(e)))?
        {
            Ok(()) => {}
            Err(ExecutorError::ShardsTimedOut(dumps)) => {
                return Err(RunnerError::ShardsTimedOut(dumps));
            }
            Err(e) => return Err(RunnerError::Executor(e)),
        }

        let mut report = report::aggregate(&jobs, &scanner.into_failure_logs(), num_workers);
        report.elided_lines = elided;
        if let Some(suggestion) = &report.suggestion {
            writeln!(console, "{suggestion}")?;
        }
        Ok(report)
    }

    fn choose_num_workers(&self, num_jobs: usize) -> usize {
        let requested = if self.settings.debug {
            // Only one process can hold the debug socket.
            1
        } else {
            self.settings
                .workers
                .unwrap_or_else(|| (num_cpus::get() / 2).max(1))
        };
        requested.clamp(1, num_jobs.max(1))
    }
}

/// Bind one shard group to a concrete job.
fn make_job(shard_index: usize, group: &ShardGroup, base: &ShardCommand, dir: &Path) -> Job {
    let results_path = dir.join(format!("results{shard_index}.json"));
    let test_filter = group.filter_expression();
    let command = base
        .clone()
        .arg("-json-results-file")
        .arg(results_path.to_string_lossy())
        .arg("-gtest-filter")
        .arg(test_filter.as_str());
    Job {
        shard_index,
        command,
        timeout: Job::timeout_for(group.len()),
        results_path,
        test_filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::StaticLister;
    use crate::report::RunStatus;
    use std::path::PathBuf;

    /// Writes a fake suite-wrapper script that emits gtest-style
    /// markers and a JSON result file derived from its filter.
    fn fake_suite(dir: &tempfile::TempDir, status: &str) -> PathBuf {
        let path = dir.path().join("suite.sh");
        let script = format!(
            r#"#!/bin/sh
results=""
filter=""
while [ $# -gt 0 ]; do
  case "$1" in
    -json-results-file) results="$2"; shift 2 ;;
    -gtest-filter) filter="$2"; shift 2 ;;
    *) shift ;;
  esac
done
first="${{filter%%:*}}"
echo "[ RUN      ] $first"
echo "shard console context"
case "{status}" in
  PASS) echo "[       OK ] $first" ;;
  *) echo "[ FAILED ] $first" ;;
esac
printf '[{{"name": "%s", "status": "{status}"}}]' "$first" > "$results"
"#
        );
        std::fs::write(&path, script).unwrap();
        path
    }

    fn settings(command: String) -> RunnerSettings {
        RunnerSettings {
            command,
            list_command: None,
            dump_command: None,
            max_tests_per_group: 150,
            workers: Some(2),
            shard_filter: None,
            debug: false,
            verbose: false,
            raw_log: None,
        }
    }

    async fn run(settings: RunnerSettings, tests: &[&str]) -> (Vec<u8>, RunnerResult<RunReport>) {
        let lister = StaticLister::new(tests.iter().map(|t| t.to_string()).collect());
        let run = TestRun::new(settings, lister);
        let mut console = Vec::new();
        let result = run.run_with_console(&mut console).await;
        (console, result)
    }

    #[tokio::test]
    async fn test_passing_run_produces_passing_report() {
        let dir = tempfile::tempdir().unwrap();
        let suite = fake_suite(&dir, "PASS");
        let cfg = settings(format!("/bin/sh {}", suite.display()));

        let (console, result) = run(cfg, &["a.B#c[28]", "a.B#d[28]"]).await;
        let report = result.unwrap();

        assert!(report.success());
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, RunStatus::Pass);
        let console = String::from_utf8(console).unwrap();
        assert!(console.contains("Shard 0 output:"));
        assert!(console.contains(" 0| [ RUN      ] a.B.c[28]"));
    }

    #[tokio::test]
    async fn test_failing_run_attaches_logs_and_suggests_retry() {
        let dir = tempfile::tempdir().unwrap();
        let suite = fake_suite(&dir, "FAIL");
        let cfg = settings(format!("/bin/sh {}", suite.display()));

        // Distinct SDK versions force two shards, hence two workers.
        let (console, result) = run(cfg, &["a.B#c[28]", "z.Y#x[27]"]).await;
        let report = result.unwrap();

        assert!(!report.success());
        assert_eq!(report.failed_shards, vec![0, 1]);
        for r in &report.results {
            assert_eq!(r.status, RunStatus::Fail);
            assert!(r.log.contains("shard console context"), "log missing: {r:?}");
        }
        let suggestion = report.suggestion.as_deref().unwrap();
        assert!(suggestion.contains("--shard-filter 0,1"));
        let console = String::from_utf8(console).unwrap();
        assert!(console.contains(suggestion));
    }

    #[tokio::test]
    async fn test_empty_listing_still_runs_one_shard() {
        let dir = tempfile::tempdir().unwrap();
        // An empty filter expands to an empty result list.
        let suite = fake_suite(&dir, "PASS");
        let script = std::fs::read_to_string(&suite).unwrap().replace(
            "echo \"[ RUN      ] $first\"",
            "[ -z \"$filter\" ] && printf '[]' > \"$results\" && exit 0\necho \"[ RUN      ] $first\"",
        );
        std::fs::write(&suite, script).unwrap();
        let cfg = settings(format!("/bin/sh {}", suite.display()));

        let (_console, result) = run(cfg, &[]).await;
        let report = result.unwrap();
        assert!(report.results.is_empty());
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_exhaustive_shard_filter_short_circuits() {
        // The command is unlaunchable; reaching the synthetic report
        // proves no shard process was scheduled.
        let mut cfg = settings("/nonexistent/suite".to_string());
        cfg.shard_filter = Some(vec![9]);

        let (_console, result) = run(cfg, &["a.B#c[28]"]).await;
        let report = result.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].name, "Invalid shard filter");
        assert_eq!(report.results[0].status, RunStatus::Unknown);
    }

    #[tokio::test]
    async fn test_device_log_lines_are_elided_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.sh");
        let script = r#"#!/bin/sh
results=""
while [ $# -gt 0 ]; do
  case "$1" in
    -json-results-file) results="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "I/AssetManager: not found"
echo "visible runner line"
printf '[]' > "$results"
"#;
        std::fs::write(&path, script).unwrap();
        let cfg = settings(format!("/bin/sh {}", path.display()));

        let (console, result) = run(cfg, &["a.B#c[28]"]).await;
        let report = result.unwrap();

        let console = String::from_utf8(console).unwrap();
        assert!(console.contains(" 0| visible runner line"));
        assert!(!console.contains("AssetManager"));
        assert_eq!(report.elided_lines, 1);
    }

    #[tokio::test]
    async fn test_raw_log_receives_elided_lines_too() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.sh");
        let script = r#"#!/bin/sh
results=""
while [ $# -gt 0 ]; do
  case "$1" in
    -json-results-file) results="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "I/AssetManager: elided from console"
printf '[]' > "$results"
"#;
        std::fs::write(&path, script).unwrap();
        let raw = dir.path().join("raw.log");
        let mut cfg = settings(format!("/bin/sh {}", path.display()));
        cfg.raw_log = Some(raw.clone());

        let (_console, result) = run(cfg, &["a.B#c[28]"]).await;
        result.unwrap();

        let raw = std::fs::read_to_string(raw).unwrap();
        assert!(raw.contains("AssetManager"));
    }

    #[test]
    fn test_debug_mode_forces_single_worker() {
        let mut cfg = settings("true".to_string());
        cfg.debug = true;
        cfg.workers = Some(8);
        let run = TestRun::new(cfg, StaticLister::new(Vec::new()));
        assert_eq!(run.choose_num_workers(4), 1);
    }

    #[test]
    fn test_worker_count_is_bounded_by_job_count() {
        let cfg = settings("true".to_string());
        let run = TestRun::new(cfg, StaticLister::new(Vec::new()));
        assert_eq!(run.choose_num_workers(1), 1);

        let mut cfg = settings("true".to_string());
        cfg.workers = Some(16);
        let run = TestRun::new(cfg, StaticLister::new(Vec::new()));
        assert_eq!(run.choose_num_workers(3), 3);
    }
}
