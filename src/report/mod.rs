//! Result aggregation and run reporting.
//!
//! Each shard writes a JSON result file; the aggregator parses them
//! into structured per-test results, attaches captured console excerpts
//! to failing tests, and folds everything into a single [`RunReport`].
//! A result file that cannot be read or parsed collapses the whole run
//! into one synthetic unknown result: a missing file means the run's
//! correctness cannot be trusted as a whole.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::executor::Job;

/// Status of one executed test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Test passed.
    Pass,
    /// Test assertion failed.
    Fail,
    /// Test process crashed.
    Crash,
    /// Test hit the framework's own per-test timeout.
    Timeout,
    /// Outcome could not be determined.
    Unknown,
}

impl RunStatus {
    /// True for the failing status kinds that get a log excerpt attached.
    pub fn is_failing(self) -> bool {
        matches!(self, RunStatus::Fail | RunStatus::Crash | RunStatus::Timeout)
    }
}

/// Structured result for one test, with any captured console excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Test name as reported by the shard.
    pub name: String,
    /// Outcome status.
    pub status: RunStatus,
    /// Console excerpt from the test's start marker through its failure
    /// marker; empty for passing tests or when no excerpt was captured.
    pub log: String,
}

/// One entry of a shard's JSON result file. The file's schema is owned
/// by the in-process results writer; everything beyond name and status
/// is opaque here.
#[derive(Debug, Deserialize)]
struct ResultEntry {
    name: String,
    status: RunStatus,
}

/// The terminal artifact of a run: every test's result plus run-level
/// context for retries and log elision.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// All per-test results, in shard order.
    pub results: Vec<RunResult>,
    /// Indices of shards that produced at least one failing result.
    pub failed_shards: Vec<usize>,
    /// Number of device-log lines elided from the visible stream.
    pub elided_lines: usize,
    /// Human-readable retry-filter suggestion, present when more than
    /// one worker ran and at least one shard failed.
    pub suggestion: Option<String>,
}

impl RunReport {
    /// A report holding a single synthetic unknown result.
    fn synthetic(name: &str) -> Self {
        Self {
            results: vec![RunResult {
                name: name.to_string(),
                status: RunStatus::Unknown,
                log: String::new(),
            }],
            failed_shards: Vec::new(),
            elided_lines: 0,
            suggestion: None,
        }
    }

    /// Report for a run whose shard filter excluded every shard.
    pub fn invalid_shard_filter() -> Self {
        Self::synthetic("Invalid shard filter")
    }

    /// Report for a run where a shard's result file was missing or
    /// unreadable.
    pub fn runner_failure() -> Self {
        Self::synthetic("Test Runner Failure")
    }

    /// True if every result passed.
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.status == RunStatus::Pass)
    }

    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Fold every job's result file into one report.
///
/// Failing results get the matching console excerpt from
/// `failure_logs` attached (absence is tolerated; the log stays empty).
/// Any I/O or parse error replaces the entire result list with a single
/// synthetic runner-failure result, discarding already-parsed shard
/// results on purpose.
pub fn aggregate(
    jobs: &[Job],
    failure_logs: &HashMap<String, String>,
    num_workers: usize,
) -> RunReport {
    let mut results = Vec::new();
    let mut failed_jobs: Vec<&Job> = Vec::new();

    for job in jobs {
        let entries = match parse_results_file(&job.results_path) {
            Ok(entries) => entries,
            Err(e) => {
                // The shard's runner may never write its file when it
                // fails wholesale.
                error!(
                    shard = job.shard_index,
                    "unusable result file {}: {e}",
                    job.results_path.display()
                );
                return RunReport::runner_failure();
            }
        };

        let mut has_failed = false;
        for entry in entries {
            let log = if entry.status.is_failing() {
                has_failed = true;
                failure_logs
                    .get(&entry.name.replace('#', "."))
                    .cloned()
                    .unwrap_or_default()
            } else {
                String::new()
            };
            results.push(RunResult {
                name: entry.name,
                status: entry.status,
                log,
            });
        }
        if has_failed {
            failed_jobs.push(job);
        }
    }

    let failed_shards: Vec<usize> = failed_jobs.iter().map(|j| j.shard_index).collect();
    let suggestion = if num_workers > 1 && !failed_jobs.is_empty() {
        Some(retry_suggestion(&failed_jobs))
    } else {
        None
    };

    RunReport {
        results,
        failed_shards,
        elided_lines: 0,
        suggestion,
    }
}

fn parse_results_file(path: &Path) -> anyhow::Result<Vec<ResultEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Per-shard retry filter lines plus a combined `--shard-filter` value.
fn retry_suggestion(failed_jobs: &[&Job]) -> String {
    let mut lines: Vec<String> = failed_jobs
        .iter()
        .map(|job| {
            format!(
                "Test filter for failed shard {}: --test-filter \"{}\"",
                job.shard_index, job.test_filter
            )
        })
        .collect();
    let indices: Vec<String> = failed_jobs
        .iter()
        .map(|j| j.shard_index.to_string())
        .collect();
    lines.push(format!(
        "{} shard(s) had failing tests. To re-run only these shards, \
         use the above filter flags, or use: --shard-filter {}",
        failed_jobs.len(),
        indices.join(",")
    ));
    lines.join("\n")
}
