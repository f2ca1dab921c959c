//! Parallel shard execution.
//!
//! One OS process is launched per shard job, managed by a bounded worker
//! pool. The first job's output is piped and pumped live; every other
//! job writes combined stdout/stderr into a private scratch buffer that
//! is replayed, in ascending shard order, after the pool drains. Jobs
//! past the first carry a deadline: a process that outlives it gets a
//! best-effort diagnostic dump and is then killed.
//!
//! Each worker reports its outcome (including any dump text) through its
//! own join handle; the driver merges outcomes after join, so there is
//! no shared mutable timeout bookkeeping.

pub mod logscan;
pub mod stream;

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed startup allowance for one shard process, in seconds.
const JOB_STARTUP_SECS: u64 = 20;

/// Per-test warm-up allowance added to a job's timeout, in seconds.
const JOB_PER_TEST_SECS: u64 = 2;

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors that can occur while executing shard jobs.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid command line: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn shard {shard}: {source}")]
    Spawn {
        shard: usize,
        source: std::io::Error,
    },

    #[error("{} shard(s) exceeded their deadline", .0.len())]
    ShardsTimedOut(Vec<TimeoutDump>),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command line used to launch one shard process.
#[derive(Debug, Clone)]
pub struct ShardCommand {
    program: String,
    args: Vec<String>,
}

impl ShardCommand {
    /// Create a new command.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Parse a command from a shell-style line.
    pub fn from_line(line: &str) -> ExecutorResult<Self> {
        let words = shell_words::split(line)
            .map_err(|e| ExecutorError::InvalidCommand(format!("{line}: {e}")))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| ExecutorError::InvalidCommand("empty command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// A process-id-based diagnostic dump command, run against a shard that
/// has exceeded its deadline. The literal `{pid}` in any argument is
/// replaced with the hung process's id, e.g. `jcmd {pid} Thread.print`.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    program: String,
    args: Vec<String>,
}

impl DumpCommand {
    /// Parse a dump command template from a shell-style line.
    pub fn from_line(line: &str) -> ExecutorResult<Self> {
        let inner = ShardCommand::from_line(line)?;
        Ok(Self {
            program: inner.program,
            args: inner.args,
        })
    }

    /// Run the dump command against `pid` and capture its output.
    ///
    /// Dump failures are tolerated: they are reported as plain text in
    /// the returned string, never escalated.
    pub async fn capture(&self, pid: Option<u32>) -> String {
        let Some(pid) = pid else {
            return "Failed to dump stacks: process already exited".to_string();
        };

        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{pid}", &pid.to_string()))
            .collect();

        match tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
        {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out.stdout).into_owned();
                if out.status.success() {
                    text
                } else {
                    format!("Failed to dump stacks\n{text}")
                }
            }
            Err(e) => format!("Failed to dump stacks: {e}"),
        }
    }
}

/// One shard's command and constraints for a single run.
///
/// Created at schedule time, immutable thereafter, and owned by the
/// executor until the job completes.
#[derive(Debug, Clone)]
pub struct Job {
    /// Index of the shard this job runs.
    pub shard_index: usize,
    /// Command line that launches the shard process.
    pub command: ShardCommand,
    /// Deadline for the shard process.
    pub timeout: Duration,
    /// Path the shard writes its JSON results to.
    pub results_path: PathBuf,
    /// The `:`-joined test filter this shard runs, kept for retry
    /// suggestions.
    pub test_filter: String,
}

impl Job {
    /// Timeout for a job running `test_count` tests: a fixed startup
    /// baseline plus a per-test warm-up increment.
    pub fn timeout_for(test_count: usize) -> Duration {
        Duration::from_secs(JOB_STARTUP_SECS + JOB_PER_TEST_SECS * test_count as u64)
    }
}

/// Diagnostic record for a shard that exceeded its deadline.
#[derive(Debug, Clone)]
pub struct TimeoutDump {
    /// Index of the shard that timed out.
    pub shard_index: usize,
    /// The deadline the shard overran.
    pub timeout: Duration,
    /// Captured diagnostic text (or a plain-text note that capture failed).
    pub text: String,
}

/// Outcome a worker reports back through its join handle.
struct JobOutcome {
    shard_index: usize,
    timeout: Duration,
    dump: Option<String>,
    buffered: String,
}

/// Runs shard jobs on a bounded worker pool, serializing their output
/// into a single ordered line stream.
pub struct Executor {
    max_workers: usize,
    dump_command: Option<DumpCommand>,
}

impl Executor {
    /// Create an executor with the given pool size and optional
    /// diagnostic dump command.
    pub fn new(max_workers: usize, dump_command: Option<DumpCommand>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            dump_command,
        }
    }

    /// Launch `jobs` and return the merged output line stream plus a
    /// handle resolving to the run outcome.
    ///
    /// Every line of shard output appears on the channel prefixed with
    /// its shard index. Lines of the first job stream live; the others
    /// are replayed in ascending shard order after the pool joins. If
    /// any shard timed out, the handle resolves to
    /// [`ExecutorError::ShardsTimedOut`], but only after all buffered
    /// output, and the dump text itself, has been flushed to the
    /// channel.
    pub fn run(
        self,
        jobs: Vec<Job>,
    ) -> (
        mpsc::UnboundedReceiver<String>,
        tokio::task::JoinHandle<ExecutorResult<()>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drive(jobs, self.max_workers, self.dump_command, tx));
        (rx, handle)
    }
}

async fn drive(
    jobs: Vec<Job>,
    max_workers: usize,
    dump_command: Option<DumpCommand>,
    tx: mpsc::UnboundedSender<String>,
) -> ExecutorResult<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    let _ = tx.send(String::new());
    let _ = tx.send(format!("Shard {} output:", jobs[0].shard_index));

    let pool = Arc::new(Semaphore::new(max_workers));
    let mut handles = Vec::with_capacity(jobs.len());
    for (pos, job) in jobs.into_iter().enumerate() {
        let pool = pool.clone();
        let live_tx = tx.clone();
        let dump_command = dump_command.clone();
        handles.push(tokio::spawn(async move {
            if pos == 0 {
                run_live_job(job, pool, live_tx).await
            } else {
                run_buffered_job(job, pool, dump_command).await
            }
        }));
    }

    let mut dumps: Vec<TimeoutDump> = Vec::new();
    for (pos, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await??;
        if pos > 0 {
            let _ = tx.send(String::new());
            let _ = tx.send(format!("Shard {} output:", outcome.shard_index));
            for line in outcome.buffered.lines() {
                let _ = tx.send(stream::prefix_line(outcome.shard_index, line));
            }
        }
        if let Some(text) = outcome.dump {
            warn!(shard = outcome.shard_index, "shard exceeded its deadline");
            dumps.push(TimeoutDump {
                shard_index: outcome.shard_index,
                timeout: outcome.timeout,
                text,
            });
        }
    }

    if dumps.is_empty() {
        return Ok(());
    }

    dumps.sort_by_key(|d| d.shard_index);
    let _ = tx.send(String::new());
    let _ = tx.send("=".repeat(80));
    let _ = tx.send("One or more shards timed out.".to_string());
    let _ = tx.send("=".repeat(80));
    for dump in &dumps {
        let _ = tx.send(format!(
            "Shard {} timed out after {} seconds.",
            dump.shard_index,
            dump.timeout.as_secs()
        ));
        let _ = tx.send("Thread dump:".to_string());
        for line in dump.text.lines() {
            let _ = tx.send(line.to_string());
        }
        let _ = tx.send(String::new());
    }
    Err(ExecutorError::ShardsTimedOut(dumps))
}

/// Run the first job with piped output, streaming it live under the
/// job's deadline.
async fn run_live_job(
    job: Job,
    pool: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<String>,
) -> ExecutorResult<JobOutcome> {
    let _permit = pool.acquire_owned().await.expect("worker pool closed");

    debug!(shard = job.shard_index, "launching live shard");
    let mut child = job
        .command
        .to_command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            shard: job.shard_index,
            source,
        })?;

    let deadline = Instant::now() + job.timeout;
    stream::stream_first_shard(job.shard_index, &mut child, deadline, &tx).await;

    // Give the process until the same deadline to exit; kill-on-drop
    // reaps it if it is still running.
    let _ = tokio::time::timeout_at(deadline, child.wait()).await;

    Ok(JobOutcome {
        shard_index: job.shard_index,
        timeout: job.timeout,
        dump: None,
        buffered: String::new(),
    })
}

/// Run a non-first job with its combined output redirected to a scratch
/// buffer, enforcing the job's deadline on the process itself.
async fn run_buffered_job(
    job: Job,
    pool: Arc<Semaphore>,
    dump_command: Option<DumpCommand>,
) -> ExecutorResult<JobOutcome> {
    let _permit = pool.acquire_owned().await.expect("worker pool closed");

    let mut scratch = tempfile::tempfile()?;
    let stdout = scratch.try_clone()?;
    let stderr = scratch.try_clone()?;

    debug!(shard = job.shard_index, "launching buffered shard");
    let mut child = job
        .command
        .to_command()
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            shard: job.shard_index,
            source,
        })?;

    let dump = match tokio::time::timeout(job.timeout, child.wait()).await {
        Ok(_status) => None,
        Err(_) => {
            let text = match &dump_command {
                Some(cmd) => cmd.capture(child.id()).await,
                None => "No diagnostic dump command configured".to_string(),
            };
            let _ = child.kill().await;
            Some(text)
        }
    };

    // Replay whatever the shard managed to write, even after a timeout.
    scratch.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    scratch.read_to_end(&mut bytes)?;

    Ok(JobOutcome {
        shard_index: job.shard_index,
        timeout: job.timeout,
        dump,
        buffered: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
