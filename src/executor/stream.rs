//! Live output streaming for the first shard.
//!
//! The first shard's process is piped directly so its output reaches the
//! console as it is produced. A dedicated pump task reads merged
//! stdout/stderr lines into a queue; the consumer pulls from the queue
//! under the shard's own deadline. When the deadline expires the
//! consumer stops waiting, but any lines already buffered in the queue
//! are drained and forwarded first — buffered output is never dropped
//! by a timeout decision.

use futures::StreamExt;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Prefix a line with its two-character-padded shard index.
pub(crate) fn prefix_line(shard_index: usize, line: &str) -> String {
    format!("{shard_index:2}| {line}")
}

/// Pump the child's merged stdout/stderr lines to `out`, prefixed with
/// `shard_index`, until end-of-stream or `deadline`.
///
/// Returns once the stream has ended or the deadline has expired and
/// the queue backlog has been drained.
pub(crate) async fn stream_first_shard(
    shard_index: usize,
    child: &mut Child,
    deadline: Instant,
    out: &mpsc::UnboundedSender<String>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<String>();
    let pump = tokio::spawn(async move {
        let stdout_lines =
            stdout.map(|s| tokio_stream::wrappers::LinesStream::new(BufReader::new(s).lines()));
        let stderr_lines =
            stderr.map(|s| tokio_stream::wrappers::LinesStream::new(BufReader::new(s).lines()));
        let mut merged = stream::select(
            stream::iter(stdout_lines).flatten(),
            stream::iter(stderr_lines).flatten(),
        );
        while let Some(line) = merged.next().await {
            let line = line.unwrap_or_default();
            if queue_tx.send(line).is_err() {
                break;
            }
        }
        // Dropping queue_tx closes the queue, which is the end-of-stream
        // sentinel for the consumer.
    });

    loop {
        match tokio::time::timeout_at(deadline, queue_rx.recv()).await {
            Ok(Some(line)) => {
                let _ = out.send(prefix_line(shard_index, &line));
            }
            Ok(None) => break,
            Err(_) => {
                debug!(shard = shard_index, "first shard output deadline expired");
                break;
            }
        }
    }

    // Stop pumping and forward whatever the pump already queued.
    pump.abort();
    while let Ok(line) = queue_rx.try_recv() {
        let _ = out.send(prefix_line(shard_index, &line));
    }
}
