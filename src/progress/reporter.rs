//! Background consumer of the progress stream
//!
//! Producers (the copier and the pusher) write lines into a bounded channel;
//! one tokio task applies each line to the [`ProgressTracker`] it owns and
//! renders the result to the downstream output. A full channel blocks the
//! producer, which bounds memory without an explicit queue.

use super::protocol::ProgressLine;
use super::tracker::ProgressTracker;
use super::{ProgressOutput, ProgressSink};
use crate::error::{AirgapError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROGRESS_BUFFER: usize = 64;

/// How lines are rendered downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Plain lines from the copier; markers are swallowed
    Plain,
    /// One JSON snapshot per consumed line
    Structured,
}

pub struct ProgressReporter {
    sink: ProgressSink,
    handle: JoinHandle<Result<ProgressTracker>>,
}

impl ProgressReporter {
    pub fn spawn(tracker: ProgressTracker, output: ProgressOutput, mode: ReportMode) -> Self {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let handle = tokio::spawn(consume(rx, tracker, output, mode));
        Self {
            sink: ProgressSink::new(tx),
            handle,
        }
    }

    pub fn sink(&self) -> ProgressSink {
        self.sink.clone()
    }

    /// Flushes, waits for every written line to be rendered and hands back
    /// the final state. Callers must drop their sink clones first.
    pub async fn finish(self) -> Result<ProgressTracker> {
        // A closed channel means the consumer already stopped; its own
        // result below says why.
        let _ = self.sink.send(&ProgressLine::Flush).await;
        drop(self.sink);

        self.handle
            .await
            .map_err(|e| AirgapError::Io(format!("progress consumer panicked: {}", e)))?
    }
}

async fn consume(
    mut rx: mpsc::Receiver<String>,
    mut tracker: ProgressTracker,
    output: ProgressOutput,
    mode: ReportMode,
) -> Result<ProgressTracker> {
    while let Some(raw) = rx.recv().await {
        let line = ProgressLine::parse(&raw);
        tracker.apply(&line);

        match mode {
            ReportMode::Structured => {
                let json = serde_json::to_string(&tracker.snapshot())?;
                output.write_line(&json)?;
            }
            ReportMode::Plain => {
                if !line.is_marker() {
                    output.write_line(&line.to_string())?;
                }
            }
        }
    }
    Ok(tracker)
}
