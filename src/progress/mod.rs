//! Progress reporting for push runs
//!
//! - [`protocol`]: the line vocabulary shared by the copier and the pusher
//! - [`tracker`]: image/layer state and snapshot rendering
//! - [`reporter`]: the background task connecting the two
//!
//! [`ProgressOutput`] is the caller's downstream sink; [`ProgressSink`] is
//! the in-process pipe producers write into.

pub mod protocol;
pub mod reporter;
pub mod tracker;

use crate::error::{AirgapError, Result};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub use protocol::ProgressLine;
pub use reporter::{ProgressReporter, ReportMode};
pub use tracker::{Clock, ProgressImage, ProgressSnapshot, ProgressTracker, SystemClock};

/// Downstream writer, shared by every stage of a run
#[derive(Clone)]
pub struct ProgressOutput {
    writer: Arc<Mutex<dyn Write + Send>>,
}

impl ProgressOutput {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn sink() -> Self {
        Self::new(std::io::sink())
    }

    /// Writes `line` followed by a newline and flushes
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| AirgapError::Io("progress output lock poisoned".to_string()))?;
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| AirgapError::Io(format!("Failed to write progress: {}", e)))
    }
}

/// Writing end of the progress pipe
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<String>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Sends one line; waits while the pipe is full
    pub async fn send_line(&self, line: impl Into<String>) -> Result<()> {
        self.tx
            .send(line.into())
            .await
            .map_err(|_| AirgapError::Io("progress consumer stopped".to_string()))
    }

    pub async fn send(&self, line: &ProgressLine) -> Result<()> {
        self.send_line(line.to_string()).await
    }

    /// Sends every non-empty line of `text`
    pub async fn write_text(&self, text: &str) -> Result<()> {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.send_line(line).await?;
        }
        Ok(())
    }
}
