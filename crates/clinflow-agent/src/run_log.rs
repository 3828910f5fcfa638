use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info};

use clinflow_core::types::{ProgressEvent, RunId};

/// JSONL run logger.
///
/// Drains one run's progress channel and appends each event to
/// `{log_dir}/{run_id}.jsonl`, one JSON object per line. Lines already written
/// stay intact if the process dies mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'static str,
    event: &'a ProgressEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events until the run pauses, completes, or the channel closes.
    pub async fn run(self, mut rx: broadcast::Receiver<ProgressEvent>, run_id: RunId) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.path_for(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let entry = LogEntry {
                        timestamp: Utc::now().to_rfc3339(),
                        run_id: run_id.as_str(),
                        event_type: event.kind(),
                        event: &event,
                    };
                    if let Ok(json) = serde_json::to_string(&entry) {
                        let line = format!("{}\n", json);
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "RunLogger lagged, skipped events");
                }
                Err(RecvError::Closed) => {
                    debug!("Progress channel closed, RunLogger stopping");
                    break;
                }
            }
        }
        let _ = writer.flush().await;
    }
}
