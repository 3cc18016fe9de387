use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cascade_core::event::EventBus;
use cascade_core::types::CascadeEvent;

/// File for events that belong to no run (review queue activity).
const REVIEW_LOG: &str = "reviews";

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run summary, 2 = per node, 3 = per destination.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in the background until cancelled or the bus
    /// goes away.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: Receiver<CascadeEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut files: HashMap<String, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some((stream, entry)) = self.event_to_entry(&event) else {
                                continue;
                            };
                            self.write(&mut files, &stream, &entry).await;

                            if let CascadeEvent::RunFinished { run_id, .. } = &event {
                                if let Some(mut writer) = files.remove(&run_id.0) {
                                    writer.flush().await.ok();
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in files {
            writer.flush().await.ok();
        }
    }

    async fn write(
        &self,
        files: &mut HashMap<String, BufWriter<File>>,
        stream: &str,
        entry: &LogEntry,
    ) {
        if !files.contains_key(stream) {
            match open_log(&self.log_dir, stream).await {
                Ok(file) => {
                    files.insert(stream.to_string(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, stream, "Failed to open log file");
                    return;
                }
            }
        }
        let Some(writer) = files.get_mut(stream) else {
            return;
        };
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };
        let line = format!("{}\n", json);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, stream, "Failed to write log entry");
            return;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, stream, "Failed to flush log");
        }
    }

    /// Map an event to its log stream and entry; None when filtered by level.
    fn event_to_entry(&self, event: &CascadeEvent) -> Option<(String, LogEntry)> {
        let entry = |event_type, node_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            CascadeEvent::RunStarted {
                run_id,
                entity_id,
                workflow_id,
                total,
            } => Some((
                run_id.0.clone(),
                entry(
                    "run_started",
                    None,
                    Some(serde_json::json!({
                        "entity_id": entity_id,
                        "workflow_id": workflow_id,
                        "total": total,
                    })),
                ),
            )),
            CascadeEvent::RunFinished {
                run_id,
                status,
                message,
            } => Some((
                run_id.0.clone(),
                entry(
                    "run_finished",
                    None,
                    Some(serde_json::json!({ "status": status, "message": message })),
                ),
            )),
            CascadeEvent::RunReaped { run_id } => {
                Some((run_id.0.clone(), entry("run_reaped", None, None)))
            }

            // L2: per node
            CascadeEvent::NodeStarted {
                run_id,
                node_id,
                label,
            } if self.level >= 2 => Some((
                run_id.0.clone(),
                entry(
                    "node_started",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({ "label": label })),
                ),
            )),
            CascadeEvent::NodeCached { run_id, node_id } if self.level >= 2 => {
                Some((run_id.0.clone(), entry("node_cached", Some(node_id.as_str()), None)))
            }
            CascadeEvent::NodeCompleted {
                run_id,
                node_id,
                version,
                elapsed_ms,
            } if self.level >= 2 => Some((
                run_id.0.clone(),
                entry(
                    "node_completed",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({ "version": version, "elapsed_ms": elapsed_ms })),
                ),
            )),
            CascadeEvent::NodeFailed {
                run_id,
                node_id,
                error,
            } if self.level >= 2 => Some((
                run_id.0.clone(),
                entry(
                    "node_failed",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({ "error": error })),
                ),
            )),
            CascadeEvent::NodeSkipped {
                run_id,
                node_id,
                blocked_by,
            } if self.level >= 2 => Some((
                run_id.0.clone(),
                entry(
                    "node_skipped",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({ "blocked_by": blocked_by })),
                ),
            )),
            CascadeEvent::NodeDiscarded { run_id, node_id } if self.level >= 2 => {
                Some((run_id.0.clone(), entry("node_discarded", Some(node_id.as_str()), None)))
            }

            // L3: per destination
            CascadeEvent::DestinationFailed {
                run_id,
                node_id,
                destination_id,
                error,
            } if self.level >= 3 => Some((
                run_id.0.clone(),
                entry(
                    "destination_failed",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({
                        "destination_id": destination_id,
                        "error": error,
                    })),
                ),
            )),
            CascadeEvent::ChangeQueued { change_id, node_id } if self.level >= 3 => Some((
                REVIEW_LOG.to_string(),
                entry(
                    "change_queued",
                    Some(node_id.as_str()),
                    Some(serde_json::json!({ "change_id": change_id })),
                ),
            )),

            _ => None,
        }
    }
}

async fn open_log(dir: &Path, stream: &str) -> std::io::Result<File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.jsonl", stream)))
        .await
}
