use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainflow_core::event::EventBus;
use chainflow_core::types::{RunEvent, RunId};

/// JSONL trace writer.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of a trace file.
#[derive(Debug, Serialize)]
struct TraceLine {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run start and outcome, 2 = every node.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the trace file for `run_id`.
    pub fn trace_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id.0))
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut writers: HashMap<RunId, BufWriter<File>> = HashMap::new();

        loop {
            // Queued events are drained before cancellation is honoured.
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(line) = self.event_to_line(&event) {
                                self.write_line(&mut writers, event.run_id(), &line).await;
                            }
                            if event.is_terminal() {
                                if let Some(mut writer) = writers.remove(event.run_id()) {
                                    writer.flush().await.ok();
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // A skipped terminal event would leave its writer open;
                            // files reopen in append mode on the next line.
                            warn!(
                                skipped = n,
                                open = writers.len(),
                                "RunLogger lagged, closing trace files"
                            );
                            close_all(&mut writers).await;
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        close_all(&mut writers).await;
        debug!("RunLogger finished");
    }

    async fn write_line(
        &self,
        writers: &mut HashMap<RunId, BufWriter<File>>,
        run_id: &RunId,
        line: &TraceLine,
    ) {
        if !writers.contains_key(run_id) {
            let path = self.trace_path(run_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    writers.insert(run_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open trace file");
                    return;
                }
            }
        }
        let Some(writer) = writers.get_mut(run_id) else {
            return;
        };

        let Ok(json) = serde_json::to_string(line) else {
            return;
        };
        if let Err(e) = writer.write_all(format!("{}\n", json).as_bytes()).await {
            error!(error = %e, run_id = %run_id, "Failed to write trace line");
            return;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush trace");
        }
    }

    /// Convert a RunEvent to a trace line (None if filtered by level).
    fn event_to_line(&self, event: &RunEvent) -> Option<TraceLine> {
        let timestamp = Utc::now().to_rfc3339();
        let run_id = event.run_id().0.clone();

        match event {
            // L1: run summary
            RunEvent::RunStarted { entry_node, .. } => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "run_started",
                node: Some(entry_node.clone()),
                detail: None,
            }),
            RunEvent::RunCompleted {
                steps,
                quality_score,
                ..
            } => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "run_completed",
                node: None,
                detail: Some(serde_json::json!({
                    "steps": steps,
                    "quality_score": quality_score,
                })),
            }),
            RunEvent::RunFailed { failure, .. } => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "run_failed",
                node: None,
                detail: Some(serde_json::json!({
                    "kind": failure.kind,
                    "message": failure.message,
                })),
            }),

            // L2: per-node
            RunEvent::NodeStarted { node, tool, .. } if self.level >= 2 => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "node_started",
                node: Some(node.clone()),
                detail: Some(serde_json::json!({ "tool": tool })),
            }),
            RunEvent::NodeCompleted { entry, .. } if self.level >= 2 => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "node_completed",
                node: Some(entry.node.clone()),
                detail: Some(serde_json::json!({
                    "elapsed_ms": entry.elapsed_ms,
                    "quality_score": entry.state_snapshot.quality_score,
                    "done": entry.state_snapshot.done,
                })),
            }),
            RunEvent::NodeFailed { entry, .. } if self.level >= 2 => Some(TraceLine {
                timestamp,
                run_id,
                event_type: "node_failed",
                node: Some(entry.node.clone()),
                detail: Some(serde_json::json!({
                    "elapsed_ms": entry.elapsed_ms,
                    "error": entry.error,
                })),
            }),

            _ => None,
        }
    }
}

async fn close_all(writers: &mut HashMap<RunId, BufWriter<File>>) {
    for (_, mut writer) in writers.drain() {
        writer.flush().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::types::{FailureKind, LogEntry, RunFailure, WorkflowState};

    fn node_completed(run_id: &RunId) -> RunEvent {
        RunEvent::NodeCompleted {
            run_id: run_id.clone(),
            entry: LogEntry::executed("extract", WorkflowState::new(), 4),
        }
    }

    #[test]
    fn test_level_filtering() {
        let run_id = RunId::from_string("r1");
        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        let verbose = RunLogger::new(PathBuf::from("/tmp"), 2);

        assert!(summary.event_to_line(&node_completed(&run_id)).is_none());
        let line = verbose.event_to_line(&node_completed(&run_id)).unwrap();
        assert_eq!(line.event_type, "node_completed");
        assert_eq!(line.node.as_deref(), Some("extract"));

        let failed = RunEvent::RunFailed {
            run_id: run_id.clone(),
            failure: RunFailure {
                kind: FailureKind::Timeout,
                message: "timed out".into(),
            },
        };
        let line = summary.event_to_line(&failed).unwrap();
        assert_eq!(line.detail.unwrap()["kind"], "timeout");
    }

    #[tokio::test]
    async fn test_writes_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let path = logger.trace_path(&RunId::from_string("r1"));

        let handle = tokio::spawn(logger.run(bus.clone(), cancel.clone()));
        // Let the logger subscribe.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let run_id = RunId::from_string("r1");
        bus.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            entry_node: "extract".into(),
        });
        bus.publish(node_completed(&run_id));
        bus.publish(RunEvent::RunCompleted {
            run_id: run_id.clone(),
            steps: 1,
            quality_score: 0.9,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(types, vec!["run_started", "node_completed", "run_completed"]);
    }

    #[tokio::test]
    async fn test_closed_writers_reopen_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let run_id = RunId::from_string("r2");
        let line = logger.event_to_line(&node_completed(&run_id)).unwrap();
        let mut writers = HashMap::new();

        logger.write_line(&mut writers, &run_id, &line).await;
        assert_eq!(writers.len(), 1);
        close_all(&mut writers).await;
        assert!(writers.is_empty());

        logger.write_line(&mut writers, &run_id, &line).await;
        close_all(&mut writers).await;

        let content = std::fs::read_to_string(logger.trace_path(&run_id)).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_lag_does_not_stop_the_logger() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(2));
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 1);
        let path = logger.trace_path(&RunId::from_string("late"));

        let handle = tokio::spawn(logger.run(bus.clone(), cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Overrun the buffer before the logger gets scheduled.
        for i in 0..10 {
            bus.publish(RunEvent::RunStarted {
                run_id: RunId::from_string(&format!("burst{}", i)),
                entry_node: "a".into(),
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.publish(RunEvent::RunStarted {
            run_id: RunId::from_string("late"),
            entry_node: "a".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
