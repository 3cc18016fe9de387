use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cascade_core::error::Result;
use cascade_core::event::EventBus;
use cascade_core::traits::RunRecordStore;
use cascade_core::types::{
    CascadeEvent, CascadeRun, EntityRunRecord, RecordStatus, RunId, RunStatus,
};

/// Owns the in-memory run state of one cascade.
///
/// Every transition is published on the event bus and mirrored into the
/// durable run record. Only the scheduling loop holds a reporter, so run
/// state has a single writer.
pub struct ProgressReporter {
    run: CascadeRun,
    created_at: DateTime<Utc>,
    runs: Arc<dyn RunRecordStore>,
    event_bus: Arc<EventBus>,
}

impl ProgressReporter {
    pub fn new(run: CascadeRun, runs: Arc<dyn RunRecordStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            run,
            created_at: Utc::now(),
            runs,
            event_bus,
        }
    }

    pub fn run(&self) -> &CascadeRun {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    pub fn into_run(self) -> CascadeRun {
        self.run
    }

    /// Persist the initial record and announce the run.
    pub async fn start(&mut self) -> Result<()> {
        self.persist().await?;
        self.event_bus.publish(CascadeEvent::RunStarted {
            run_id: self.run.run_id.clone(),
            entity_id: self.run.entity_id.clone(),
            workflow_id: self.run.workflow_id.clone(),
            total: self.run.total_count,
        });
        Ok(())
    }

    /// Mirror the run into its durable record. Returns false when the record
    /// was already moved to a terminal status by someone else.
    pub async fn persist(&self) -> Result<bool> {
        self.save(None).await
    }

    async fn save(&self, error_message: Option<String>) -> Result<bool> {
        let mut record = EntityRunRecord::from_run(&self.run, error_message);
        record.created_at = self.created_at;
        let saved = self.runs.save_run(&record).await?;
        if !saved {
            debug!(run_id = %self.run.run_id, "Run record already terminal");
        }
        Ok(saved)
    }

    /// Terminal status set outside this run (cancel or direct fail), if any.
    pub async fn external_status(&self) -> Result<Option<RecordStatus>> {
        Ok(self
            .runs
            .get_run(&self.run.run_id)
            .await?
            .map(|r| r.status)
            .filter(|s| s.is_terminal()))
    }

    pub fn node_started(&mut self, node_id: &str, label: &str) {
        self.run.executing_node_ids.push(node_id.to_string());
        self.run.current_node_label = Some(label.to_string());
        self.event_bus.publish(CascadeEvent::NodeStarted {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
            label: label.to_string(),
        });
    }

    fn complete(&mut self, node_id: &str) {
        self.run.executing_node_ids.retain(|id| id != node_id);
        self.run.completed_node_ids.push(node_id.to_string());
        self.run.completed_count += 1;
    }

    pub fn node_cached(&mut self, node_id: &str) {
        self.complete(node_id);
        self.run.cached_count += 1;
        self.event_bus.publish(CascadeEvent::NodeCached {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
        });
    }

    pub fn node_completed(&mut self, node_id: &str, version: u64, elapsed_ms: u64) {
        self.complete(node_id);
        self.run.executed_count += 1;
        self.event_bus.publish(CascadeEvent::NodeCompleted {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
            version,
            elapsed_ms,
        });
    }

    /// The first failure is the one reported as `failed_node_id`.
    pub fn node_failed(&mut self, node_id: &str, error: &str) {
        self.run.executing_node_ids.retain(|id| id != node_id);
        if self.run.failed_node_id.is_none() {
            self.run.failed_node_id = Some(node_id.to_string());
        }
        self.event_bus.publish(CascadeEvent::NodeFailed {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn node_skipped(&mut self, node_id: &str, blocked_by: &str) {
        self.run.skipped_node_ids.push(node_id.to_string());
        self.event_bus.publish(CascadeEvent::NodeSkipped {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
            blocked_by: blocked_by.to_string(),
        });
    }

    /// An in-flight result that arrived after cancellation.
    pub fn node_discarded(&mut self, node_id: &str) {
        self.run.executing_node_ids.retain(|id| id != node_id);
        self.event_bus.publish(CascadeEvent::NodeDiscarded {
            run_id: self.run.run_id.clone(),
            node_id: node_id.to_string(),
        });
    }

    /// Close the run. Unless the record was already made terminal elsewhere,
    /// the given status and message are persisted. The status actually on
    /// record is returned.
    pub async fn finish(&mut self, status: RunStatus, message: &str) -> Result<RunStatus> {
        self.run.status = status;
        self.run.executing_node_ids.clear();
        self.run.current_node_label = None;

        // Progress and terminal status land in one conditional write
        let error = match status {
            RunStatus::Completed => None,
            _ => Some(message.to_string()),
        };
        if !self.save(error).await? {
            if let Some(existing) = self.external_status().await? {
                let on_record = match existing {
                    RecordStatus::Cancelled => RunStatus::Cancelled,
                    RecordStatus::Completed => RunStatus::Completed,
                    _ => RunStatus::Failed,
                };
                if on_record != status {
                    warn!(
                        run_id = %self.run.run_id,
                        wanted = %status,
                        on_record = %on_record,
                        "Run already closed externally"
                    );
                }
                self.run.status = on_record;
            }
        }

        self.event_bus.publish(CascadeEvent::RunFinished {
            run_id: self.run.run_id.clone(),
            status: self.run.status,
            message: message.to_string(),
        });
        Ok(self.run.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_store::SqliteStore;

    fn reporter(store: Arc<SqliteStore>) -> ProgressReporter {
        let run = CascadeRun::new(RunId::from_string("run-1"), "acme", "wf", "a", 3);
        ProgressReporter::new(run, store, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn transitions_are_mirrored() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut progress = reporter(store.clone());
        progress.start().await.unwrap();

        progress.node_started("a", "A");
        progress.node_completed("a", 1, 12);
        progress.node_cached("b");
        progress.node_failed("c", "boom");
        progress.persist().await.unwrap();

        let record = store.get_run(progress.run_id()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processing);
        assert_eq!(record.progress.current, 2);
        assert_eq!(record.progress.completed_nodes, vec!["a", "b"]);
        assert_eq!(record.progress.failed_at_node.as_deref(), Some("c"));
        assert_eq!(record.progress.cached, 1);
        assert_eq!(record.progress.executed, 1);

        let status = progress.finish(RunStatus::Failed, "c failed").await.unwrap();
        assert_eq!(status, RunStatus::Failed);
        let record = store.get_run(progress.run_id()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("c failed"));
    }

    #[tokio::test]
    async fn external_terminal_status_wins() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut progress = reporter(store.clone());
        progress.start().await.unwrap();

        store
            .finish_run(progress.run_id(), RecordStatus::Cancelled, None)
            .await
            .unwrap();
        assert!(!progress.persist().await.unwrap());
        assert_eq!(
            progress.external_status().await.unwrap(),
            Some(RecordStatus::Cancelled)
        );

        let status = progress.finish(RunStatus::Completed, "done").await.unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        let record = store.get_run(progress.run_id()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Cancelled);
    }
}
