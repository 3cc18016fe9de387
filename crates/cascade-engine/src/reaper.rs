use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cascade_core::config::ReaperConfig;
use cascade_core::error::Result;
use cascade_core::event::EventBus;
use cascade_core::traits::RunRecordStore;
use cascade_core::types::{CascadeEvent, RunId};

/// Periodic sweep that fails run records left in pending or processing.
///
/// Works only on durable state, so it recovers runs whose orchestrator
/// crashed or was closed, from any process.
pub struct StalenessReaper {
    config: ReaperConfig,
    runs: Arc<dyn RunRecordStore>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl StalenessReaper {
    pub fn new(
        config: ReaperConfig,
        runs: Arc<dyn RunRecordStore>,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runs,
            event_bus,
            cancel,
        }
    }

    /// "Marked as failed: stuck in processing for over N minutes". Falls
    /// back to seconds for thresholds that bypassed config validation.
    pub fn message(&self) -> String {
        let secs = self.config.stale_after_secs;
        if secs >= 60 && secs % 60 == 0 {
            format!(
                "Marked as failed: stuck in processing for over {} minutes",
                secs / 60
            )
        } else {
            format!(
                "Marked as failed: stuck in processing for over {} seconds",
                secs
            )
        }
    }

    /// Run the sweep loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            interval_secs = self.config.interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            "Staleness reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Staleness reaper shutting down");
                    break;
                }
            }

            if let Err(e) = self.sweep(Utc::now()).await {
                error!(error = %e, "Reaper sweep failed");
            }
        }
    }

    /// Fail every active run not touched since `now - stale_after`. Returns
    /// the runs that were reaped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let cutoff = now - chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let message = self.message();
        let mut reaped = Vec::new();

        for record in self.runs.list_active_runs().await? {
            if record.updated_at >= cutoff {
                continue;
            }
            // Conditional: a run that made progress since the listing survives
            if self.runs.fail_if_stale(&record.run_id, cutoff, &message).await? {
                warn!(
                    run_id = %record.run_id,
                    entity_id = %record.entity_id,
                    updated_at = %record.updated_at,
                    "Reaped stale run"
                );
                self.event_bus.publish(CascadeEvent::RunReaped {
                    run_id: record.run_id.clone(),
                });
                reaped.push(record.run_id);
            }
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaper sweep complete");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::types::RecordStatus;
    use cascade_store::SqliteStore;
    use cascade_test_utils::run_record;

    fn reaper(store: Arc<SqliteStore>) -> StalenessReaper {
        StalenessReaper::new(
            ReaperConfig::default(),
            store,
            Arc::new(EventBus::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn reaps_only_stale_runs() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_run(&run_record("old", "acme", 11)).await.unwrap();
        store.save_run(&run_record("fresh", "acme", 9)).await.unwrap();

        let reaped = reaper(store.clone()).sweep(Utc::now()).await.unwrap();
        assert_eq!(reaped, vec![RunId::from_string("old")]);

        let old = store.get_run(&RunId::from_string("old")).await.unwrap().unwrap();
        assert_eq!(old.status, RecordStatus::Failed);
        assert_eq!(
            old.error_message.as_deref(),
            Some("Marked as failed: stuck in processing for over 10 minutes")
        );
        let fresh = store.get_run(&RunId::from_string("fresh")).await.unwrap().unwrap();
        assert_eq!(fresh.status, RecordStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_runs_are_left_alone() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut done = run_record("done", "acme", 60);
        done.status = RecordStatus::Completed;
        store.save_run(&done).await.unwrap();

        assert!(reaper(store.clone()).sweep(Utc::now()).await.unwrap().is_empty());
        let done = store.get_run(&RunId::from_string("done")).await.unwrap().unwrap();
        assert_eq!(done.status, RecordStatus::Completed);
    }

    #[test]
    fn message_never_truncates_the_threshold() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        assert_eq!(
            reaper(store.clone()).message(),
            "Marked as failed: stuck in processing for over 10 minutes"
        );
        let odd = StalenessReaper::new(
            ReaperConfig {
                stale_after_secs: 90,
                ..ReaperConfig::default()
            },
            store,
            Arc::new(EventBus::default()),
            CancellationToken::new(),
        );
        assert_eq!(
            odd.message(),
            "Marked as failed: stuck in processing for over 90 seconds"
        );
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cancel = CancellationToken::new();
        let reaper = StalenessReaper::new(
            ReaperConfig::default(),
            store,
            Arc::new(EventBus::default()),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), reaper.run())
            .await
            .unwrap();
    }
}
