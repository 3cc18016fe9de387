use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Row};

use cascade_core::error::Result;
use cascade_core::traits::RunRecordStore;
use cascade_core::types::{format_ts, parse_ts, EntityRunRecord, RecordStatus, RunId, RunProgress};

use crate::{db_err, parse_col, SqliteStore};

const RUN_COLUMNS: &str = "run_id, entity_id, workflow_id, start_node_id, status, progress_json, \
                           error_message, created_at, updated_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<EntityRunRecord> {
    let status: String = row.get(4)?;
    let progress_json: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(EntityRunRecord {
        run_id: RunId(row.get(0)?),
        entity_id: row.get(1)?,
        workflow_id: row.get(2)?,
        start_node_id: row.get(3)?,
        status: parse_col(4, &status)?,
        progress: serde_json::from_str::<RunProgress>(&progress_json).unwrap_or_default(),
        error_message: row.get(6)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

impl RunRecordStore for SqliteStore {
    fn save_run(&self, record: &EntityRunRecord) -> BoxFuture<'_, Result<bool>> {
        let record = record.clone();

        Box::pin(async move {
            let progress = serde_json::to_string(&record.progress)?;
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "INSERT INTO entity_runs (run_id, entity_id, workflow_id, start_node_id, status,
                                              progress_json, error_message, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(run_id) DO UPDATE SET
                         status = excluded.status,
                         progress_json = excluded.progress_json,
                         error_message = excluded.error_message,
                         updated_at = excluded.updated_at
                     WHERE entity_runs.status IN ('pending', 'processing')",
                    params![
                        record.run_id.0,
                        record.entity_id,
                        record.workflow_id,
                        record.start_node_id,
                        record.status.as_str(),
                        progress,
                        record.error_message,
                        format_ts(record.created_at),
                        format_ts(record.updated_at),
                    ],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<EntityRunRecord>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM entity_runs WHERE run_id = ?1",
                    RUN_COLUMNS
                ))
                .map_err(db_err)?;
            let mut rows = stmt.query_map(params![run_id], row_to_run).map_err(db_err)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(db_err)?)),
                None => Ok(None),
            }
        })
    }

    fn list_runs(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<EntityRunRecord>>> {
        let entity_id = entity_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM entity_runs
                     WHERE entity_id = ?1
                     ORDER BY created_at DESC
                     LIMIT ?2",
                    RUN_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![entity_id, limit as i64], row_to_run)
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(db_err)?);
            }
            Ok(runs)
        })
    }

    fn list_active_runs(&self) -> BoxFuture<'_, Result<Vec<EntityRunRecord>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM entity_runs
                     WHERE status IN ('pending', 'processing')
                     ORDER BY updated_at ASC",
                    RUN_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt.query_map([], row_to_run).map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(db_err)?);
            }
            Ok(runs)
        })
    }

    fn finish_run(
        &self,
        run_id: &RunId,
        status: RecordStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE entity_runs
                     SET status = ?1,
                         error_message = COALESCE(?2, error_message),
                         updated_at = ?3
                     WHERE run_id = ?4 AND status IN ('pending', 'processing')",
                    params![status.as_str(), error_message, format_ts(Utc::now()), run_id],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn fail_if_stale(
        &self,
        run_id: &RunId,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.0.clone();
        let message = message.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE entity_runs
                     SET status = 'failed', error_message = ?1, updated_at = ?2
                     WHERE run_id = ?3
                       AND status IN ('pending', 'processing')
                       AND updated_at < ?4",
                    params![message, format_ts(Utc::now()), run_id, format_ts(cutoff)],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }
}
