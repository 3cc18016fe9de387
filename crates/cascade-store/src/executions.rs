use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Row};

use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::ExecutionStore;
use cascade_core::types::{format_ts, parse_ts, NodeExecutionRecord, NodeKey, NodeStatus};

use crate::{db_err, json_col, parse_col, SqliteStore};

const EXEC_COLUMNS: &str = "entity_id, workflow_id, node_id, status, output_json, content_hash, \
                            version, error_message, updated_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<NodeExecutionRecord> {
    let status: String = row.get(3)?;
    let output_json: Option<String> = row.get(4)?;
    let version: i64 = row.get(6)?;
    let updated_at: String = row.get(8)?;
    Ok(NodeExecutionRecord {
        key: NodeKey::new(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ),
        status: parse_col(3, &status)?,
        output: output_json.map(|raw| json_col(4, &raw)).transpose()?,
        content_hash: row.get(5)?,
        version: version.max(0) as u64,
        error_message: row.get(7)?,
        updated_at: parse_ts(&updated_at),
    })
}

impl ExecutionStore for SqliteStore {
    fn get_execution(&self, key: &NodeKey) -> BoxFuture<'_, Result<Option<NodeExecutionRecord>>> {
        let key = key.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM node_executions
                     WHERE entity_id = ?1 AND workflow_id = ?2 AND node_id = ?3",
                    EXEC_COLUMNS
                ),
                params![key.entity_id, key.workflow_id, key.node_id],
                row_to_execution,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn commit_execution(
        &self,
        record: &NodeExecutionRecord,
        expected_version: u64,
    ) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let output = record
                .output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = self.lock()?;

            // Compare-and-set on version: a concurrent writer that already
            // bumped the record makes this a no-op.
            let changed = if expected_version == 0 {
                conn.execute(
                    "INSERT INTO node_executions (entity_id, workflow_id, node_id, status, output_json,
                                                  content_hash, version, error_message, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(entity_id, workflow_id, node_id) DO UPDATE SET
                         status = excluded.status,
                         output_json = excluded.output_json,
                         content_hash = excluded.content_hash,
                         version = excluded.version,
                         error_message = excluded.error_message,
                         updated_at = excluded.updated_at
                     WHERE node_executions.version = 0",
                    params![
                        record.key.entity_id,
                        record.key.workflow_id,
                        record.key.node_id,
                        record.status.as_str(),
                        output,
                        record.content_hash,
                        record.version as i64,
                        record.error_message,
                        format_ts(record.updated_at),
                    ],
                )
            } else {
                conn.execute(
                    "UPDATE node_executions
                     SET status = ?4, output_json = ?5, content_hash = ?6, version = ?7,
                         error_message = ?8, updated_at = ?9
                     WHERE entity_id = ?1 AND workflow_id = ?2 AND node_id = ?3
                       AND version = ?10",
                    params![
                        record.key.entity_id,
                        record.key.workflow_id,
                        record.key.node_id,
                        record.status.as_str(),
                        output,
                        record.content_hash,
                        record.version as i64,
                        record.error_message,
                        format_ts(record.updated_at),
                        expected_version as i64,
                    ],
                )
            }
            .map_err(db_err)?;

            if changed == 0 {
                return Err(CascadeError::VersionConflict {
                    node_id: record.key.node_id,
                    expected: expected_version,
                });
            }
            Ok(())
        })
    }

    fn set_execution_status(
        &self,
        key: &NodeKey,
        status: NodeStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO node_executions (entity_id, workflow_id, node_id, status,
                                              error_message, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                 ON CONFLICT(entity_id, workflow_id, node_id) DO UPDATE SET
                     status = excluded.status,
                     error_message = excluded.error_message,
                     updated_at = excluded.updated_at",
                params![
                    key.entity_id,
                    key.workflow_id,
                    key.node_id,
                    status.as_str(),
                    error_message,
                    format_ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_node_executions(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> BoxFuture<'_, Result<Vec<NodeExecutionRecord>>> {
        let workflow_id = workflow_id.to_string();
        let node_id = node_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM node_executions
                     WHERE workflow_id = ?1 AND node_id = ?2
                     ORDER BY entity_id",
                    EXEC_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![workflow_id, node_id], row_to_execution)
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(db_err)?);
            }
            Ok(records)
        })
    }
}
