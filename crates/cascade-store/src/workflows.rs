use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension};

use cascade_core::error::Result;
use cascade_core::graph::WorkflowGraph;
use cascade_core::traits::WorkflowStore;
use cascade_core::types::format_ts;

use crate::{db_err, SqliteStore};

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, workflow: &WorkflowGraph) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();

        Box::pin(async move {
            let graph_json = serde_json::to_string(&workflow)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (workflow_id, name, graph_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workflow_id) DO UPDATE SET
                     name = excluded.name,
                     graph_json = excluded.graph_json,
                     updated_at = excluded.updated_at",
                params![workflow.id, workflow.name, graph_json, format_ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowGraph>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let raw: Option<String> = {
                let conn = self.lock()?;
                conn.query_row(
                    "SELECT graph_json FROM workflows WHERE workflow_id = ?1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };
            raw.map(|json| WorkflowGraph::from_json(&json)).transpose()
        })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowGraph>>> {
        Box::pin(async move {
            let raws: Vec<String> = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare("SELECT graph_json FROM workflows ORDER BY workflow_id")
                    .map_err(db_err)?;
                let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
                let mut raws = Vec::new();
                for row in rows {
                    raws.push(row.map_err(db_err)?);
                }
                raws
            };
            raws.iter().map(|json| WorkflowGraph::from_json(json)).collect()
        })
    }
}
