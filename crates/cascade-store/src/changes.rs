use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Row};

use cascade_core::error::Result;
use cascade_core::traits::ChangeStore;
use cascade_core::types::{
    format_ts, parse_ts, ChangeAction, ChangeStatus, PendingChange, SubmitOutcome,
};

use crate::fields::{delete_value, upsert_value};
use crate::{db_err, json_col, parse_col, SqliteStore};

const CHANGE_COLUMNS: &str = "change_id, entity_id, node_id, target_domain, target_path, action, \
                              proposed_json, status, created_at, resolved_at, resolved_by";

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
    let action: String = row.get(5)?;
    let proposed: String = row.get(6)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let resolved_at: Option<String> = row.get(9)?;
    Ok(PendingChange {
        change_id: row.get(0)?,
        entity_id: row.get(1)?,
        node_id: row.get(2)?,
        target_domain: row.get(3)?,
        target_path: row.get(4)?,
        action: parse_col(5, &action)?,
        proposed_value: json_col(6, &proposed)?,
        status: parse_col(7, &status)?,
        created_at: parse_ts(&created_at),
        resolved_at: resolved_at.as_deref().map(parse_ts),
        resolved_by: row.get(10)?,
    })
}

impl ChangeStore for SqliteStore {
    fn submit_change(&self, change: &PendingChange) -> BoxFuture<'_, Result<SubmitOutcome>> {
        let change = change.clone();

        Box::pin(async move {
            let proposed = change.proposed_value.to_string();
            let conn = self.lock()?;

            let existing = conn
                .query_row(
                    "SELECT id, target_domain, target_path, action, proposed_json
                     FROM ssot_pending_changes
                     WHERE entity_id = ?1 AND node_id = ?2 AND change_id = ?3
                       AND status = 'pending'",
                    params![change.entity_id, change.node_id, change.change_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            match existing {
                Some((id, domain, path, action, old_proposed)) => {
                    let same_value = serde_json::from_str::<serde_json::Value>(&old_proposed)
                        .map(|v| v == change.proposed_value)
                        .unwrap_or(false);
                    if same_value
                        && domain == change.target_domain
                        && path == change.target_path
                        && action == change.action.as_str()
                    {
                        return Ok(SubmitOutcome::Duplicate);
                    }
                    conn.execute(
                        "UPDATE ssot_pending_changes
                         SET target_domain = ?1, target_path = ?2, action = ?3, proposed_json = ?4
                         WHERE id = ?5",
                        params![
                            change.target_domain,
                            change.target_path,
                            change.action.as_str(),
                            proposed,
                            id
                        ],
                    )
                    .map_err(db_err)?;
                    Ok(SubmitOutcome::Updated)
                }
                None => {
                    conn.execute(
                        "INSERT INTO ssot_pending_changes
                             (change_id, entity_id, node_id, target_domain, target_path, action,
                              proposed_json, status, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
                        params![
                            change.change_id,
                            change.entity_id,
                            change.node_id,
                            change.target_domain,
                            change.target_path,
                            change.action.as_str(),
                            proposed,
                            format_ts(change.created_at),
                        ],
                    )
                    .map_err(db_err)?;
                    Ok(SubmitOutcome::Created)
                }
            }
        })
    }

    fn get_change(
        &self,
        entity_id: &str,
        change_id: &str,
    ) -> BoxFuture<'_, Result<Option<PendingChange>>> {
        let entity_id = entity_id.to_string();
        let change_id = change_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM ssot_pending_changes
                     WHERE entity_id = ?1 AND change_id = ?2
                     ORDER BY (status = 'pending') DESC, id DESC
                     LIMIT 1",
                    CHANGE_COLUMNS
                ),
                params![entity_id, change_id],
                row_to_change,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_changes(
        &self,
        status: Option<ChangeStatus>,
        entity_id: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<PendingChange>>> {
        let status = status.map(|s| s.as_str().to_string());
        let entity_id = entity_id.map(str::to_string);

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM ssot_pending_changes
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR entity_id = ?2)
                     ORDER BY created_at ASC, id ASC",
                    CHANGE_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![status, entity_id], row_to_change)
                .map_err(db_err)?;

            let mut changes = Vec::new();
            for row in rows {
                changes.push(row.map_err(db_err)?);
            }
            Ok(changes)
        })
    }

    fn approve_change(
        &self,
        change: &PendingChange,
        resolved_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        let change = change.clone();
        let resolved_by = resolved_by.to_string();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;

            let changed = tx
                .execute(
                    "UPDATE ssot_pending_changes
                     SET status = 'approved', resolved_at = ?1, resolved_by = ?2
                     WHERE entity_id = ?3 AND node_id = ?4 AND change_id = ?5
                       AND status = 'pending'",
                    params![
                        format_ts(resolved_at),
                        resolved_by,
                        change.entity_id,
                        change.node_id,
                        change.change_id
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                // Dropping the transaction rolls back
                return Ok(false);
            }

            match change.action {
                ChangeAction::Delete => {
                    delete_value(&tx, &change.entity_id, &change.target_domain, &change.target_path)
                        .map_err(db_err)?;
                }
                ChangeAction::Create | ChangeAction::Update => {
                    upsert_value(
                        &tx,
                        &change.entity_id,
                        &change.target_domain,
                        &change.target_path,
                        &change.proposed_value,
                    )
                    .map_err(db_err)?;
                }
            }

            tx.commit().map_err(db_err)?;
            Ok(true)
        })
    }

    fn reject_change(
        &self,
        change: &PendingChange,
        resolved_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        let change = change.clone();
        let resolved_by = resolved_by.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE ssot_pending_changes
                     SET status = 'rejected', resolved_at = ?1, resolved_by = ?2
                     WHERE entity_id = ?3 AND node_id = ?4 AND change_id = ?5
                       AND status = 'pending'",
                    params![
                        format_ts(resolved_at),
                        resolved_by,
                        change.entity_id,
                        change.node_id,
                        change.change_id
                    ],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::traits::FieldStore;
    use serde_json::json;

    fn change(id: &str, value: serde_json::Value) -> PendingChange {
        PendingChange {
            change_id: id.into(),
            entity_id: "acme".into(),
            node_id: "gen".into(),
            target_domain: "company".into(),
            target_path: "company.leadership.ceo.name".into(),
            action: ChangeAction::Update,
            proposed_value: value,
            status: ChangeStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    #[tokio::test]
    async fn submit_deduplicates_pending_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let c = change("c1", json!("Ann"));
        assert_eq!(store.submit_change(&c).await.unwrap(), SubmitOutcome::Created);
        assert_eq!(store.submit_change(&c).await.unwrap(), SubmitOutcome::Duplicate);
        assert_eq!(
            store.submit_change(&change("c1", json!("Bob"))).await.unwrap(),
            SubmitOutcome::Updated
        );

        let pending = store
            .list_changes(Some(ChangeStatus::Pending), None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].proposed_value, json!("Bob"));
    }

    #[tokio::test]
    async fn approve_commits_field_atomically() {
        let store = SqliteStore::in_memory().unwrap();
        let c = change("c1", json!("Ann"));
        store.submit_change(&c).await.unwrap();

        assert!(store.approve_change(&c, "reviewer", Utc::now()).await.unwrap());
        // Second approval is a no-op
        assert!(!store.approve_change(&c, "reviewer", Utc::now()).await.unwrap());

        let field = store
            .get_field("acme", "company", "company.leadership.ceo.name")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(field.value, json!("Ann"));

        let resolved = store.get_change("acme", "c1").await.unwrap().unwrap();
        assert_eq!(resolved.status, ChangeStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("reviewer"));
    }

    #[tokio::test]
    async fn reject_leaves_field_untouched() {
        let store = SqliteStore::in_memory().unwrap();
        let c = change("c1", json!("Ann"));
        store.submit_change(&c).await.unwrap();
        assert!(store.reject_change(&c, "reviewer", Utc::now()).await.unwrap());
        assert!(!store.approve_change(&c, "reviewer", Utc::now()).await.unwrap());

        assert!(store
            .get_field("acme", "company", "company.leadership.ceo.name")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resubmit_after_resolution_creates_new_row() {
        let store = SqliteStore::in_memory().unwrap();
        let c = change("c1", json!("Ann"));
        store.submit_change(&c).await.unwrap();
        store.reject_change(&c, "reviewer", Utc::now()).await.unwrap();

        assert_eq!(store.submit_change(&c).await.unwrap(), SubmitOutcome::Created);
        let current = store.get_change("acme", "c1").await.unwrap().unwrap();
        assert_eq!(current.status, ChangeStatus::Pending);
        assert_eq!(store.list_changes(None, Some("acme")).await.unwrap().len(), 2);
        assert!(store.list_changes(None, Some("globex")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approved_delete_removes_field() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .write_field("acme", "company", "company.leadership.ceo.name", json!("Ann"))
            .await
            .unwrap();
        let mut c = change("c2", json!(null));
        c.action = ChangeAction::Delete;
        store.submit_change(&c).await.unwrap();
        assert!(store.approve_change(&c, "reviewer", Utc::now()).await.unwrap());
        assert!(store
            .get_field("acme", "company", "company.leadership.ceo.name")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn same_change_id_is_scoped_per_entity() {
        let store = SqliteStore::in_memory().unwrap();
        let acme = change("c1", json!("Ann"));
        let mut globex = change("c1", json!("Gus"));
        globex.entity_id = "globex".into();

        assert_eq!(store.submit_change(&acme).await.unwrap(), SubmitOutcome::Created);
        assert_eq!(store.submit_change(&globex).await.unwrap(), SubmitOutcome::Created);

        let acme_row = store.get_change("acme", "c1").await.unwrap().unwrap();
        assert_eq!(acme_row.proposed_value, json!("Ann"));
        let globex_row = store.get_change("globex", "c1").await.unwrap().unwrap();
        assert_eq!(globex_row.proposed_value, json!("Gus"));

        assert!(store.approve_change(&globex, "reviewer", Utc::now()).await.unwrap());
        let field = store
            .get_field("globex", "company", "company.leadership.ceo.name")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(field.value, json!("Gus"));
        assert!(store
            .get_field("acme", "company", "company.leadership.ceo.name")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.get_change("acme", "c1").await.unwrap().unwrap().status,
            ChangeStatus::Pending
        );
    }
}
