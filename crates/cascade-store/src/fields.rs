use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};

use cascade_core::error::Result;
use cascade_core::traits::FieldStore;
use cascade_core::types::{format_ts, parse_ts, FieldRecord};

use crate::{db_err, json_col, SqliteStore};

fn row_to_field(row: &Row<'_>) -> rusqlite::Result<FieldRecord> {
    let value_json: String = row.get(3)?;
    let require: i64 = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(FieldRecord {
        entity_id: row.get(0)?,
        domain: row.get(1)?,
        field_key: row.get(2)?,
        value: json_col(3, &value_json)?,
        require_approval_create: require != 0,
        updated_at: parse_ts(&updated_at),
    })
}

/// Last-write-wins upsert that keeps an existing approval policy. Shared with
/// change approval so both paths write fields the same way.
pub(crate) fn upsert_value(
    conn: &Connection,
    entity_id: &str,
    domain: &str,
    field_key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<usize> {
    let value_json = value.to_string();
    conn.execute(
        "INSERT INTO master_fields (entity_id, domain, field_key, value_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(entity_id, domain, field_key) DO UPDATE SET
             value_json = excluded.value_json,
             updated_at = excluded.updated_at",
        params![entity_id, domain, field_key, value_json, format_ts(Utc::now())],
    )
}

pub(crate) fn delete_value(
    conn: &Connection,
    entity_id: &str,
    domain: &str,
    field_key: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM master_fields WHERE entity_id = ?1 AND domain = ?2 AND field_key = ?3",
        params![entity_id, domain, field_key],
    )
}

impl FieldStore for SqliteStore {
    fn get_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
    ) -> BoxFuture<'_, Result<Option<FieldRecord>>> {
        let entity_id = entity_id.to_string();
        let domain = domain.to_string();
        let field_key = field_key.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT entity_id, domain, field_key, value_json, require_approval_create, updated_at
                 FROM master_fields
                 WHERE entity_id = ?1 AND domain = ?2 AND field_key = ?3",
                params![entity_id, domain, field_key],
                row_to_field,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn write_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>> {
        let entity_id = entity_id.to_string();
        let domain = domain.to_string();
        let field_key = field_key.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            upsert_value(&conn, &entity_id, &domain, &field_key, &value).map_err(db_err)?;
            Ok(())
        })
    }

    fn put_field(&self, record: &FieldRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO master_fields
                     (entity_id, domain, field_key, value_json, require_approval_create, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.entity_id,
                    record.domain,
                    record.field_key,
                    record.value.to_string(),
                    record.require_approval_create as i64,
                    format_ts(record.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn delete_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
    ) -> BoxFuture<'_, Result<bool>> {
        let entity_id = entity_id.to_string();
        let domain = domain.to_string();
        let field_key = field_key.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let deleted = delete_value(&conn, &entity_id, &domain, &field_key).map_err(db_err)?;
            Ok(deleted > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn last_write_wins() {
        let store = SqliteStore::in_memory().unwrap();
        store.write_field("acme", "company", "ceo", json!("Ann")).await.unwrap();
        store.write_field("acme", "company", "ceo", json!("Bob")).await.unwrap();

        let field = store.get_field("acme", "company", "ceo").await.unwrap().unwrap();
        assert_eq!(field.value, json!("Bob"));
        assert!(field.require_approval_create);
    }

    #[tokio::test]
    async fn write_keeps_approval_policy() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put_field(&FieldRecord {
                entity_id: "acme".into(),
                domain: "company".into(),
                field_key: "hq".into(),
                value: json!("Berlin"),
                require_approval_create: false,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store.write_field("acme", "company", "hq", json!("Paris")).await.unwrap();

        let field = store.get_field("acme", "company", "hq").await.unwrap().unwrap();
        assert_eq!(field.value, json!("Paris"));
        assert!(!field.require_approval_create);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = SqliteStore::in_memory().unwrap();
        store.write_field("acme", "company", "ceo", json!("Ann")).await.unwrap();
        assert!(store.delete_field("acme", "company", "ceo").await.unwrap());
        assert!(!store.delete_field("acme", "company", "ceo").await.unwrap());
        assert!(store.get_field("acme", "company", "ceo").await.unwrap().is_none());
    }
}
