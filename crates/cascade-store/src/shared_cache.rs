use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Row};

use cascade_core::error::Result;
use cascade_core::traits::SharedCacheStore;
use cascade_core::types::{format_ts, parse_ts, NodeKey, SharedCache, SharedCacheEntry};

use crate::{db_err, json_col, SqliteStore};

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<SharedCacheEntry> {
    let data_json: String = row.get(4)?;
    let version: i64 = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(SharedCacheEntry {
        cache_id: row.get(0)?,
        entity_id: row.get(1)?,
        workflow_id: row.get(2)?,
        node_id: row.get(3)?,
        data: json_col(4, &data_json)?,
        content_hash: row.get(5)?,
        version: version.max(0) as u64,
        updated_at: parse_ts(&updated_at),
    })
}

impl SharedCacheStore for SqliteStore {
    fn ensure_cache(&self, cache: &SharedCache) -> BoxFuture<'_, Result<()>> {
        let cache = cache.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO shared_caches (cache_id, name) VALUES (?1, ?2)
                 ON CONFLICT(cache_id) DO UPDATE SET name = excluded.name",
                params![cache.cache_id, cache.name],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn upsert_entry(&self, entry: &SharedCacheEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO shared_caches (cache_id, name) VALUES (?1, ?1)",
                params![entry.cache_id],
            )
            .map_err(db_err)?;
            conn.execute(
                "INSERT INTO shared_cache_data (cache_id, entity_id, workflow_id, node_id,
                                                data_json, content_hash, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(cache_id, entity_id, workflow_id, node_id) DO UPDATE SET
                     data_json = excluded.data_json,
                     content_hash = excluded.content_hash,
                     version = excluded.version,
                     updated_at = excluded.updated_at",
                params![
                    entry.cache_id,
                    entry.entity_id,
                    entry.workflow_id,
                    entry.node_id,
                    entry.data.to_string(),
                    entry.content_hash,
                    entry.version as i64,
                    format_ts(entry.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_entry(
        &self,
        cache_id: &str,
        key: &NodeKey,
    ) -> BoxFuture<'_, Result<Option<SharedCacheEntry>>> {
        let cache_id = cache_id.to_string();
        let key = key.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT cache_id, entity_id, workflow_id, node_id, data_json, content_hash,
                        version, updated_at
                 FROM shared_cache_data
                 WHERE cache_id = ?1 AND entity_id = ?2 AND workflow_id = ?3 AND node_id = ?4",
                params![cache_id, key.entity_id, key.workflow_id, key.node_id],
                row_to_entry,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_entries(&self, cache_id: &str) -> BoxFuture<'_, Result<Vec<SharedCacheEntry>>> {
        let cache_id = cache_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT cache_id, entity_id, workflow_id, node_id, data_json, content_hash,
                            version, updated_at
                     FROM shared_cache_data
                     WHERE cache_id = ?1
                     ORDER BY entity_id, workflow_id, node_id",
                )
                .map_err(db_err)?;
            let rows = stmt.query_map(params![cache_id], row_to_entry).map_err(db_err)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(db_err)?);
            }
            Ok(entries)
        })
    }
}
