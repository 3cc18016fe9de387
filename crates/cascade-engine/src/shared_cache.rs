use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use cascade_core::error::Result;
use cascade_core::graph::WorkflowGraph;
use cascade_core::traits::{ExecutionStore, SharedCacheStore};
use cascade_core::types::{NodeStatus, SharedCache, SharedCacheEntry};

/// On-demand bulk sync of shared caches from the execution records of the
/// nodes that publish into them.
pub struct SharedCacheSync {
    executions: Arc<dyn ExecutionStore>,
    shared: Arc<dyn SharedCacheStore>,
}

impl SharedCacheSync {
    pub fn new(executions: Arc<dyn ExecutionStore>, shared: Arc<dyn SharedCacheStore>) -> Self {
        Self { executions, shared }
    }

    /// Re-upsert the latest succeeded output of every producer of `cache_ids`
    /// across `workflows`. Returns entries written per cache.
    pub async fn sync(
        &self,
        cache_ids: &[String],
        workflows: &[WorkflowGraph],
    ) -> Result<BTreeMap<String, usize>> {
        let mut written = BTreeMap::new();

        for cache_id in cache_ids {
            self.shared
                .ensure_cache(&SharedCache {
                    cache_id: cache_id.clone(),
                    name: cache_id.clone(),
                })
                .await?;

            let mut count = 0;
            for workflow in workflows {
                let producers = workflow
                    .nodes
                    .iter()
                    .filter(|n| n.shared_cache_outputs.iter().any(|c| c == cache_id));

                for node in producers {
                    let records = self
                        .executions
                        .list_node_executions(&workflow.id, &node.id)
                        .await?;
                    for record in records {
                        if record.status != NodeStatus::Succeeded {
                            continue;
                        }
                        let Some(data) = record.output else { continue };
                        self.shared
                            .upsert_entry(&SharedCacheEntry {
                                cache_id: cache_id.clone(),
                                entity_id: record.key.entity_id,
                                workflow_id: record.key.workflow_id,
                                node_id: record.key.node_id,
                                data,
                                content_hash: record.content_hash.unwrap_or_default(),
                                version: record.version,
                                updated_at: record.updated_at,
                            })
                            .await?;
                        count += 1;
                    }
                }
            }

            info!(cache_id = %cache_id, entries = count, "Shared cache synced");
            written.insert(cache_id.clone(), count);
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::graph::{NodeKind, WorkflowNode};
    use cascade_core::types::{NodeExecutionRecord, NodeKey};
    use cascade_store::SqliteStore;
    use serde_json::json;

    async fn seed(store: &SqliteStore, entity: &str, status: NodeStatus) {
        let mut rec = NodeExecutionRecord::new(NodeKey::new(entity, "wf", "gen"));
        rec.status = status;
        rec.output = Some(json!({"entity": entity}));
        rec.content_hash = Some(format!("hash-{}", entity));
        rec.version = 2;
        store.commit_execution(&rec, 0).await.unwrap();
    }

    #[tokio::test]
    async fn sync_copies_succeeded_producers_only() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        seed(&store, "acme", NodeStatus::Succeeded).await;
        seed(&store, "globex", NodeStatus::Failed).await;

        let wf = WorkflowGraph::new("wf")
            .with_node(WorkflowNode::new("gen", NodeKind::Generate).with_shared_cache("profiles"))
            .with_node(WorkflowNode::new("other", NodeKind::Transform));

        let sync = SharedCacheSync::new(store.clone(), store.clone());
        let written = sync
            .sync(&["profiles".to_string(), "empty".to_string()], &[wf])
            .await
            .unwrap();
        assert_eq!(written["profiles"], 1);
        assert_eq!(written["empty"], 0);

        let entries = store.list_entries("profiles").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, "acme");
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[0].content_hash, "hash-acme");
    }
}
