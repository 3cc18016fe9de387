use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use cascade_core::error::Result;
use cascade_core::graph::WorkflowNode;
use cascade_core::traits::ExecutionStore;
use cascade_core::types::{NodeExecutionRecord, NodeKey, NodeStatus, ResolvedInputs};

/// Outcome of consulting the execution cache for one node.
#[derive(Debug, Clone)]
pub struct CacheProbe {
    pub key: NodeKey,
    pub hash: String,
    pub hit: bool,
    pub cached_output: Option<Value>,
    /// Version of the stored record (0 when none exists). A fresh result is
    /// committed as `previous_version + 1` guarded on this value.
    pub previous_version: u64,
    /// Status of the stored record before this attempt touched it.
    pub previous_status: Option<NodeStatus>,
}

/// Serialize with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 over the node kind, its config and the input values it consumes.
pub fn content_hash(node: &WorkflowNode, inputs: &ResolvedInputs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(&node.config).as_bytes());
    hasher.update([0u8]);
    for (name, value) in inputs {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(value).as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Content-addressed cache over the execution store.
pub struct ExecutionCache {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionCache {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Hash the node's inputs and compare against its stored record. Only a
    /// succeeded record with the same hash is a hit, and `force` never hits.
    pub async fn compute(
        &self,
        entity_id: &str,
        workflow_id: &str,
        node: &WorkflowNode,
        inputs: &ResolvedInputs,
        force: bool,
    ) -> Result<CacheProbe> {
        let key = NodeKey::new(entity_id, workflow_id, &node.id);
        let hash = content_hash(node, inputs);
        let existing = self.store.get_execution(&key).await?;

        let previous_version = existing.as_ref().map(|r| r.version).unwrap_or(0);
        let previous_status = existing.as_ref().map(|r| r.status);
        let cached_output = existing.and_then(|r| {
            let reusable = r.status == NodeStatus::Succeeded
                && r.content_hash.as_deref() == Some(hash.as_str());
            if reusable {
                r.output
            } else {
                None
            }
        });
        let hit = !force && cached_output.is_some();

        debug!(node = %key, hit, force, "Cache probe");
        Ok(CacheProbe {
            key,
            hash,
            hit,
            cached_output: if hit { cached_output } else { None },
            previous_version,
            previous_status,
        })
    }

    pub async fn mark_processing(&self, key: &NodeKey) -> Result<()> {
        self.store
            .set_execution_status(key, NodeStatus::Processing, None)
            .await
    }

    /// Record a fresh result as `previous_version + 1`. Fails with
    /// `VersionConflict` if another writer got there first.
    pub async fn commit(&self, probe: &CacheProbe, output: Value) -> Result<NodeExecutionRecord> {
        let record = NodeExecutionRecord {
            key: probe.key.clone(),
            status: NodeStatus::Succeeded,
            output: Some(output),
            content_hash: Some(probe.hash.clone()),
            version: probe.previous_version + 1,
            error_message: None,
            updated_at: Utc::now(),
        };
        self.store
            .commit_execution(&record, probe.previous_version)
            .await?;
        Ok(record)
    }

    /// Mark a failed attempt. Output, hash and version of the last success
    /// are kept so a retry with the same inputs is still a miss.
    pub async fn record_failure(&self, key: &NodeKey, message: &str) -> Result<()> {
        self.store
            .set_execution_status(key, NodeStatus::Failed, Some(message.to_string()))
            .await
    }

    /// Undo `mark_processing` for an attempt whose result was discarded.
    pub async fn restore(&self, probe: &CacheProbe) -> Result<()> {
        let status = probe.previous_status.unwrap_or(NodeStatus::Pending);
        self.store.set_execution_status(&probe.key, status, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::error::CascadeError;
    use cascade_core::graph::NodeKind;
    use cascade_store::SqliteStore;
    use serde_json::json;

    fn node() -> WorkflowNode {
        WorkflowNode::new("gen", NodeKind::Generate).with_config(json!({"prompt": "p", "t": 0.2}))
    }

    fn inputs(v: Value) -> ResolvedInputs {
        let mut map = ResolvedInputs::new();
        map.insert("a".into(), v);
        map
    }

    #[test]
    fn hash_is_deterministic_and_key_order_free() {
        let a = WorkflowNode::new("gen", NodeKind::Generate)
            .with_config(serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":1}}"#).unwrap());
        let b = WorkflowNode::new("gen", NodeKind::Generate)
            .with_config(serde_json::from_str(r#"{"y":{"a":1,"b":2},"x":1}"#).unwrap());
        let i = inputs(json!({"k": "v"}));
        assert_eq!(content_hash(&a, &i), content_hash(&a, &i));
        assert_eq!(content_hash(&a, &i), content_hash(&b, &i));
    }

    #[test]
    fn any_input_change_changes_hash() {
        let n = node();
        let base = content_hash(&n, &inputs(json!("hello")));
        assert_ne!(base, content_hash(&n, &inputs(json!("hellp"))));
        assert_ne!(base, content_hash(&n, &inputs(json!(["hello"]))));
        assert_ne!(base, content_hash(&n, &ResolvedInputs::new()));

        let other_kind = WorkflowNode::new("gen", NodeKind::Transform).with_config(n.config.clone());
        assert_ne!(base, content_hash(&other_kind, &inputs(json!("hello"))));

        let other_config = n.clone().with_config(json!({"prompt": "p", "t": 0.3}));
        assert_ne!(base, content_hash(&other_config, &inputs(json!("hello"))));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v: Value = serde_json::from_str(r#"{"b":[{"d":1,"c":2}],"a":"x"}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":"x","b":[{"c":2,"d":1}]}"#);
    }

    #[tokio::test]
    async fn miss_commit_then_hit() {
        let cache = ExecutionCache::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let n = node();
        let i = inputs(json!(1));

        let probe = cache.compute("acme", "wf", &n, &i, false).await.unwrap();
        assert!(!probe.hit);
        assert_eq!(probe.previous_version, 0);

        let rec = cache.commit(&probe, json!("out")).await.unwrap();
        assert_eq!(rec.version, 1);

        let again = cache.compute("acme", "wf", &n, &i, false).await.unwrap();
        assert!(again.hit);
        assert_eq!(again.cached_output, Some(json!("out")));

        let forced = cache.compute("acme", "wf", &n, &i, true).await.unwrap();
        assert!(!forced.hit);
        assert_eq!(forced.previous_version, 1);
        assert_eq!(cache.commit(&forced, json!("out2")).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn failed_record_never_hits() {
        let cache = ExecutionCache::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let n = node();
        let i = inputs(json!(1));
        let probe = cache.compute("acme", "wf", &n, &i, false).await.unwrap();
        cache.commit(&probe, json!("out")).await.unwrap();
        cache.record_failure(&probe.key, "later failure").await.unwrap();

        let after = cache.compute("acme", "wf", &n, &i, false).await.unwrap();
        assert!(!after.hit);
        assert_eq!(after.previous_version, 1);
    }

    #[tokio::test]
    async fn concurrent_commit_loses() {
        let cache = ExecutionCache::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let n = node();
        let i = inputs(json!(1));
        let first = cache.compute("acme", "wf", &n, &i, false).await.unwrap();
        let second = cache.compute("acme", "wf", &n, &i, false).await.unwrap();

        cache.commit(&first, json!("winner")).await.unwrap();
        let err = cache.commit(&second, json!("loser")).await.unwrap_err();
        assert!(matches!(err, CascadeError::VersionConflict { .. }));
    }
}
