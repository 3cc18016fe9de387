use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use cascade_core::error::Result;
use cascade_core::graph::WorkflowNode;
use cascade_core::traits::ExecutionStore;
use cascade_core::types::{NodeKey, NodeStatus, ResolvedInputs};

use crate::json_path;

/// Input name under which a triggered ingest node receives the output of the
/// node in the other workflow that triggered it.
pub const TRIGGER_INPUT: &str = "trigger";

/// Collect the values a node consumes.
///
/// Declared bindings pick (a path into) a named upstream output. Without
/// bindings the node receives the whole output of each direct predecessor,
/// keyed by node id. Values produced earlier in this run win; otherwise the
/// last succeeded execution record is used, which is how paused and
/// out-of-closure upstream nodes contribute. Absent values are left out.
pub async fn resolve_inputs(
    entity_id: &str,
    workflow_id: &str,
    node: &WorkflowNode,
    upstream: &[&WorkflowNode],
    run_outputs: &HashMap<String, Value>,
    executions: &dyn ExecutionStore,
) -> Result<ResolvedInputs> {
    let mut inputs = ResolvedInputs::new();

    if node.inputs.is_empty() {
        for up in upstream {
            if let Some(value) =
                upstream_output(entity_id, workflow_id, &up.id, run_outputs, executions).await?
            {
                inputs.insert(up.id.clone(), value);
            }
        }
    } else {
        for binding in &node.inputs {
            let Some(output) =
                upstream_output(entity_id, workflow_id, &binding.from, run_outputs, executions)
                    .await?
            else {
                debug!(node_id = %node.id, from = %binding.from, "Upstream output absent");
                continue;
            };
            match json_path::select(&output, binding.path.as_deref()) {
                Some(value) => {
                    inputs.insert(binding.name().to_string(), value);
                }
                None => debug!(
                    node_id = %node.id,
                    from = %binding.from,
                    path = binding.path.as_deref().unwrap_or(""),
                    "Input path resolved to nothing"
                ),
            }
        }
    }

    if let Some(trigger) = &node.trigger {
        let key = NodeKey::new(entity_id, &trigger.workflow_id, &trigger.node_id);
        if let Some(value) = succeeded_output(executions, &key).await? {
            inputs.insert(TRIGGER_INPUT.to_string(), value);
        }
    }

    Ok(inputs)
}

async fn upstream_output(
    entity_id: &str,
    workflow_id: &str,
    node_id: &str,
    run_outputs: &HashMap<String, Value>,
    executions: &dyn ExecutionStore,
) -> Result<Option<Value>> {
    if let Some(value) = run_outputs.get(node_id) {
        return Ok(Some(value.clone()));
    }
    succeeded_output(executions, &NodeKey::new(entity_id, workflow_id, node_id)).await
}

async fn succeeded_output(executions: &dyn ExecutionStore, key: &NodeKey) -> Result<Option<Value>> {
    Ok(executions
        .get_execution(key)
        .await?
        .filter(|rec| rec.status == NodeStatus::Succeeded)
        .and_then(|rec| rec.output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::graph::{InputBinding, NodeKind};
    use cascade_core::types::NodeExecutionRecord;
    use cascade_store::SqliteStore;
    use serde_json::json;

    async fn seed(store: &SqliteStore, node_id: &str, status: NodeStatus, output: Value) {
        let mut rec = NodeExecutionRecord::new(NodeKey::new("acme", "wf", node_id));
        rec.status = status;
        rec.output = Some(output);
        rec.version = 1;
        store.commit_execution(&rec, 0).await.unwrap();
    }

    #[tokio::test]
    async fn implicit_inputs_take_whole_upstream_outputs() {
        let store = SqliteStore::in_memory().unwrap();
        let a = WorkflowNode::new("a", NodeKind::Ingest);
        let b = WorkflowNode::new("b", NodeKind::Ingest);
        let node = WorkflowNode::new("gen", NodeKind::Generate);

        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"body": "hello"}));
        seed(&store, "b", NodeStatus::Succeeded, json!("from cache")).await;

        let inputs = resolve_inputs("acme", "wf", &node, &[&a, &b], &outputs, &store)
            .await
            .unwrap();
        assert_eq!(inputs["a"], json!({"body": "hello"}));
        assert_eq!(inputs["b"], json!("from cache"));
    }

    #[tokio::test]
    async fn declared_bindings_select_paths() {
        let store = SqliteStore::in_memory().unwrap();
        let node = WorkflowNode::new("gen", NodeKind::Generate)
            .with_input(InputBinding {
                from: "a".into(),
                path: Some("$.body".into()),
                alias: Some("text".into()),
            })
            .with_input(InputBinding {
                from: "a".into(),
                path: Some("$.missing".into()),
                alias: None,
            });

        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"body": "hello", "noise": 42}));

        let inputs = resolve_inputs("acme", "wf", &node, &[], &outputs, &store)
            .await
            .unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs["text"], json!("hello"));
    }

    #[tokio::test]
    async fn failed_records_are_not_inputs() {
        let store = SqliteStore::in_memory().unwrap();
        seed(&store, "a", NodeStatus::Failed, json!("stale")).await;
        let a = WorkflowNode::new("a", NodeKind::Ingest);
        let node = WorkflowNode::new("gen", NodeKind::Generate);

        let inputs = resolve_inputs("acme", "wf", &node, &[&a], &HashMap::new(), &store)
            .await
            .unwrap();
        assert!(inputs.is_empty());
    }

    #[tokio::test]
    async fn triggered_ingest_reads_other_workflow() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rec = NodeExecutionRecord::new(NodeKey::new("acme", "upstream", "gen"));
        rec.status = NodeStatus::Succeeded;
        rec.output = Some(json!({"summary": "x"}));
        rec.version = 1;
        store.commit_execution(&rec, 0).await.unwrap();

        let node = WorkflowNode::new("in", NodeKind::Ingest).with_trigger("upstream", "gen");
        let inputs = resolve_inputs("acme", "downstream", &node, &[], &HashMap::new(), &store)
            .await
            .unwrap();
        assert_eq!(inputs[TRIGGER_INPUT], json!({"summary": "x"}));
    }
}
