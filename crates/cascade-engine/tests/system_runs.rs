mod common;

use serde_json::json;

use cascade_core::error::CascadeError;
use cascade_core::graph::{NodeKind, WorkflowGraph, WorkflowNode};
use cascade_engine::CascadeOptions;
use cascade_test_utils::{fixtures, MockExecutor};

use common::harness;

/// Ingest triggered by `profile/gen`, feeding a transform.
fn enrichment() -> WorkflowGraph {
    WorkflowGraph::new("enrichment")
        .with_node(WorkflowNode::new("pull", NodeKind::Ingest).with_trigger("profile", "gen"))
        .with_node(WorkflowNode::new("score", NodeKind::Transform))
        .with_edge("pull", "score")
}

/// Triggered by `enrichment/score` and pointing back into `profile`.
fn echo_back() -> WorkflowGraph {
    WorkflowGraph::new("echo")
        .with_node(WorkflowNode::new("listen", NodeKind::Ingest).with_trigger("enrichment", "score"))
}

#[tokio::test]
async fn test_completed_node_triggers_downstream_workflow() {
    let h = harness(MockExecutor::new().with_output("gen", json!("summary text")));
    h.install(fixtures::ingest_generate_master()).await;
    h.install(enrichment()).await;

    let outcome = h
        .orchestrator
        .run_system_workflows("acme", "profile", "ingest", &CascadeOptions::default())
        .await
        .unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.cascades.len(), 2);
    assert_eq!(outcome.cascades[0].run.workflow_id, "profile");
    assert_eq!(outcome.cascades[1].run.workflow_id, "enrichment");
    assert_eq!(outcome.cascades[1].run.start_node_id, "pull");

    let pull = outcome.cascades[1].node("pull").unwrap().output.clone().unwrap();
    assert_eq!(pull["inputs"]["trigger"], "summary text");
    assert_eq!(h.executor.call_count("score"), 1);
}

#[tokio::test]
async fn test_each_workflow_runs_once_per_system_run() {
    let back_to_profile = WorkflowGraph::new("profile-feedback").with_node(
        WorkflowNode::new("again", NodeKind::Ingest).with_trigger("echo", "listen"),
    );
    let h = harness(MockExecutor::new());
    h.install(enrichment()).await;
    h.install(echo_back()).await;
    h.install(back_to_profile).await;

    // A second ingest in profile triggered by echo: profile is already visited
    let profile = fixtures::ingest_generate_master().with_node(
        WorkflowNode::new("reingest", NodeKind::Ingest).with_trigger("echo", "listen"),
    );
    h.install(profile).await;

    let outcome = h
        .orchestrator
        .run_system_workflows("acme", "profile", "ingest", &CascadeOptions::default())
        .await
        .unwrap();
    let order: Vec<&str> = outcome
        .cascades
        .iter()
        .map(|c| c.run.workflow_id.as_str())
        .collect();
    assert_eq!(order, vec!["profile", "enrichment", "echo", "profile-feedback"]);
    assert_eq!(h.executor.call_count("reingest"), 0);
    assert_eq!(h.executor.call_count("ingest"), 1);
}

#[tokio::test]
async fn test_failed_trigger_source_does_not_propagate() {
    let h = harness(MockExecutor::new().with_failure("gen", "quota exceeded"));
    h.install(fixtures::ingest_generate_master()).await;
    h.install(enrichment()).await;

    let outcome = h
        .orchestrator
        .run_system_workflows("acme", "profile", "ingest", &CascadeOptions::default())
        .await
        .unwrap();
    assert!(!outcome.success());
    assert_eq!(outcome.cascades.len(), 1);
    assert_eq!(h.executor.call_count("pull"), 0);
}

#[tokio::test]
async fn test_root_errors_propagate() {
    let h = harness(MockExecutor::new());
    h.install(fixtures::cyclic()).await;

    let result = h
        .orchestrator
        .run_system_workflows("acme", "loop", "a", &CascadeOptions::default())
        .await;
    assert!(matches!(result, Err(CascadeError::CycleDetected { .. })));

    let missing = h
        .orchestrator
        .run_system_workflows("acme", "nope", "a", &CascadeOptions::default())
        .await;
    assert!(matches!(missing, Err(CascadeError::WorkflowNotFound(_))));
}
