mod common;

use std::sync::Arc;
use std::time::Duration;

use cascade_core::error::CascadeError;
use cascade_core::graph::{NodeKind, WorkflowGraph, WorkflowNode};
use cascade_core::traits::{ExecutionStore, RunRecordStore};
use cascade_core::types::{NodeKey, NodeStatus, RecordStatus, RunId, RunStatus};
use cascade_engine::{fail_run_directly, CascadeOptions, CascadeOrchestrator, NodeRunStatus};
use cascade_test_utils::MockExecutor;

use common::harness;

fn chain() -> WorkflowGraph {
    WorkflowGraph::new("chain")
        .with_node(WorkflowNode::new("a", NodeKind::Ingest))
        .with_node(WorkflowNode::new("b", NodeKind::Generate))
        .with_node(WorkflowNode::new("c", NodeKind::Output))
        .with_edge("a", "b")
        .with_edge("b", "c")
}

fn only_active_run(orchestrator: &CascadeOrchestrator) -> RunId {
    let runs = orchestrator.active_runs();
    assert_eq!(runs.len(), 1);
    runs[0].clone()
}

fn spawn_run(
    orchestrator: Arc<CascadeOrchestrator>,
) -> tokio::task::JoinHandle<cascade_core::error::Result<cascade_engine::CascadeOutcome>> {
    tokio::spawn(async move {
        orchestrator
            .force_run_cascade("acme", "chain", "a", &CascadeOptions::default())
            .await
    })
}

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let exec = MockExecutor::new();
    let gate = exec.gate("b");
    let h = harness(exec);
    h.install(chain()).await;

    let task = spawn_run(h.orchestrator.clone());
    gate.started.notified().await;
    let run_id = only_active_run(&h.orchestrator);

    assert!(h.orchestrator.cancel_cascade(&run_id).await.unwrap());
    let record = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Cancelled);

    gate.release.notify_one();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.run.status, RunStatus::Cancelled);
    assert_eq!(outcome.node("b").unwrap().status, NodeRunStatus::Discarded);
    assert!(!outcome.run.completed_node_ids.contains(&"b".to_string()));
    assert_eq!(h.executor.call_count("c"), 0);

    // The discarded output never became a cache entry
    let b = h
        .store
        .get_execution(&NodeKey::new("acme", "chain", "b"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(b.status, NodeStatus::Succeeded);
    assert!(b.output.is_none());

    let record = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Cancelled);
    assert_eq!(record.error_message.as_deref(), Some("Cancelled by user"));
}

#[tokio::test]
async fn test_direct_failure_stops_live_run() {
    let exec = MockExecutor::new();
    let gate = exec.gate("b");
    let h = harness(exec);
    h.install(chain()).await;

    let task = spawn_run(h.orchestrator.clone());
    gate.started.notified().await;
    let run_id = only_active_run(&h.orchestrator);

    assert!(fail_run_directly(h.store.as_ref(), &run_id, "Browser closed")
        .await
        .unwrap());
    gate.release.notify_one();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome.run.status, RunStatus::Failed);
    assert_eq!(outcome.message, "Browser closed");
    assert_eq!(h.executor.call_count("c"), 0);

    // The driving orchestrator never overwrote the external status
    let record = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("Browser closed"));
}

#[tokio::test]
async fn test_cancelling_finished_or_unknown_runs() {
    let h = harness(MockExecutor::new());
    h.install(chain()).await;

    let outcome = h
        .orchestrator
        .force_run_cascade("acme", "chain", "a", &CascadeOptions::default())
        .await
        .unwrap();
    assert!(!h
        .orchestrator
        .cancel_cascade(&outcome.run.run_id)
        .await
        .unwrap());
    let record = h.store.get_run(&outcome.run.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);

    assert!(matches!(
        h.orchestrator
            .cancel_cascade(&RunId::from_string("missing"))
            .await,
        Err(CascadeError::RunNotFound(_))
    ));
    assert!(matches!(
        fail_run_directly(h.store.as_ref(), &RunId::from_string("missing"), "gone").await,
        Err(CascadeError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_second_cascade_for_busy_entity_is_rejected() {
    let exec = MockExecutor::new();
    let gate = exec.gate("b");
    let h = harness(exec);
    h.install(chain()).await;

    let task = spawn_run(h.orchestrator.clone());
    gate.started.notified().await;

    let second = h
        .orchestrator
        .force_run_cascade("acme", "chain", "a", &CascadeOptions::default())
        .await;
    assert!(matches!(second, Err(CascadeError::EntityBusy(ref e)) if e == "acme"));

    gate.release.notify_one();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcome.success);
    assert_eq!(h.store.list_runs("acme", 10).await.unwrap().len(), 1);

    // The lock is released with the run
    let again = h
        .orchestrator
        .force_run_cascade("acme", "chain", "a", &CascadeOptions::default())
        .await
        .unwrap();
    assert_eq!(again.run.cached_count, 3);
}
