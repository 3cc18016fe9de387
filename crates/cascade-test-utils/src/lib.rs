//! Shared mocks and fixtures for cascade crate tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Notify;

use cascade_core::destination::OutputDestination;
use cascade_core::error::{CascadeError, Result};
use cascade_core::graph::{NodeKind, WorkflowGraph, WorkflowNode};
use cascade_core::traits::{DestinationTransport, ExecutionRequest, NodeExecutor};
use cascade_core::types::{CascadeRun, EntityRunRecord, RunId};
use cascade_store::SqliteStore;

/// Started/release pair that holds one node's execution open until a test
/// lets it go.
#[derive(Clone, Default)]
pub struct Gate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Scripted node executor.
///
/// Unscripted nodes echo their id and inputs, so the output is a pure
/// function of what the node consumed.
#[derive(Default)]
pub struct MockExecutor {
    outputs: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    gates: Mutex<HashMap<String, Gate>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, node_id: &str, output: Value) -> Self {
        self.set_output(node_id, output);
        self
    }

    pub fn with_failure(self, node_id: &str, message: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(node_id.to_string(), message.to_string());
        self
    }

    pub fn with_delay(self, node_id: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(node_id.to_string(), delay);
        self
    }

    /// Change a node's scripted output between runs.
    pub fn set_output(&self, node_id: &str, output: Value) {
        self.outputs
            .lock()
            .unwrap()
            .insert(node_id.to_string(), output);
    }

    pub fn clear_failure(&self, node_id: &str) {
        self.failures.lock().unwrap().remove(node_id);
    }

    /// Hold `node_id` open until `gate.release` is notified.
    pub fn gate(&self, node_id: &str) -> Gate {
        let gate = Gate::default();
        self.gates
            .lock()
            .unwrap()
            .insert(node_id.to_string(), gate.clone());
        gate
    }

    /// Node ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == node_id)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of executions observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for MockExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let node_id = request.node.id.clone();
            self.calls.lock().unwrap().push(node_id.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let gate = self.gates.lock().unwrap().get(&node_id).cloned();
            if let Some(gate) = gate {
                gate.started.notify_one();
                gate.release.notified().await;
            }

            let delay = self.delays.lock().unwrap().get(&node_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(message) = self.failures.lock().unwrap().get(&node_id) {
                return Err(CascadeError::NodeExecution {
                    node_id,
                    message: message.clone(),
                });
            }

            let scripted = self.outputs.lock().unwrap().get(&node_id).cloned();
            Ok(scripted.unwrap_or_else(|| json!({ "node": node_id, "inputs": request.inputs })))
        })
    }
}

/// Records every POST; URLs registered with `fail_url` return an error.
#[derive(Default)]
pub struct MockTransport {
    posts: Mutex<Vec<(String, Value)>>,
    failing: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_url(self, url: &str) -> Self {
        self.failing.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }
}

impl DestinationTransport for MockTransport {
    fn post_json(&self, url: &str, payload: Value) -> BoxFuture<'_, Result<()>> {
        let url = url.to_string();

        Box::pin(async move {
            if self.failing.lock().unwrap().contains(&url) {
                return Err(CascadeError::Http(format!("{} returned 503", url)));
            }
            self.posts.lock().unwrap().push((url, payload));
            Ok(())
        })
    }
}

/// Fresh in-memory store.
pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().expect("in-memory sqlite"))
}

/// A processing run record last touched `minutes_ago`.
pub fn run_record(run_id: &str, entity_id: &str, minutes_ago: i64) -> EntityRunRecord {
    let run = CascadeRun::new(RunId::from_string(run_id), entity_id, "wf", "start", 1);
    let mut record = EntityRunRecord::from_run(&run, None);
    record.updated_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    record
}

/// Workflow fixtures.
pub mod fixtures {
    use super::*;

    /// `ingest -> gen`, with `gen` writing to `company.summary` in the master
    /// field store.
    pub fn ingest_generate_master() -> WorkflowGraph {
        WorkflowGraph::new("profile")
            .with_node(
                WorkflowNode::new("ingest", NodeKind::Ingest)
                    .with_label("Website")
                    .with_config(json!({"url": "https://acme.example"})),
            )
            .with_node(
                WorkflowNode::new("gen", NodeKind::Generate)
                    .with_label("Summary")
                    .with_config(json!({"prompt": "summarize"}))
                    .with_destination(OutputDestination::master_data(
                        "master", "company", "summary",
                    )),
            )
            .with_edge("ingest", "gen")
    }

    /// `a -> b` and `c -> d`, no edges between branches.
    pub fn disjoint_branches() -> WorkflowGraph {
        WorkflowGraph::new("branches")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_node(WorkflowNode::new("c", NodeKind::Ingest))
            .with_node(WorkflowNode::new("d", NodeKind::Transform))
            .with_edge("a", "b")
            .with_edge("c", "d")
    }

    /// `a -> b`, `a -> c`, `b -> d`.
    pub fn fan_out() -> WorkflowGraph {
        WorkflowGraph::new("fan")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_node(WorkflowNode::new("c", NodeKind::Transform))
            .with_node(WorkflowNode::new("d", NodeKind::Output))
            .with_edge("a", "b")
            .with_edge("a", "c")
            .with_edge("b", "d")
    }

    /// `a -> b -> c -> a`.
    pub fn cyclic() -> WorkflowGraph {
        WorkflowGraph::new("loop")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_node(WorkflowNode::new("c", NodeKind::Transform))
            .with_edge("a", "b")
            .with_edge("b", "c")
            .with_edge("c", "a")
    }

    /// Root with `width` independent children.
    pub fn wide(width: usize) -> WorkflowGraph {
        let mut graph =
            WorkflowGraph::new("wide").with_node(WorkflowNode::new("root", NodeKind::Ingest));
        for i in 0..width {
            let id = format!("leaf-{}", i);
            graph = graph
                .with_node(WorkflowNode::new(id.clone(), NodeKind::Transform))
                .with_edge("root", id);
        }
        graph
    }
}
