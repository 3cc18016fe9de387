use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cascade_core::config::EngineConfig;
use cascade_core::error::{CascadeError, Result};
use cascade_core::event::EventBus;
use cascade_core::graph::{WorkflowGraph, WorkflowNode};
use cascade_core::traits::{
    ExecutionRequest, ExecutionStore, NodeExecutor, RunRecordStore, WorkflowStore,
};
use cascade_core::types::{
    CascadeRun, DestinationResult, NodeKey, RecordStatus, ResolvedInputs, RunId, RunStatus,
};

use crate::cache::{CacheProbe, ExecutionCache};
use crate::inputs::resolve_inputs;
use crate::locks::EntityLocks;
use crate::progress::ProgressReporter;
use crate::router::{OutputRouter, RouteContext};
use crate::topology::Topology;

/// Start node recorded for runs over a whole workflow.
pub const WHOLE_WORKFLOW: &str = "*";

/// Options for one cascade invocation.
#[derive(Debug, Clone, Default)]
pub struct CascadeOptions {
    /// Bypass the execution cache for every node in the closure.
    pub force: bool,
}

/// What happened to one node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRunStatus {
    Cached,
    Executed,
    Failed,
    Skipped,
    /// Finished after the run was cancelled; its result was thrown away.
    Discarded,
}

/// Result of one node within a cascade.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub status: NodeRunStatus,
    /// Execution record version the output belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure message, or the failed node a skipped node was blocked by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-destination results. Failures here never fail the node.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<DestinationResult>,
}

impl NodeOutcome {
    fn new(node: &WorkflowNode, status: NodeRunStatus) -> Self {
        Self {
            node_id: node.id.clone(),
            status,
            version: None,
            output: None,
            error: None,
            destinations: vec![],
        }
    }
}

/// Result of a cascade.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeOutcome {
    pub success: bool,
    pub message: String,
    /// Final in-memory run state.
    pub run: CascadeRun,
    /// Per-node results in the order they settled.
    pub nodes: Vec<NodeOutcome>,
}

impl CascadeOutcome {
    pub fn node(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Result of a cross-workflow system run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemRunOutcome {
    /// One cascade per visited workflow, in the order they ran.
    pub cascades: Vec<CascadeOutcome>,
    /// Triggered workflows whose cascade could not start, with the reason.
    pub errors: Vec<(String, String)>,
}

impl SystemRunOutcome {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.cascades.iter().all(|c| c.success)
    }
}

/// Repositories the orchestrator reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub workflows: Arc<dyn WorkflowStore>,
    pub runs: Arc<dyn RunRecordStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl Repositories {
    /// All three backed by one store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: WorkflowStore + RunRecordStore + ExecutionStore,
    {
        Self {
            workflows: store.clone(),
            runs: store.clone(),
            executions: store,
        }
    }
}

struct InFlight<'g> {
    node: &'g WorkflowNode,
    probe: CacheProbe,
}

type TaskResult = (String, Result<Value>, u64);

/// Scheduling state of one run. Only the scheduling loop touches it.
struct Frontier<'g> {
    /// Not yet settled, in topological order.
    pending: Vec<&'g WorkflowNode>,
    in_closure: HashSet<&'g str>,
    completed: HashSet<String>,
    /// Failed or skipped node -> the failed node at the root of it.
    blocked: HashMap<String, String>,
    /// Outputs produced in this run, cached or fresh.
    outputs: HashMap<String, Value>,
    in_flight: HashMap<String, InFlight<'g>>,
    first_error: Option<String>,
    outcomes: Vec<NodeOutcome>,
}

impl<'g> Frontier<'g> {
    fn new(closure: Vec<&'g WorkflowNode>) -> Self {
        Self {
            in_closure: closure.iter().map(|&n| n.id.as_str()).collect(),
            pending: closure,
            completed: HashSet::new(),
            blocked: HashMap::new(),
            outputs: HashMap::new(),
            in_flight: HashMap::new(),
            first_error: None,
            outcomes: Vec::new(),
        }
    }

    fn blocker(&self, upstream: &[&WorkflowNode]) -> Option<String> {
        upstream
            .iter()
            .find_map(|u| self.blocked.get(&u.id))
            .cloned()
    }

    /// Upstream nodes outside this run's closure (paused, or not reachable
    /// from the start node) contribute their stored output and never block.
    fn is_ready(&self, upstream: &[&WorkflowNode]) -> bool {
        upstream
            .iter()
            .all(|u| !self.in_closure.contains(u.id.as_str()) || self.completed.contains(&u.id))
    }
}

/// Drives cascades over a workflow for one entity.
///
/// The scheduling loop is the only writer of run progress and execution
/// records; executor calls run concurrently on a `JoinSet` and report back
/// to it. Cancellation is observed only between scheduling steps.
pub struct CascadeOrchestrator {
    repos: Repositories,
    cache: ExecutionCache,
    executor: Arc<dyn NodeExecutor>,
    router: Arc<OutputRouter>,
    event_bus: Arc<EventBus>,
    locks: EntityLocks,
    active: Mutex<HashMap<RunId, CancellationToken>>,
    max_parallel: usize,
    node_timeout: Duration,
}

impl CascadeOrchestrator {
    pub fn new(
        config: &EngineConfig,
        repos: Repositories,
        executor: Arc<dyn NodeExecutor>,
        router: Arc<OutputRouter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            cache: ExecutionCache::new(repos.executions.clone()),
            repos,
            executor,
            router,
            event_bus,
            locks: EntityLocks::new(),
            active: Mutex::new(HashMap::new()),
            max_parallel: config.max_parallel_nodes.max(1),
            node_timeout: Duration::from_secs(config.node_timeout_secs.max(1)),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run ids currently driven by this instance.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowGraph> {
        self.repos
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CascadeError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Execute `start_node_id` and its downstream closure for one entity.
    ///
    /// Graph errors and `EntityBusy` are returned before anything runs. Node
    /// failures are reported in the outcome, not as an error.
    pub async fn force_run_cascade(
        &self,
        entity_id: &str,
        workflow_id: &str,
        start_node_id: &str,
        options: &CascadeOptions,
    ) -> Result<CascadeOutcome> {
        let graph = self.load_workflow(workflow_id).await?;
        self.run_graph(&graph, entity_id, Some(start_node_id), options)
            .await
    }

    /// Execute every executable, unpaused node of a workflow.
    pub async fn run_workflow(
        &self,
        entity_id: &str,
        workflow_id: &str,
        options: &CascadeOptions,
    ) -> Result<CascadeOutcome> {
        let graph = self.load_workflow(workflow_id).await?;
        self.run_graph(&graph, entity_id, None, options).await
    }

    /// Run a cascade, then cascades in every workflow whose ingest nodes
    /// are triggered by a node completed along the way. Each workflow runs
    /// at most once per system run.
    pub async fn run_system_workflows(
        &self,
        entity_id: &str,
        workflow_id: &str,
        start_node_id: &str,
        options: &CascadeOptions,
    ) -> Result<SystemRunOutcome> {
        let all = self.repos.workflows.list_workflows().await?;
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, String)> = VecDeque::new();
        queue.push_back((workflow_id.to_string(), start_node_id.to_string()));
        let mut outcome = SystemRunOutcome::default();

        while let Some((wf_id, node_id)) = queue.pop_front() {
            if !visited.insert(wf_id.clone()) {
                debug!(workflow_id = %wf_id, "Workflow already visited in this system run");
                continue;
            }
            let is_root = outcome.cascades.is_empty() && outcome.errors.is_empty();

            let result = match all.iter().find(|w| w.id == wf_id) {
                Some(graph) => {
                    self.run_graph(graph, entity_id, Some(&node_id), options)
                        .await
                }
                None => Err(CascadeError::WorkflowNotFound(wf_id.clone())),
            };
            let cascade = match result {
                Ok(cascade) => cascade,
                Err(e) if is_root => return Err(e),
                Err(e) => {
                    warn!(workflow_id = %wf_id, error = %e, "Triggered cascade did not start");
                    outcome.errors.push((wf_id, e.to_string()));
                    continue;
                }
            };

            for completed in &cascade.run.completed_node_ids {
                for other in all.iter().filter(|w| !visited.contains(&w.id)) {
                    for ingest in other.nodes_triggered_by(&wf_id, completed) {
                        info!(
                            from_workflow = %wf_id,
                            from_node = %completed,
                            workflow_id = %other.id,
                            node_id = %ingest.id,
                            "Triggering downstream workflow"
                        );
                        queue.push_back((other.id.clone(), ingest.id.clone()));
                    }
                }
            }
            outcome.cascades.push(cascade);
        }

        Ok(outcome)
    }

    /// Cancel a run. The persisted record flips to `cancelled` right away;
    /// a live run stops at its next scheduling step. Returns false if the
    /// run had already finished.
    pub async fn cancel_cascade(&self, run_id: &RunId) -> Result<bool> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned();
        if let Some(ref token) = token {
            token.cancel();
        }

        let changed = self
            .repos
            .runs
            .finish_run(run_id, RecordStatus::Cancelled, Some("Cancelled by user".into()))
            .await?;
        if !changed && token.is_none() && self.repos.runs.get_run(run_id).await?.is_none() {
            return Err(CascadeError::RunNotFound(run_id.to_string()));
        }
        info!(run_id = %run_id, live = token.is_some(), changed, "Cascade cancel requested");
        Ok(changed)
    }

    pub async fn fail_run_directly(&self, run_id: &RunId, message: &str) -> Result<bool> {
        fail_run_directly(self.repos.runs.as_ref(), run_id, message).await
    }

    async fn run_graph(
        &self,
        graph: &WorkflowGraph,
        entity_id: &str,
        start_node_id: Option<&str>,
        options: &CascadeOptions,
    ) -> Result<CascadeOutcome> {
        // Everything that can reject the graph happens before any write
        let topology = Topology::build(graph)?;
        let closure = match start_node_id {
            Some(start) => topology.downstream_closure(start)?,
            None => topology.executable_nodes(),
        };
        let start_node_id = start_node_id.unwrap_or(WHOLE_WORKFLOW);
        let _guard = self.locks.try_acquire(entity_id)?;

        let run_id = RunId::new();
        let run = CascadeRun::new(
            run_id.clone(),
            entity_id,
            &graph.id,
            start_node_id,
            closure.len(),
        );
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.clone(), token.clone());

        info!(
            run_id = %run_id,
            entity_id,
            workflow_id = %graph.id,
            start_node_id,
            nodes = closure.len(),
            force = options.force,
            "Cascade started"
        );

        let mut progress =
            ProgressReporter::new(run, self.repos.runs.clone(), self.event_bus.clone());
        let result = self
            .drive(&topology, closure, entity_id, &graph.id, options, &token, &mut progress)
            .await;

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);

        let (interrupted, frontier) = match result {
            Ok(done) => done,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Cascade aborted");
                if let Err(finish_err) = progress.finish(RunStatus::Failed, &e.to_string()).await {
                    warn!(run_id = %run_id, error = %finish_err, "Could not record aborted run");
                }
                return Err(e);
            }
        };

        let (status, message) = match interrupted {
            Some(RunStatus::Cancelled) => (RunStatus::Cancelled, "Cascade cancelled".to_string()),
            Some(_) => {
                let message = self
                    .repos
                    .runs
                    .get_run(&run_id)
                    .await?
                    .and_then(|r| r.error_message)
                    .unwrap_or_else(|| "Run marked failed".to_string());
                (RunStatus::Failed, message)
            }
            None => match (&progress.run().failed_node_id, &frontier.first_error) {
                (Some(node_id), Some(err)) => (
                    RunStatus::Failed,
                    format!("Cascade failed at node {}: {}", node_id, err),
                ),
                _ => (
                    RunStatus::Completed,
                    format!(
                        "Cascade completed: {} executed, {} cached",
                        progress.run().executed_count,
                        progress.run().cached_count
                    ),
                ),
            },
        };

        let final_status = progress.finish(status, &message).await?;
        let run = progress.into_run();
        info!(
            run_id = %run_id,
            status = %final_status,
            executed = run.executed_count,
            cached = run.cached_count,
            skipped = run.skipped_node_ids.len(),
            "Cascade finished"
        );

        Ok(CascadeOutcome {
            success: final_status == RunStatus::Completed,
            message,
            run,
            nodes: frontier.outcomes,
        })
    }

    /// Terminal status imposed from outside the scheduling loop, if any.
    async fn interruption(
        &self,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<Option<RunStatus>> {
        if token.is_cancelled() {
            return Ok(Some(RunStatus::Cancelled));
        }
        Ok(progress.external_status().await?.map(|status| match status {
            RecordStatus::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<'g>(
        &self,
        topology: &Topology<'g>,
        closure: Vec<&'g WorkflowNode>,
        entity_id: &str,
        workflow_id: &str,
        options: &CascadeOptions,
        token: &CancellationToken,
        progress: &mut ProgressReporter,
    ) -> Result<(Option<RunStatus>, Frontier<'g>)> {
        let mut frontier = Frontier::new(closure);
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();

        progress.start().await?;

        loop {
            if let Some(status) = self.interruption(token, progress).await? {
                self.discard_in_flight(&mut join_set, &mut frontier, progress).await;
                return Ok((Some(status), frontier));
            }

            let mut idx = 0;
            while idx < frontier.pending.len() && join_set.len() < self.max_parallel {
                let node = frontier.pending[idx];
                let upstream = topology.upstream_of(&node.id);

                if let Some(root) = frontier.blocker(&upstream) {
                    frontier.pending.remove(idx);
                    debug!(node_id = %node.id, blocked_by = %root, "Skipping dependent of failed node");
                    progress.node_skipped(&node.id, &root);
                    let mut outcome = NodeOutcome::new(node, NodeRunStatus::Skipped);
                    outcome.error = Some(format!("blocked by failed node {}", root));
                    frontier.outcomes.push(outcome);
                    frontier.blocked.insert(node.id.clone(), root);
                    continue;
                }
                if !frontier.is_ready(&upstream) {
                    idx += 1;
                    continue;
                }
                frontier.pending.remove(idx);

                self.schedule(
                    node,
                    &upstream,
                    entity_id,
                    workflow_id,
                    options,
                    &mut frontier,
                    &mut join_set,
                    progress,
                )
                .await;
            }
            progress.persist().await?;

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (node_id, result, elapsed_ms) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Node task lost");
                    continue;
                }
            };
            let Some(flight) = frontier.in_flight.remove(&node_id) else {
                continue;
            };

            // A result landing after cancellation is dropped, not propagated
            if let Some(status) = self.interruption(token, progress).await? {
                self.discard(flight, &mut frontier, progress).await;
                self.discard_in_flight(&mut join_set, &mut frontier, progress).await;
                return Ok((Some(status), frontier));
            }

            match result {
                Ok(output) => {
                    self.settle_fresh(
                        flight,
                        output,
                        elapsed_ms,
                        entity_id,
                        workflow_id,
                        &mut frontier,
                        progress,
                    )
                    .await
                }
                Err(e) => {
                    let key = flight.probe.key.clone();
                    self.fail_node(flight.node, &key, &e, &mut frontier, progress).await
                }
            }
            progress.persist().await?;
        }

        // Tasks lost to a join error never reported back
        let lost: Vec<String> = frontier.in_flight.keys().cloned().collect();
        for node_id in lost {
            if let Some(flight) = frontier.in_flight.remove(&node_id) {
                let err = CascadeError::NodeExecution {
                    node_id: node_id.clone(),
                    message: "executor task ended without a result".into(),
                };
                let key = flight.probe.key.clone();
                self.fail_node(flight.node, &key, &err, &mut frontier, progress)
                    .await;
            }
        }

        Ok((None, frontier))
    }

    /// Resolve inputs and probe the cache. Hits settle immediately; misses
    /// are handed to the executor.
    #[allow(clippy::too_many_arguments)]
    async fn schedule<'g>(
        &self,
        node: &'g WorkflowNode,
        upstream: &[&WorkflowNode],
        entity_id: &str,
        workflow_id: &str,
        options: &CascadeOptions,
        frontier: &mut Frontier<'g>,
        join_set: &mut JoinSet<TaskResult>,
        progress: &mut ProgressReporter,
    ) {
        let key = NodeKey::new(entity_id, workflow_id, &node.id);
        let prepared = async {
            let inputs = resolve_inputs(
                entity_id,
                workflow_id,
                node,
                upstream,
                &frontier.outputs,
                self.repos.executions.as_ref(),
            )
            .await?;
            let probe = self
                .cache
                .compute(entity_id, workflow_id, node, &inputs, options.force)
                .await?;
            Ok::<_, CascadeError>((inputs, probe))
        }
        .await;

        let (inputs, probe) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail_node(node, &key, &e, frontier, progress).await;
                return;
            }
        };

        if probe.hit {
            let output = probe.cached_output.clone().unwrap_or(Value::Null);
            let ctx = RouteContext {
                run_id: progress.run_id().clone(),
                entity_id: entity_id.to_string(),
                workflow_id: workflow_id.to_string(),
                version: probe.previous_version,
                content_hash: probe.hash.clone(),
            };
            let destinations = self.router.route(&ctx, node, &output).await;
            debug!(node_id = %node.id, version = probe.previous_version, "Cache hit");

            progress.node_cached(&node.id);
            frontier.completed.insert(node.id.clone());
            frontier.outputs.insert(node.id.clone(), output.clone());
            let mut outcome = NodeOutcome::new(node, NodeRunStatus::Cached);
            outcome.version = Some(probe.previous_version);
            outcome.output = Some(output);
            outcome.destinations = destinations;
            frontier.outcomes.push(outcome);
            return;
        }

        if let Err(e) = self.cache.mark_processing(&probe.key).await {
            self.fail_node(node, &key, &e, frontier, progress).await;
            return;
        }
        progress.node_started(&node.id, node.display_label());
        self.spawn(node, entity_id, workflow_id, inputs, join_set);
        frontier
            .in_flight
            .insert(node.id.clone(), InFlight { node, probe });
    }

    fn spawn(
        &self,
        node: &WorkflowNode,
        entity_id: &str,
        workflow_id: &str,
        inputs: ResolvedInputs,
        join_set: &mut JoinSet<TaskResult>,
    ) {
        let executor = self.executor.clone();
        let timeout = self.node_timeout;
        let node_id = node.id.clone();
        let request = ExecutionRequest {
            entity_id: entity_id.to_string(),
            workflow_id: workflow_id.to_string(),
            node: node.clone(),
            inputs,
        };

        join_set.spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(tokio::time::timeout(timeout, executor.execute(request)))
                .catch_unwind()
                .await;
            let result = match call {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CascadeError::NodeTimeout {
                    node_id: node_id.clone(),
                    timeout_secs: timeout.as_secs(),
                }),
                Err(_) => Err(CascadeError::NodeExecution {
                    node_id: node_id.clone(),
                    message: "executor panicked".into(),
                }),
            };
            (node_id, result, started.elapsed().as_millis() as u64)
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_fresh<'g>(
        &self,
        flight: InFlight<'g>,
        output: Value,
        elapsed_ms: u64,
        entity_id: &str,
        workflow_id: &str,
        frontier: &mut Frontier<'g>,
        progress: &mut ProgressReporter,
    ) {
        let InFlight { node, probe } = flight;
        let record = match self.cache.commit(&probe, output.clone()).await {
            Ok(record) => record,
            Err(e) => {
                self.fail_node(node, &probe.key, &e, frontier, progress).await;
                return;
            }
        };

        let ctx = RouteContext {
            run_id: progress.run_id().clone(),
            entity_id: entity_id.to_string(),
            workflow_id: workflow_id.to_string(),
            version: record.version,
            content_hash: probe.hash.clone(),
        };
        let destinations = self.router.route(&ctx, node, &output).await;
        info!(
            node_id = %node.id,
            version = record.version,
            elapsed_ms,
            "Node executed"
        );

        progress.node_completed(&node.id, record.version, elapsed_ms);
        frontier.completed.insert(node.id.clone());
        frontier.outputs.insert(node.id.clone(), output.clone());
        let mut outcome = NodeOutcome::new(node, NodeRunStatus::Executed);
        outcome.version = Some(record.version);
        outcome.output = Some(output);
        outcome.destinations = destinations;
        frontier.outcomes.push(outcome);
    }

    async fn fail_node<'g>(
        &self,
        node: &'g WorkflowNode,
        key: &NodeKey,
        error: &CascadeError,
        frontier: &mut Frontier<'g>,
        progress: &mut ProgressReporter,
    ) {
        let message = error.to_string();
        warn!(node_id = %node.id, error = %message, "Node failed");
        if let Err(e) = self.cache.record_failure(key, &message).await {
            warn!(node_id = %node.id, error = %e, "Could not record node failure");
        }

        progress.node_failed(&node.id, &message);
        frontier.blocked.insert(node.id.clone(), node.id.clone());
        if frontier.first_error.is_none() {
            frontier.first_error = Some(message.clone());
        }
        let mut outcome = NodeOutcome::new(node, NodeRunStatus::Failed);
        outcome.error = Some(message);
        frontier.outcomes.push(outcome);
    }

    async fn discard<'g>(
        &self,
        flight: InFlight<'g>,
        frontier: &mut Frontier<'g>,
        progress: &mut ProgressReporter,
    ) {
        debug!(node_id = %flight.node.id, "Discarding result of cancelled run");
        if let Err(e) = self.cache.restore(&flight.probe).await {
            warn!(node_id = %flight.node.id, error = %e, "Could not restore execution record");
        }
        progress.node_discarded(&flight.node.id);
        frontier
            .outcomes
            .push(NodeOutcome::new(flight.node, NodeRunStatus::Discarded));
    }

    /// Let in-flight executions finish and throw their results away.
    async fn discard_in_flight<'g>(
        &self,
        join_set: &mut JoinSet<TaskResult>,
        frontier: &mut Frontier<'g>,
        progress: &mut ProgressReporter,
    ) {
        while let Some(joined) = join_set.join_next().await {
            let node_id = match joined {
                Ok((node_id, _, _)) => node_id,
                Err(e) => {
                    error!(error = %e, "Node task lost");
                    continue;
                }
            };
            if let Some(flight) = frontier.in_flight.remove(&node_id) {
                self.discard(flight, frontier, progress).await;
            }
        }
        // Anything whose task was lost still needs its record restored
        let left: Vec<String> = frontier.in_flight.keys().cloned().collect();
        for node_id in left {
            if let Some(flight) = frontier.in_flight.remove(&node_id) {
                self.discard(flight, frontier, progress).await;
            }
        }
    }
}

/// Mark a run record failed straight in storage, for when the process that
/// drives it is gone. A live orchestrator sees the terminal status at its
/// next scheduling step and stops without overwriting it.
pub async fn fail_run_directly(
    runs: &dyn RunRecordStore,
    run_id: &RunId,
    message: &str,
) -> Result<bool> {
    let changed = runs
        .finish_run(run_id, RecordStatus::Failed, Some(message.to_string()))
        .await?;
    if !changed && runs.get_run(run_id).await?.is_none() {
        return Err(CascadeError::RunNotFound(run_id.to_string()));
    }
    info!(run_id = %run_id, changed, "Run failed directly");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::graph::NodeKind;
    use cascade_store::SqliteStore;
    use cascade_test_utils::{fixtures, MockExecutor, MockTransport};

    use crate::review::ChangeReview;

    fn orchestrator(store: Arc<SqliteStore>, executor: Arc<MockExecutor>) -> CascadeOrchestrator {
        let bus = Arc::new(EventBus::default());
        let review = Arc::new(ChangeReview::new(store.clone(), bus.clone()));
        let router = Arc::new(OutputRouter::new(
            store.clone(),
            store.clone(),
            review,
            Arc::new(MockTransport::new()),
            bus.clone(),
        ));
        CascadeOrchestrator::new(
            &EngineConfig::default(),
            Repositories::from_store(store),
            executor,
            router,
            bus,
        )
    }

    #[tokio::test]
    async fn unknown_workflow_and_node() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_workflow(&fixtures::fan_out()).await.unwrap();
        let orch = orchestrator(store.clone(), Arc::new(MockExecutor::new()));

        let opts = CascadeOptions::default();
        assert!(matches!(
            orch.force_run_cascade("acme", "nope", "a", &opts).await,
            Err(CascadeError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            orch.force_run_cascade("acme", "fan", "zzz", &opts).await,
            Err(CascadeError::NodeNotFound { .. })
        ));
        assert!(store.list_runs("acme", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_is_fully_cached_and_force_reexecutes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_workflow(&fixtures::fan_out()).await.unwrap();
        let exec = Arc::new(MockExecutor::new());
        let orch = orchestrator(store.clone(), exec.clone());
        let opts = CascadeOptions::default();

        let first = orch.force_run_cascade("acme", "fan", "a", &opts).await.unwrap();
        assert!(first.success);
        assert_eq!(first.run.executed_count, 4);

        let second = orch.force_run_cascade("acme", "fan", "a", &opts).await.unwrap();
        assert!(second.success);
        assert_eq!(second.run.executed_count, 0);
        assert_eq!(second.run.cached_count, 4);
        assert_eq!(exec.total_calls(), 4);
        assert_eq!(
            first.node("d").unwrap().output,
            second.node("d").unwrap().output
        );

        let forced = orch
            .force_run_cascade("acme", "fan", "b", &CascadeOptions { force: true })
            .await
            .unwrap();
        assert_eq!(forced.run.executed_count, 2);
        assert_eq!(forced.node("b").unwrap().version, Some(2));
    }

    #[tokio::test]
    async fn run_record_is_terminal_after_completion() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_workflow(&fixtures::fan_out()).await.unwrap();
        let orch = orchestrator(store.clone(), Arc::new(MockExecutor::new()));

        let outcome = orch
            .force_run_cascade("acme", "fan", "c", &CascadeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.run.total_count, 1);

        let record = store.get_run(&outcome.run.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.progress.current, 1);
        assert!(orch.active_runs().is_empty());
    }

    #[tokio::test]
    async fn node_timeout_fails_only_that_node() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = Arc::new(MockExecutor::new().with_delay("b", Duration::from_secs(5)));
        let bus = Arc::new(EventBus::default());
        let review = Arc::new(ChangeReview::new(store.clone(), bus.clone()));
        let router = Arc::new(OutputRouter::new(
            store.clone(),
            store.clone(),
            review,
            Arc::new(MockTransport::new()),
            bus.clone(),
        ));
        let config = EngineConfig {
            node_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let orch = CascadeOrchestrator::new(
            &config,
            Repositories::from_store(store.clone()),
            exec,
            router,
            bus,
        );

        let graph = WorkflowGraph::new("slow")
            .with_node(WorkflowNode::new("a", NodeKind::Ingest))
            .with_node(WorkflowNode::new("b", NodeKind::Transform))
            .with_edge("a", "b");
        store.save_workflow(&graph).await.unwrap();

        let outcome = orch
            .force_run_cascade("acme", "slow", "a", &CascadeOptions::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.run.failed_node_id.as_deref(), Some("b"));
        let b = outcome.node("b").unwrap();
        assert!(b.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(outcome.node("a").unwrap().status, NodeRunStatus::Executed);
    }
}
