use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::{WorkflowGraph, WorkflowNode};
use crate::types::*;

/// Everything a node executor receives for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub entity_id: String,
    pub workflow_id: String,
    pub node: WorkflowNode,
    pub inputs: ResolvedInputs,
}

/// Opaque node executor. Must be idempotent for identical inputs.
/// Only invoked on a cache miss or a forced run.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Outbound HTTP seam used by webhook and external API destinations.
pub trait DestinationTransport: Send + Sync + 'static {
    /// POST a JSON payload. Non-2xx responses are errors.
    fn post_json(&self, url: &str, payload: serde_json::Value) -> BoxFuture<'_, Result<()>>;
}

/// Durable entity run records.
pub trait RunRecordStore: Send + Sync + 'static {
    /// Insert or update a run record. Never overwrites a terminal status;
    /// returns false when the stored record was already terminal.
    fn save_run(&self, record: &EntityRunRecord) -> BoxFuture<'_, Result<bool>>;

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<EntityRunRecord>>>;

    /// Most recent runs for an entity, newest first.
    fn list_runs(&self, entity_id: &str, limit: usize)
        -> BoxFuture<'_, Result<Vec<EntityRunRecord>>>;

    /// Runs in pending or processing.
    fn list_active_runs(&self) -> BoxFuture<'_, Result<Vec<EntityRunRecord>>>;

    /// Move a non-terminal run into a terminal status. Returns false if the
    /// run was already terminal or does not exist.
    fn finish_run(
        &self,
        run_id: &RunId,
        status: RecordStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Fail a pending/processing run whose `updated_at` is before `cutoff`.
    fn fail_if_stale(
        &self,
        run_id: &RunId,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> BoxFuture<'_, Result<bool>>;
}

/// Per-node execution records (the content-addressed cache).
pub trait ExecutionStore: Send + Sync + 'static {
    fn get_execution(&self, key: &NodeKey) -> BoxFuture<'_, Result<Option<NodeExecutionRecord>>>;

    /// Store a fresh execution result. Fails with `VersionConflict` unless the
    /// stored version still equals `expected_version` (0 = no record yet).
    fn commit_execution(
        &self,
        record: &NodeExecutionRecord,
        expected_version: u64,
    ) -> BoxFuture<'_, Result<()>>;

    /// Update status and error without touching output, hash or version.
    fn set_execution_status(
        &self,
        key: &NodeKey,
        status: NodeStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    /// All records of one node across entities.
    fn list_node_executions(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> BoxFuture<'_, Result<Vec<NodeExecutionRecord>>>;
}

/// Master field store, last-write-wins.
pub trait FieldStore: Send + Sync + 'static {
    fn get_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
    ) -> BoxFuture<'_, Result<Option<FieldRecord>>>;

    /// Overwrite a field value, keeping its approval policy.
    fn write_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
        value: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;

    /// Write a full record, including its approval policy.
    fn put_field(&self, record: &FieldRecord) -> BoxFuture<'_, Result<()>>;

    fn delete_field(
        &self,
        entity_id: &str,
        domain: &str,
        field_key: &str,
    ) -> BoxFuture<'_, Result<bool>>;
}

/// Shared cache buckets and their data rows.
pub trait SharedCacheStore: Send + Sync + 'static {
    fn ensure_cache(&self, cache: &SharedCache) -> BoxFuture<'_, Result<()>>;

    /// Idempotent upsert keyed by (cache, entity, workflow, node).
    fn upsert_entry(&self, entry: &SharedCacheEntry) -> BoxFuture<'_, Result<()>>;

    fn get_entry(
        &self,
        cache_id: &str,
        key: &NodeKey,
    ) -> BoxFuture<'_, Result<Option<SharedCacheEntry>>>;

    fn list_entries(&self, cache_id: &str) -> BoxFuture<'_, Result<Vec<SharedCacheEntry>>>;
}

/// SSOT pending change lifecycle.
pub trait ChangeStore: Send + Sync + 'static {
    /// Create a pending change, deduplicated on (entity_id, node_id,
    /// change_id) while a pending row exists.
    fn submit_change(&self, change: &PendingChange) -> BoxFuture<'_, Result<SubmitOutcome>>;

    /// The entity's pending row for a change id, else its latest resolved row.
    fn get_change(
        &self,
        entity_id: &str,
        change_id: &str,
    ) -> BoxFuture<'_, Result<Option<PendingChange>>>;

    fn list_changes(
        &self,
        status: Option<ChangeStatus>,
        entity_id: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<PendingChange>>>;

    /// Atomically mark the pending change approved and commit its proposed
    /// value to the master field store. Returns false if it was no longer
    /// pending.
    fn approve_change(
        &self,
        change: &PendingChange,
        resolved_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Mark the pending change rejected. Returns false if it was no longer
    /// pending.
    fn reject_change(
        &self,
        change: &PendingChange,
        resolved_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>>;
}

/// Workflow definitions.
pub trait WorkflowStore: Send + Sync + 'static {
    fn save_workflow(&self, workflow: &WorkflowGraph) -> BoxFuture<'_, Result<()>>;

    fn get_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowGraph>>>;

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowGraph>>>;
}
