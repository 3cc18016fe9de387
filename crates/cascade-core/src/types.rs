use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CascadeError;

/// Unique cascade run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural key of a node execution record.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeKey {
    pub entity_id: String,
    pub workflow_id: String,
    pub node_id: String,
}

impl NodeKey {
    pub fn new(
        entity_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.entity_id, self.workflow_id, self.node_id)
    }
}

/// Format a timestamp for storage. Fixed precision keeps lexical order equal
/// to chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, falling back to now on malformed input.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = CascadeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CascadeError::Database(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Status of a single node execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

string_enum!(NodeStatus {
    Pending => "pending",
    Processing => "processing",
    Succeeded => "succeeded",
    Failed => "failed",
});

/// Persisted execution state of one node for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub key: NodeKey,
    pub status: NodeStatus,
    pub output: Option<serde_json::Value>,
    pub content_hash: Option<String>,
    /// Incremented only on a real (non-cached) execution.
    pub version: u64,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecutionRecord {
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            status: NodeStatus::Pending,
            output: None,
            content_hash: None,
            version: 0,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle of an in-memory cascade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Status of the durable entity run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(RecordStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<RunStatus> for RecordStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => Self::Processing,
            RunStatus::Completed => Self::Completed,
            RunStatus::Failed => Self::Failed,
            RunStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// In-memory view of one cascade invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeRun {
    pub run_id: RunId,
    pub entity_id: String,
    pub workflow_id: String,
    pub start_node_id: String,
    pub status: RunStatus,
    pub executing_node_ids: Vec<String>,
    pub completed_node_ids: Vec<String>,
    pub failed_node_id: Option<String>,
    pub skipped_node_ids: Vec<String>,
    pub current_node_label: Option<String>,
    pub completed_count: usize,
    pub total_count: usize,
    pub cached_count: usize,
    pub executed_count: usize,
}

impl CascadeRun {
    pub fn new(
        run_id: RunId,
        entity_id: impl Into<String>,
        workflow_id: impl Into<String>,
        start_node_id: impl Into<String>,
        total_count: usize,
    ) -> Self {
        Self {
            run_id,
            entity_id: entity_id.into(),
            workflow_id: workflow_id.into(),
            start_node_id: start_node_id.into(),
            status: RunStatus::Running,
            executing_node_ids: vec![],
            completed_node_ids: vec![],
            failed_node_id: None,
            skipped_node_ids: vec![],
            current_node_label: None,
            completed_count: 0,
            total_count,
            cached_count: 0,
            executed_count: 0,
        }
    }
}

/// Progress payload stored on the entity run record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub current: usize,
    pub total: usize,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub executing_nodes: Vec<String>,
    #[serde(default)]
    pub current_node_label: Option<String>,
    #[serde(default)]
    pub failed_at_node: Option<String>,
    #[serde(default)]
    pub cached: usize,
    #[serde(default)]
    pub executed: usize,
}

impl From<&CascadeRun> for RunProgress {
    fn from(run: &CascadeRun) -> Self {
        Self {
            current: run.completed_count,
            total: run.total_count,
            completed_nodes: run.completed_node_ids.clone(),
            executing_nodes: run.executing_node_ids.clone(),
            current_node_label: run.current_node_label.clone(),
            failed_at_node: run.failed_node_id.clone(),
            cached: run.cached_count,
            executed: run.executed_count,
        }
    }
}

/// Durable mirror of a cascade run, visible across sessions and to the reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRunRecord {
    pub run_id: RunId,
    pub entity_id: String,
    pub workflow_id: String,
    pub start_node_id: String,
    pub status: RecordStatus,
    pub progress: RunProgress,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRunRecord {
    pub fn from_run(run: &CascadeRun, error_message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run.run_id.clone(),
            entity_id: run.entity_id.clone(),
            workflow_id: run.workflow_id.clone(),
            start_node_id: run.start_node_id.clone(),
            status: run.status.into(),
            progress: RunProgress::from(run),
            error_message,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A shared cache bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCache {
    pub cache_id: String,
    pub name: String,
}

/// One row of shared cache data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheEntry {
    pub cache_id: String,
    pub entity_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub data: serde_json::Value,
    pub content_hash: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// A value in the master field store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRecord {
    pub entity_id: String,
    pub domain: String,
    pub field_key: String,
    pub value: serde_json::Value,
    /// When false, creating or editing this field skips human review.
    pub require_approval_create: bool,
    pub updated_at: DateTime<Utc>,
}

/// Review state of an SSOT change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(ChangeStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Mutation requested by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

string_enum!(ChangeAction {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

/// A proposed mutation of the canonical field hierarchy awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    pub change_id: String,
    pub entity_id: String,
    pub node_id: String,
    pub target_domain: String,
    pub target_path: String,
    pub action: ChangeAction,
    pub proposed_value: serde_json::Value,
    pub status: ChangeStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// Result of submitting a change for review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new pending row was created.
    Created,
    /// An identical pending row already existed.
    Duplicate,
    /// The existing pending row got a new proposed value.
    Updated,
}

/// Outcome of one destination write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationStatus {
    Written,
    Queued { change_ids: Vec<String> },
    AutoApproved { change_ids: Vec<String> },
    Skipped { reason: String },
    Failed { error: String },
}

/// Per-destination routing result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationResult {
    pub destination_id: String,
    pub status: DestinationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl DestinationResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, DestinationStatus::Failed { .. })
    }
}

/// Resolved input values a node consumes, keyed by input name.
pub type ResolvedInputs = BTreeMap<String, serde_json::Value>;

/// Cascade progress event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CascadeEvent {
    RunStarted {
        run_id: RunId,
        entity_id: String,
        workflow_id: String,
        total: usize,
    },
    NodeStarted {
        run_id: RunId,
        node_id: String,
        label: String,
    },
    NodeCached {
        run_id: RunId,
        node_id: String,
    },
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        version: u64,
        elapsed_ms: u64,
    },
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error: String,
    },
    NodeSkipped {
        run_id: RunId,
        node_id: String,
        blocked_by: String,
    },
    NodeDiscarded {
        run_id: RunId,
        node_id: String,
    },
    DestinationFailed {
        run_id: RunId,
        node_id: String,
        destination_id: String,
        error: String,
    },
    ChangeQueued {
        change_id: String,
        node_id: String,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        message: String,
    },
    RunReaped {
        run_id: RunId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_strings_roundtrip() {
        for s in ["pending", "processing", "succeeded", "failed"] {
            assert_eq!(NodeStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(RecordStatus::from_str("bogus").is_err());
    }

    #[test]
    fn record_status_terminality() {
        assert!(!RecordStatus::Pending.is_terminal());
        assert!(!RecordStatus::Processing.is_terminal());
        assert!(RecordStatus::Cancelled.is_terminal());
        assert_eq!(RecordStatus::from(RunStatus::Running), RecordStatus::Processing);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(b)), b);
    }

    #[test]
    fn progress_mirrors_run() {
        let mut run = CascadeRun::new(RunId::from_string("r1"), "acme", "wf", "a", 3);
        run.completed_node_ids.push("a".into());
        run.completed_count = 1;
        run.failed_node_id = Some("b".into());
        let progress = RunProgress::from(&run);
        assert_eq!(progress.current, 1);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.failed_at_node.as_deref(), Some("b"));
    }
}
