use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    // Graph errors (fatal, raised before any node runs)
    #[error("Cycle detected in workflow graph: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Edge references unknown node: {node_id}")]
    UnknownNodeReference { node_id: String },

    #[error("Node not found in workflow {workflow_id}: {node_id}")]
    NodeNotFound { workflow_id: String, node_id: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Node errors (isolated to the node and its dependents)
    #[error("Node execution failed: {node_id}: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node timed out after {timeout_secs}s: {node_id}")]
    NodeTimeout { node_id: String, timeout_secs: u64 },

    // Destination errors (warning only)
    #[error("Destination write failed: {destination_id}: {message}")]
    DestinationWrite {
        destination_id: String,
        message: String,
    },

    #[error("Invalid destination config: {0}")]
    InvalidDestination(String),

    // Run lifecycle
    #[error("Run marked stale: {0}")]
    StaleRun(String),

    #[error("Cascade cancelled")]
    Cancelled,

    #[error("Another cascade is already running for entity {0}")]
    EntityBusy(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Execution record version conflict for {node_id}: expected {expected}")]
    VersionConflict { node_id: String, expected: u64 },

    // Change-plan review
    #[error("Invalid change plan: {0}")]
    InvalidChangePlan(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    #[error("Change already resolved: {change_id} ({status})")]
    ChangeAlreadyResolved { change_id: String, status: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CascadeError {
    /// Graph-level errors abort a cascade before any side effect.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::UnknownNodeReference { .. }
                | Self::NodeNotFound { .. }
                | Self::WorkflowNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = CascadeError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected in workflow graph: a -> b -> a");
        assert!(err.is_graph_error());
    }

    #[test]
    fn node_errors_are_not_graph_errors() {
        let err = CascadeError::NodeExecution {
            node_id: "g".into(),
            message: "boom".into(),
        };
        assert!(!err.is_graph_error());
    }
}
