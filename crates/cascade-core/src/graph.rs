use serde::{Deserialize, Serialize};

use crate::destination::{Destinations, OutputDestination};
use crate::error::{CascadeError, Result};

/// Node type. Visual-only kinds never take part in execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Ingest,
    Transform,
    Generate,
    Output,
    Note,
    Shape,
    Divider,
    FloatingEndpoint,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Transform => "transform",
            Self::Generate => "generate",
            Self::Output => "output",
            Self::Note => "note",
            Self::Shape => "shape",
            Self::Divider => "divider",
            Self::FloatingEndpoint => "floating_endpoint",
        }
    }

    pub fn is_executable(&self) -> bool {
        !matches!(
            self,
            Self::Note | Self::Shape | Self::Divider | Self::FloatingEndpoint
        )
    }
}

/// A value a node consumes from an upstream node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Upstream node id.
    pub from: String,
    /// Optional JSON path into the upstream output (`$.a.b[0]` or `a.b.0`).
    #[serde(default)]
    pub path: Option<String>,
    /// Name the value is exposed under. Defaults to the upstream node id.
    #[serde(default)]
    pub alias: Option<String>,
}

impl InputBinding {
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.from)
    }
}

/// Cross-workflow trigger: this ingest node runs when the referenced node
/// completes in another workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRef {
    pub workflow_id: String,
    pub node_id: String,
}

/// A typed processing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub paused: bool,
    /// Declared upstream inputs. Empty means "whole output of every direct
    /// executable predecessor".
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub destinations: Destinations,
    /// Shared cache ids this node's output is published to.
    #[serde(default)]
    pub shared_cache_outputs: Vec<String>,
    #[serde(default)]
    pub trigger: Option<TriggerRef>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            config: serde_json::Value::Null,
            paused: false,
            inputs: vec![],
            destinations: Destinations::default(),
            shared_cache_outputs: vec![],
            trigger: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, input: InputBinding) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_destination(mut self, destination: OutputDestination) -> Self {
        self.destinations.0.push(destination);
        self
    }

    pub fn with_shared_cache(mut self, cache_id: impl Into<String>) -> Self {
        self.shared_cache_outputs.push(cache_id.into());
        self
    }

    pub fn with_trigger(mut self, workflow_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.trigger = Some(TriggerRef {
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
        });
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Human-readable name used in progress reports.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// A directed edge between node ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    #[serde(default)]
    pub source_port: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_port: Option<String>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_port: None,
            target: target.into(),
            target_port: None,
        }
    }
}

/// A workflow: nodes in declaration order plus edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge::new(source, target));
        self
    }

    /// Parse a workflow from JSON. Destination configs of every historical
    /// shape are normalized here, once.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(CascadeError::from)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn require_node(&self, id: &str) -> Result<&WorkflowNode> {
        self.node(id).ok_or_else(|| CascadeError::NodeNotFound {
            workflow_id: self.id.clone(),
            node_id: id.to_string(),
        })
    }

    /// Ingest nodes triggered by `(workflow_id, node_id)`.
    pub fn nodes_triggered_by<'a>(
        &'a self,
        workflow_id: &'a str,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowNode> + 'a {
        self.nodes.iter().filter(move |n| {
            n.kind == NodeKind::Ingest
                && n.trigger
                    .as_ref()
                    .is_some_and(|t| t.workflow_id == workflow_id && t.node_id == node_id)
        })
    }
}
