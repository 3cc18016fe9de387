pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CascadeError, Result};
pub use event::EventBus;
pub use graph::{NodeKind, WorkflowEdge, WorkflowGraph, WorkflowNode};
pub use types::*;
