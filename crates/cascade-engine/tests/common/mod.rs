#![allow(dead_code)]

use std::sync::Arc;

use cascade_core::config::EngineConfig;
use cascade_core::event::EventBus;
use cascade_core::graph::WorkflowGraph;
use cascade_core::traits::WorkflowStore;
use cascade_engine::{ChangeReview, CascadeOrchestrator, OutputRouter, Repositories};
use cascade_store::SqliteStore;
use cascade_test_utils::{memory_store, MockExecutor, MockTransport};

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub executor: Arc<MockExecutor>,
    pub transport: Arc<MockTransport>,
    pub bus: Arc<EventBus>,
    pub orchestrator: Arc<CascadeOrchestrator>,
}

pub fn harness(executor: MockExecutor) -> Harness {
    harness_with(executor, MockTransport::new(), EngineConfig::default())
}

pub fn harness_with(
    executor: MockExecutor,
    transport: MockTransport,
    config: EngineConfig,
) -> Harness {
    let store = memory_store();
    let executor = Arc::new(executor);
    let transport = Arc::new(transport);
    let bus = Arc::new(EventBus::default());

    let review = Arc::new(ChangeReview::new(store.clone(), bus.clone()));
    let router = Arc::new(OutputRouter::new(
        store.clone(),
        store.clone(),
        review,
        transport.clone(),
        bus.clone(),
    ));
    let orchestrator = Arc::new(CascadeOrchestrator::new(
        &config,
        Repositories::from_store(store.clone()),
        executor.clone(),
        router,
        bus.clone(),
    ));

    Harness {
        store,
        executor,
        transport,
        bus,
        orchestrator,
    }
}

impl Harness {
    pub async fn install(&self, graph: WorkflowGraph) {
        self.store.save_workflow(&graph).await.unwrap();
    }
}
