pub mod cache;
pub mod executor;
pub mod inputs;
pub mod json_path;
pub mod locks;
pub mod orchestrator;
pub mod progress;
pub mod reaper;
pub mod review;
pub mod router;
pub mod run_log;
pub mod shared_cache;
pub mod topology;
pub mod transport;

pub use cache::{content_hash, CacheProbe, ExecutionCache};
pub use executor::HttpNodeExecutor;
pub use locks::EntityLocks;
pub use orchestrator::{
    fail_run_directly, CascadeOptions, CascadeOrchestrator, CascadeOutcome, NodeOutcome,
    NodeRunStatus, Repositories, SystemRunOutcome, WHOLE_WORKFLOW,
};
pub use progress::ProgressReporter;
pub use reaper::StalenessReaper;
pub use review::{ChangePlan, ChangeReview, PlannedChange};
pub use router::{OutputRouter, RouteContext};
pub use run_log::RunLogger;
pub use shared_cache::SharedCacheSync;
pub use topology::Topology;
pub use transport::HttpTransport;
