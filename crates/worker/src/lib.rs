//! Waypoint worker process
//!
//! Sample workflows and activities, environment settings, and the pool
//! wiring shared by the `waypoint-worker` binary and its tests.

pub mod activities;
pub mod config;
pub mod workflows;

use std::sync::Arc;

use waypoint_durable::{WorkerPool, WorkflowStore};

pub use activities::{ProcessActivity, ProcessInput};
pub use config::Settings;
pub use workflows::{CrossLanguageInput, CrossLanguageWorkflow, GreeterWorkflow};

/// Worker pool with every sample workflow and activity registered
pub fn worker_pool(store: Arc<dyn WorkflowStore>, settings: &Settings) -> WorkerPool {
    WorkerPool::builder(store)
        .config(settings.pool_config())
        .executor_config(settings.executor_config())
        .workflow::<GreeterWorkflow>()
        .workflow::<CrossLanguageWorkflow>()
        .activity(ProcessActivity)
        .build()
}
