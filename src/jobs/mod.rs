//! Job processing: registry, workers, dispatcher and the pool lifecycle.

pub mod dispatcher;
pub mod health;
pub mod lifecycle;
pub mod registry;
pub mod worker;

use std::sync::Arc;

pub use dispatcher::ExtractionDispatcher;
pub use lifecycle::{LifecycleController, LifecycleOptions, LifecycleState, ShutdownHandle};
pub use registry::WorkerRegistry;
pub use worker::{JobHandler, RunningWorker, Worker, WorkerDescriptor, WorkerOptions};

use crate::extraction::ExtractionContext;

/// Extraction jobs submitted for the Python worker pool.
pub const PYTHON_EXTRACTION_QUEUE: &str = "files:extraction:python";
/// Extraction jobs submitted for the Node worker pool.
pub const NODE_EXTRACTION_QUEUE: &str = "files:extraction:node";

/// Register every handler this node knows about.
pub fn build_registry(ctx: Arc<ExtractionContext>, options: WorkerOptions) -> WorkerRegistry {
    let dispatcher: Arc<dyn JobHandler> = Arc::new(ExtractionDispatcher::new(ctx));
    let mut registry = WorkerRegistry::new();
    registry.register(PYTHON_EXTRACTION_QUEUE, dispatcher.clone(), options);
    registry.register(NODE_EXTRACTION_QUEUE, dispatcher, options);
    registry
}
