//! Worker registry — queue name to worker descriptor.
//!
//! Built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use super::worker::{JobHandler, WorkerDescriptor, WorkerOptions};

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerDescriptor>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `queue`. A later registration for the same
    /// queue replaces the earlier one.
    pub fn register(
        &mut self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> WorkerDescriptor {
        let descriptor = WorkerDescriptor::new(queue, handler, options);
        if let Some(previous) = self.workers.insert(queue.to_string(), descriptor.clone()) {
            tracing::warn!(
                queue,
                previous = previous.handler_name(),
                "Worker registered twice, replacing previous handler"
            );
        } else {
            tracing::debug!(queue, handler = descriptor.handler_name(), "Registered worker");
        }
        descriptor
    }

    pub fn get(&self, queue: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(queue)
    }

    /// Registered queue names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
