//! In-process broker.
//!
//! Queues live in memory; leases never expire on their own since a crashed
//! worker takes the whole process (and therefore the queue) with it.
//! Finished jobs are removed; only the most recent ids are kept per queue
//! for inspection.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, ClaimedJob, Job, JobOptions, LeaseToken};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    payload: Map<String, Value>,
    attempts_made: u32,
    available_at: Instant,
}

#[derive(Debug)]
struct ActiveClaim {
    queue: String,
    entry: Entry,
}

/// Finished job ids remembered per queue by default.
pub const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Default)]
struct State {
    waiting: HashMap<String, VecDeque<Entry>>,
    active: HashMap<LeaseToken, ActiveClaim>,
    completed: HashMap<String, VecDeque<String>>,
    failed: HashMap<String, VecDeque<(String, String)>>,
}

fn remember<T>(history: &mut VecDeque<T>, limit: usize, item: T) {
    if limit == 0 {
        return;
    }
    while history.len() >= limit {
        history.pop_front();
    }
    history.push_back(item);
}

impl State {
    fn contains(&self, queue: &str, id: &str) -> bool {
        self.waiting
            .get(queue)
            .is_some_and(|q| q.iter().any(|e| e.id == id))
            || self
                .active
                .values()
                .any(|c| c.queue == queue && c.entry.id == id)
    }
}

/// In-memory broker with per-queue FIFO ordering.
pub struct MemoryBroker {
    options: JobOptions,
    history: usize,
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_options(JobOptions::default())
    }

    pub fn with_options(options: JobOptions) -> Self {
        Self {
            options,
            history: DEFAULT_HISTORY,
            state: Mutex::new(State::default()),
        }
    }

    /// Keep at most `limit` completed and failed ids per queue.
    pub fn with_history(mut self, limit: usize) -> Self {
        self.history = limit;
        self
    }

    /// Number of jobs waiting (including delayed redeliveries) on `queue`.
    pub async fn waiting(&self, queue: &str) -> usize {
        self.state.lock().await.waiting.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of jobs currently claimed across all queues.
    pub async fn active(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Most recent ids of jobs acknowledged as completed on `queue`, oldest
    /// first.
    pub async fn completed(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .completed
            .get(queue)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(job id, reason)` of jobs that exhausted their attempts on `queue`.
    pub async fn failed(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .failed
            .get(queue)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        let id = job_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Same semantics as a custom job id on a real queue: duplicates are ignored.
        if state.contains(queue, &id) {
            debug!(queue, job_id = %id, "Job already queued, skipping");
            return Ok(id);
        }

        state.waiting.entry(queue.to_string()).or_default().push_back(Entry {
            id: id.clone(),
            payload,
            attempts_made: 0,
            available_at: Instant::now(),
        });
        Ok(id)
    }

    async fn claim(&self, queue: &str, _lease: Duration) -> Result<Option<ClaimedJob>, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let Some(waiting) = state.waiting.get_mut(queue) else {
            return Ok(None);
        };
        let Some(pos) = waiting.iter().position(|e| e.available_at <= now) else {
            return Ok(None);
        };
        let Some(mut entry) = waiting.remove(pos) else {
            return Ok(None);
        };

        entry.attempts_made += 1;
        let token = LeaseToken::generate();
        let job = Job {
            id: entry.id.clone(),
            queue: queue.to_string(),
            payload: entry.payload.clone(),
            attempt: entry.attempts_made,
        };
        state.active.insert(
            token.clone(),
            ActiveClaim {
                queue: queue.to_string(),
                entry,
            },
        );
        Ok(Some(ClaimedJob { job, token }))
    }

    async fn complete(&self, token: &LeaseToken) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let claim = state.active.remove(token).ok_or_else(|| BrokerError::LeaseLost {
            token: token.to_string(),
        })?;
        let history = state.completed.entry(claim.queue).or_default();
        remember(history, self.history, claim.entry.id);
        Ok(())
    }

    async fn fail(&self, token: &LeaseToken, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let ActiveClaim { queue, mut entry } =
            state.active.remove(token).ok_or_else(|| BrokerError::LeaseLost {
                token: token.to_string(),
            })?;

        if entry.attempts_made >= self.options.attempts {
            debug!(queue = %queue, job_id = %entry.id, "Job exhausted its attempts");
            let history = state.failed.entry(queue).or_default();
            remember(history, self.history, (entry.id, reason.to_string()));
        } else {
            entry.available_at =
                Instant::now() + self.options.redelivery_delay(entry.attempts_made);
            state.waiting.entry(queue).or_default().push_back(entry);
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &LeaseToken, _by: Duration) -> Result<(), BrokerError> {
        let state = self.state.lock().await;
        if state.active.contains_key(token) {
            Ok(())
        } else {
            Err(BrokerError::LeaseLost {
                token: token.to_string(),
            })
        }
    }
}
