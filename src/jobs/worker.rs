//! Worker — a named consumption loop bound to one queue and one handler.
//!
//! Construction never starts consumption. [`Worker::start`] spawns the loop
//! and returns a [`RunningWorker`]; [`RunningWorker::close`] stops further
//! claims and lets an in-flight handler finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{Broker, ClaimedJob, Job, Lease};
use crate::error::{ExtractionError, JobError};

/// Processing handler invoked once per claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Name recorded on every job span.
    fn name(&self) -> &str;

    /// Process one job. `lease` may be used to extend the claim.
    async fn handle(&self, job: &Job, lease: &Lease) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Claim duration requested from the broker.
    pub lease: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Sleep after an infrastructure error.
    pub idle_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            idle_backoff: Duration::from_secs(5),
        }
    }
}

/// Immutable registration of a worker.
#[derive(Clone)]
pub struct WorkerDescriptor {
    queue: String,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
}

impl WorkerDescriptor {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn JobHandler>, options: WorkerOptions) -> Self {
        Self {
            queue: queue.into(),
            handler,
            options,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }
}

impl std::fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("queue", &self.queue)
            .field("handler", &self.handler.name())
            .field("options", &self.options)
            .finish()
    }
}

/// A constructed, not yet consuming worker.
pub struct Worker {
    descriptor: WorkerDescriptor,
    broker: Arc<dyn Broker>,
}

impl Worker {
    pub fn new(descriptor: WorkerDescriptor, broker: Arc<dyn Broker>) -> Self {
        Self { descriptor, broker }
    }

    pub fn queue(&self) -> &str {
        self.descriptor.queue()
    }

    /// Spawn the consumption loop.
    pub fn start(self) -> RunningWorker {
        let running = Arc::new(AtomicBool::new(true));
        let (close_tx, close_rx) = watch::channel(false);
        let descriptor = self.descriptor.clone();

        let consumer = Consumer {
            descriptor: self.descriptor,
            broker: self.broker,
            running: running.clone(),
        };
        let handle = tokio::spawn(consumer.run(close_rx));

        RunningWorker {
            descriptor,
            running,
            close_tx,
            handle,
        }
    }
}

/// A worker whose loop has been spawned.
pub struct RunningWorker {
    descriptor: WorkerDescriptor,
    running: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningWorker {
    pub fn queue(&self) -> &str {
        self.descriptor.queue()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared running flag, read by the health endpoint.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Stop claiming new jobs. An in-flight handler runs to completion.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        // The loop may already have exited; nothing to signal then.
        let _ = self.close_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the consumption loop to exit.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }

    /// Split into the loop handle, for callers that race it against a deadline.
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Clears the running flag however the loop exits.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Consumer {
    descriptor: WorkerDescriptor,
    broker: Arc<dyn Broker>,
    running: Arc<AtomicBool>,
}

impl Consumer {
    async fn run(self, mut close_rx: watch::Receiver<bool>) {
        let _guard = RunningGuard(self.running.clone());
        let queue = self.descriptor.queue.clone();
        let options = self.descriptor.options;
        info!(queue = %queue, handler = self.descriptor.handler.name(), "Worker started");

        loop {
            if *close_rx.borrow() {
                break;
            }
            // Claims are never cancelled midway, so a claimed job is always processed.
            match self.broker.claim(&queue, options.lease).await {
                Ok(Some(claimed)) => self.process(claimed).await,
                Ok(None) => {
                    if wait_or_close(&mut close_rx, options.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Worker error");
                    if wait_or_close(&mut close_rx, options.idle_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(queue = %queue, "Worker closed");
    }

    async fn process(&self, claimed: ClaimedJob) {
        let ClaimedJob { job, token } = claimed;
        let span = info_span!(
            "job",
            queue = %job.queue,
            job_id = %job.id,
            name = self.descriptor.handler.name(),
            attempt = job.attempt
        );

        async {
            debug!("Job active");
            let lease = Lease::new(token.clone(), self.broker.clone(), self.descriptor.options.lease);
            let outcome = AssertUnwindSafe(self.descriptor.handler.handle(&job, &lease))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ExtractionError::Panicked(panic_message(&*panic)).into()));

            match outcome {
                Ok(()) => match self.broker.complete(&token).await {
                    Ok(()) => info!("Job completed"),
                    Err(e) => error!(error = %e, "Worker error: failed to acknowledge completed job"),
                },
                Err(e) => {
                    warn!(error = %e, "Job failed");
                    if let Err(ack) = self.broker.fail(&token, &e.to_string()).await {
                        error!(error = %ack, "Worker error: failed to record job failure");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler: {detail}")
}

/// Sleep for `period` unless closed first. Returns true when closed.
async fn wait_or_close(close_rx: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = close_rx.changed() => changed.is_err() || *close_rx.borrow(),
        _ = tokio::time::sleep(period) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::{Map, Value};
    use tokio::sync::Notify;

    use super::*;
    use crate::broker::{JobOptions, MemoryBroker};

    fn fast() -> WorkerOptions {
        WorkerOptions {
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            idle_backoff: Duration::from_millis(10),
        }
    }

    fn payload(file_id: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("fileId".into(), Value::from(file_id));
        map
    }

    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, job: &Job, lease: &Lease) -> Result<(), JobError> {
            lease.extend().await?;
            self.seen.fetch_add(1, Ordering::SeqCst);
            match job.str_field("fileId") {
                Some("bad") => Err(JobError::MissingField("fileId".into())),
                Some("boom") => panic!("boom"),
                _ => Ok(()),
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn acknowledges_success_and_failure() {
        let broker = Arc::new(MemoryBroker::with_options(JobOptions {
            attempts: 1,
            backoff: Duration::from_millis(1),
        }));
        broker.enqueue("q", Some("ok"), payload("F1")).await.unwrap();
        broker.enqueue("q", Some("bad"), payload("bad")).await.unwrap();
        broker.enqueue("q", Some("boom"), payload("boom")).await.unwrap();

        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let worker = Worker::new(WorkerDescriptor::new("q", handler.clone(), fast()), broker.clone());
        let running = worker.start();
        assert!(running.is_running());

        wait_until(|| handler.seen.load(Ordering::SeqCst) == 3).await;
        running.close();
        assert!(!running.is_running());
        running.join().await.unwrap();

        assert_eq!(broker.completed("q").await, vec!["ok"]);
        let failed = broker.failed("q").await;
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().any(|(id, reason)| id == "boom" && reason.contains("panicked: handler: boom")));
        assert_eq!(broker.active().await, 0);
    }

    struct Blocking {
        started: Notify,
        release: Notify,
        finished: AtomicBool,
    }

    #[async_trait]
    impl JobHandler for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn handle(&self, _job: &Job, _lease: &Lease) -> Result<(), JobError> {
            self.started.notify_one();
            self.release.notified().await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_lets_in_flight_job_finish() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue("q", Some("1"), payload("F1")).await.unwrap();
        let handler = Arc::new(Blocking {
            started: Notify::new(),
            release: Notify::new(),
            finished: AtomicBool::new(false),
        });
        let running =
            Worker::new(WorkerDescriptor::new("q", handler.clone(), fast()), broker.clone()).start();

        handler.started.notified().await;
        running.close();
        assert!(!running.is_finished());

        handler.release.notify_one();
        running.join().await.unwrap();
        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(broker.completed("q").await, vec!["1"]);
    }

    #[tokio::test]
    async fn idle_worker_closes_promptly() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
        });
        let options = WorkerOptions {
            poll_interval: Duration::from_secs(60),
            ..fast()
        };
        let running = Worker::new(WorkerDescriptor::new("q", handler, options), broker).start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.close();
        tokio::time::timeout(Duration::from_secs(1), running.join())
            .await
            .unwrap()
            .unwrap();
    }
}
