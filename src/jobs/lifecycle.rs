//! Lifecycle controller — starts the configured workers and the health
//! listener, waits for a shutdown trigger and tears both down in order.
//!
//! States: `Idle → Starting → Running → Stopping → Stopped`. Every started
//! worker is drained before the health listener goes away.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::health::{self, HealthState};
use super::registry::WorkerRegistry;
use super::worker::{RunningWorker, Worker};
use crate::broker::Broker;
use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Queue names to activate; names without a registration are skipped.
    pub run_workers: Vec<String>,
    /// Health listener address.
    pub bind_addr: SocketAddr,
    /// Upper bound on the drain. `None` waits for every in-flight job.
    pub drain_timeout: Option<Duration>,
}

/// Internal shutdown trigger. Cloning shares the trigger.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Request shutdown. Returns false if it was already requested.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Process signal streams. Installing them replaces the default
/// terminate action, so a signal can no longer kill a worker mid-job.
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Register SIGINT and SIGTERM (Ctrl+C elsewhere). Needs a runtime.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves on the next signal.
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigint.recv() => info!(signal = "SIGINT", "Shutdown signal"),
                _ = self.sigterm.recv() => info!(signal = "SIGTERM", "Shutdown signal"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return std::future::pending().await;
            }
            info!("Shutdown signal");
        }
    }
}

struct HealthServer {
    addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

pub struct LifecycleController {
    registry: Arc<WorkerRegistry>,
    broker: Arc<dyn Broker>,
    options: LifecycleOptions,
    state: LifecycleState,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    workers: Vec<RunningWorker>,
    started: Vec<String>,
    flags: Vec<Arc<AtomicBool>>,
    server: Option<HealthServer>,
    signals: Option<JoinHandle<()>>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        broker: Arc<dyn Broker>,
        options: LifecycleOptions,
    ) -> Self {
        let (tx, shutdown_rx) = watch::channel(false);
        Self {
            registry,
            broker,
            options,
            state: LifecycleState::Idle,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            shutdown_rx,
            workers: Vec::new(),
            started: Vec::new(),
            flags: Vec::new(),
            server: None,
            signals: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Queue names of the workers that were started.
    pub fn started_workers(&self) -> &[String] {
        &self.started
    }

    /// Running flags of the started workers, in start order.
    pub fn worker_flags(&self) -> &[Arc<AtomicBool>] {
        &self.flags
    }

    /// Health listener address while it is up.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Start the configured workers and the health listener.
    pub async fn start(&mut self) -> Result<SocketAddr, LifecycleError> {
        if self.state != LifecycleState::Idle {
            return Err(LifecycleError::InvalidState {
                action: "start".to_string(),
                state: self.state.to_string(),
            });
        }
        self.state = LifecycleState::Starting;

        // Signals must be routed to the trigger before any job can be claimed.
        match ShutdownSignals::install() {
            Ok(mut signals) => {
                let shutdown = self.shutdown.clone();
                self.signals = Some(tokio::spawn(async move {
                    signals.recv().await;
                    shutdown.trigger();
                }));
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }

        for name in &self.options.run_workers {
            let Some(descriptor) = self.registry.get(name) else {
                debug!(queue = %name, "No worker registered for queue, skipping");
                continue;
            };
            if self.started.iter().any(|s| s == name) {
                continue;
            }
            let running = Worker::new(descriptor.clone(), self.broker.clone()).start();
            self.flags.push(running.running_flag());
            self.started.push(name.clone());
            self.workers.push(running);
        }
        info!(workers = ?self.started, "Workers started");

        let bind_addr = self.options.bind_addr;
        let bound = async move {
            let listener = TcpListener::bind(bind_addr).await?;
            let addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, addr))
        };
        let (listener, addr) = match bound.await {
            Ok(bound) => bound,
            Err(e) => {
                let err = LifecycleError::Bind {
                    port: bind_addr.port(),
                    reason: e.to_string(),
                };
                error!(error = %err, "Health listener failed, stopping workers");
                if let Err(e) = self.drain().await {
                    warn!(error = %e, "Workers did not drain cleanly");
                }
                self.release_signals();
                self.state = LifecycleState::Stopped;
                return Err(err);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = health::router(HealthState::new(self.flags.clone()));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });
        info!(%addr, "Health listener started");

        self.server = Some(HealthServer {
            addr,
            stop_tx,
            handle,
        });
        self.state = LifecycleState::Running;
        Ok(addr)
    }

    /// Wait for SIGINT/SIGTERM or an internal trigger. Signals are routed
    /// into the trigger by `start`.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        // Only fails once every sender is gone; the controller holds one.
        let _ = rx.wait_for(|requested| *requested).await;
        info!("Shutdown requested");
    }

    /// Drain every worker, then stop the health listener. Stopping twice is
    /// a no-op.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Stopping | LifecycleState::Stopped => return Ok(()),
            LifecycleState::Idle => {
                self.state = LifecycleState::Stopped;
                return Ok(());
            }
            LifecycleState::Starting | LifecycleState::Running => {}
        }
        self.state = LifecycleState::Stopping;
        info!(workers = self.workers.len(), "Stopping workers");

        let drained = self.drain().await;

        if let Some(server) = self.server.take() {
            let _ = server.stop_tx.send(());
            match server.handle.await {
                Ok(Ok(())) => debug!("Health listener stopped"),
                Ok(Err(e)) => error!(error = %e, "Health listener failed"),
                Err(e) => error!(error = %e, "Health listener task failed"),
            }
        }

        self.release_signals();
        self.state = LifecycleState::Stopped;
        info!("Worker pool stopped");
        drained
    }

    fn release_signals(&mut self) {
        if let Some(task) = self.signals.take() {
            task.abort();
        }
    }

    /// Start, wait for a shutdown trigger, stop.
    pub async fn run(mut self) -> Result<(), LifecycleError> {
        self.start().await?;
        self.wait_for_shutdown().await;
        self.stop().await
    }

    /// Close every worker, then wait for their loops, bounded by the drain
    /// timeout when one is set.
    async fn drain(&mut self) -> Result<(), LifecycleError> {
        let workers = std::mem::take(&mut self.workers);
        for worker in &workers {
            worker.close();
        }

        let queues: Vec<String> = workers.iter().map(|w| w.queue().to_string()).collect();
        let handles: Vec<JoinHandle<()>> = workers.into_iter().map(RunningWorker::into_handle).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = futures::future::join_all(handles);

        let results = match self.options.drain_timeout {
            None => joined.await,
            Some(timeout) => match tokio::time::timeout(timeout, joined).await {
                Ok(results) => results,
                Err(_) => {
                    let mut abandoned = 0;
                    for (queue, abort) in queues.iter().zip(&aborts) {
                        if !abort.is_finished() {
                            warn!(queue = %queue, "Worker still busy at drain deadline, aborting");
                            abort.abort();
                            abandoned += 1;
                        }
                    }
                    return Err(LifecycleError::DrainTimeout { timeout, abandoned });
                }
            },
        };

        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                error!(queue = %queue, error = %e, "Worker task ended abnormally");
            }
        }
        Ok(())
    }
}
