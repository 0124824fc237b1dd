//! SIGTERM handling for a running worker pool.
//!
//! Kept in its own test binary: the signal is delivered to the whole test
//! process, so no other controller may be listening for it.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tokio::time::timeout;

use extraction_worker::broker::{Broker, Job, Lease, MemoryBroker};
use extraction_worker::error::JobError;
use extraction_worker::jobs::{
    JobHandler, LifecycleController, LifecycleOptions, LifecycleState, WorkerOptions,
    WorkerRegistry,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Slow;

#[async_trait]
impl JobHandler for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn handle(&self, _job: &Job, _lease: &Lease) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

fn send_sigterm() {
    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn sigterm_during_job_drains_instead_of_killing() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue("slow", Some("s1"), Map::new()).await.unwrap();

    let mut registry = WorkerRegistry::new();
    registry.register(
        "slow",
        Arc::new(Slow),
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            ..WorkerOptions::default()
        },
    );
    let mut controller = LifecycleController::new(
        Arc::new(registry),
        broker.clone(),
        LifecycleOptions {
            run_workers: vec!["slow".to_string()],
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: None,
        },
    );
    controller.start().await.unwrap();

    timeout(TEST_TIMEOUT, async {
        while broker.active().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Without a handler installed by `start`, this terminates the process.
    send_sigterm();
    timeout(TEST_TIMEOUT, controller.wait_for_shutdown())
        .await
        .unwrap();
    assert!(controller.shutdown_handle().is_triggered());
    assert_eq!(controller.state(), LifecycleState::Running);

    controller.stop().await.unwrap();
    assert_eq!(broker.completed("slow").await, vec!["s1"]);
    assert_eq!(broker.active().await, 0);
}
