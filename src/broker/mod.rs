//! Job queue broker — the collaborator workers claim jobs from.
//!
//! Core components:
//! - `Broker` — claim / acknowledge protocol shared by every transport
//! - `memory` — in-process broker (tests, single-node runs)
//! - `libsql_backend` — durable broker backed by a libSQL jobs table
//! - `connection` — shared connection with retry/backoff and trust material

pub mod connection;
pub mod libsql_backend;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

pub use connection::{BrokerConnection, RetryPolicy, TrustMaterial};
pub use libsql_backend::LibSqlBroker;
pub use memory::MemoryBroker;

/// One unit of work delivered by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Queue the job was claimed from.
    pub queue: String,
    pub payload: Map<String, Value>,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

impl Job {
    /// Read a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Opaque handle identifying one active claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job together with the lease under which it was claimed.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: LeaseToken,
}

/// A claim held by a handler, able to extend itself during long work.
#[derive(Clone)]
pub struct Lease {
    token: LeaseToken,
    broker: Arc<dyn Broker>,
    duration: Duration,
}

impl Lease {
    pub fn new(token: LeaseToken, broker: Arc<dyn Broker>, duration: Duration) -> Self {
        Self {
            token,
            broker,
            duration,
        }
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Renew the claim for another lease period.
    pub async fn extend(&self) -> Result<(), BrokerError> {
        self.broker.extend_lease(&self.token, self.duration).await
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("token", &self.token)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Redelivery policy applied by broker transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total delivery attempts before a job is dropped as failed.
    pub attempts: u32,
    /// Base delay of the exponential redelivery backoff.
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

impl JobOptions {
    /// Delay before redelivering a job whose `attempt`-th delivery failed.
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

/// Claim/acknowledge protocol of a job queue.
///
/// At most one active claim per job is the broker's guarantee.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add a job to a queue. Returns the job id.
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<String, BrokerError>;

    /// Claim the next available job on `queue`, if any, for `lease`.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedJob>, BrokerError>;

    /// Acknowledge successful processing; the job is removed.
    async fn complete(&self, token: &LeaseToken) -> Result<(), BrokerError>;

    /// Acknowledge failed processing; the broker decides on redelivery.
    async fn fail(&self, token: &LeaseToken, reason: &str) -> Result<(), BrokerError>;

    /// Push the claim's expiry `by` further into the future.
    async fn extend_lease(&self, token: &LeaseToken, by: Duration) -> Result<(), BrokerError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_backoff_is_exponential() {
        let opts = JobOptions::default();
        assert_eq!(opts.redelivery_delay(1), Duration::from_secs(1));
        assert_eq!(opts.redelivery_delay(2), Duration::from_secs(2));
        assert_eq!(opts.redelivery_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn str_field_ignores_non_strings() {
        let mut payload = Map::new();
        payload.insert("fileId".into(), Value::from("F1"));
        payload.insert("count".into(), Value::from(3));
        let job = Job {
            id: "1".into(),
            queue: "q".into(),
            payload,
            attempt: 1,
        };
        assert_eq!(job.str_field("fileId"), Some("F1"));
        assert_eq!(job.str_field("count"), None);
        assert_eq!(job.str_field("missing"), None);
    }
}
