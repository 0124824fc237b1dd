//! Shared broker connection — retry/backoff policy and TLS trust material.
//!
//! One `BrokerConnection` is built at startup and cloned into every worker.
//! Each broker operation is retried on transient failures (connection
//! reset/refused, timeouts) with capped exponential backoff; exhaustion is
//! returned to the caller as `BrokerError::RetriesExhausted`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Broker, ClaimedJob, JobOptions, LeaseToken, LibSqlBroker, MemoryBroker};
use crate::config::BrokerSettings;
use crate::error::{BrokerError, ConfigError, Error};

/// Bounded exponential backoff for transient broker failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }

    /// Run `op`, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.jittered(retry);
                    warn!(op = name, retry, delay_ms = delay.as_millis() as u64, error = %e, "Transient broker error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(BrokerError::RetriesExhausted {
                        attempts: retry + 1,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Certificate trust used by TLS transports.
///
/// Seeded with the bundled web PKI roots; configured PEM material is added
/// on top.
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    roots: Arc<RootCertStore>,
    custom: usize,
}

impl TrustMaterial {
    /// Default trust store only.
    pub fn system_default() -> Self {
        Self {
            roots: Arc::new(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            }),
            custom: 0,
        }
    }

    /// Default trust store plus every certificate in `pem`.
    pub fn from_pem(key: &str, pem: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidCertificate {
            key: key.to_string(),
            message,
        };

        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let mut custom = 0;
        for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
            let cert = cert.map_err(|e| invalid(format!("{e:?}")))?;
            roots.add(cert).map_err(|e| invalid(e.to_string()))?;
            custom += 1;
        }
        if custom == 0 {
            return Err(invalid("no PEM certificates found".to_string()));
        }

        Ok(Self {
            roots: Arc::new(roots),
            custom,
        })
    }

    /// `from_pem` when material is configured, the default store otherwise.
    pub fn from_optional(key: &str, pem: Option<&str>) -> Result<Self, ConfigError> {
        match pem {
            Some(pem) => Self::from_pem(key, pem),
            None => Ok(Self::system_default()),
        }
    }

    /// Number of certificates added on top of the default roots.
    pub fn custom_certificates(&self) -> usize {
        self.custom
    }

    pub fn is_custom(&self) -> bool {
        self.custom > 0
    }

    /// rustls client configuration trusting these roots.
    pub fn client_config(&self) -> Result<rustls::ClientConfig, ConfigError> {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::InvalidCertificate {
            key: "tls".to_string(),
            message: e.to_string(),
        })?
        .with_root_certificates(Arc::clone(&self.roots))
        .with_no_client_auth();
        Ok(config)
    }
}

/// Where a libSQL-capable collaborator lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Process-local, nothing persisted.
    Memory,
    /// Local libSQL database file.
    LibSql(PathBuf),
}

impl Endpoint {
    /// Parse `memory:`, `file:<path>` or a bare filesystem path.
    pub fn parse(key: &str, url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url == "memory:" || url == "memory://" {
            return Ok(Self::Memory);
        }
        let path = url
            .strip_prefix("file://")
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);
        if path.is_empty() || path.contains("://") {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("unsupported endpoint {url:?}"),
            });
        }
        Ok(Self::LibSql(PathBuf::from(path)))
    }
}

/// The process-wide broker connection.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<dyn Broker>,
    retry: RetryPolicy,
    trust: TrustMaterial,
}

impl BrokerConnection {
    /// Wrap an existing broker.
    pub fn new(inner: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            retry,
            trust: TrustMaterial::system_default(),
        }
    }

    /// Connect to the configured broker.
    pub async fn connect(settings: &BrokerSettings, retry: RetryPolicy) -> Result<Self, Error> {
        let trust = TrustMaterial::from_optional("BROKER_CA_CERT", settings.ca_cert.as_deref())?;
        let endpoint = Endpoint::parse("BROKER_URL", &settings.url)?;

        if trust.is_custom() {
            // Both transports are process-local; nothing to negotiate TLS with.
            warn!(
                certificates = trust.custom_certificates(),
                "BROKER_CA_CERT configured for a local broker transport, ignoring"
            );
        }

        let inner: Arc<dyn Broker> = match endpoint {
            Endpoint::Memory => {
                info!("Using in-memory broker");
                Arc::new(MemoryBroker::new())
            }
            Endpoint::LibSql(path) => {
                let broker = retry
                    .run("connect", || LibSqlBroker::open(&path, JobOptions::default()))
                    .await?;
                Arc::new(broker)
            }
        };

        let conn = Self { inner, retry, trust };
        conn.ping().await?;
        debug!("Broker connection established");
        Ok(conn)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn trust(&self) -> &TrustMaterial {
        &self.trust
    }
}

#[async_trait]
impl Broker for BrokerConnection {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<String, BrokerError> {
        self.retry
            .run("enqueue", || self.inner.enqueue(queue, job_id, payload.clone()))
            .await
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedJob>, BrokerError> {
        self.retry.run("claim", || self.inner.claim(queue, lease)).await
    }

    async fn complete(&self, token: &LeaseToken) -> Result<(), BrokerError> {
        self.retry.run("complete", || self.inner.complete(token)).await
    }

    async fn fail(&self, token: &LeaseToken, reason: &str) -> Result<(), BrokerError> {
        self.retry.run("fail", || self.inner.fail(token, reason)).await
    }

    async fn extend_lease(&self, token: &LeaseToken, by: Duration) -> Result<(), BrokerError> {
        self.retry
            .run("extend_lease", || self.inner.extend_lease(token, by))
            .await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.retry.run("ping", || self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    fn reset() -> BrokerError {
        BrokerError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(30), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(5)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(reset()) } else { Ok(n) } }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(reset()) }
            })
            .await;
        match result {
            Err(BrokerError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BrokerError::Backend("bad sql".into())) }
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(Endpoint::parse("K", "memory:").unwrap(), Endpoint::Memory);
        assert_eq!(
            Endpoint::parse("K", "file:/var/lib/jobs.db").unwrap(),
            Endpoint::LibSql(PathBuf::from("/var/lib/jobs.db"))
        );
        assert_eq!(
            Endpoint::parse("K", "./jobs.db").unwrap(),
            Endpoint::LibSql(PathBuf::from("./jobs.db"))
        );
        assert!(Endpoint::parse("K", "redis://localhost:6379").is_err());
        assert!(Endpoint::parse("K", "").is_err());
    }

    #[test]
    fn trust_material_rejects_garbage() {
        assert!(TrustMaterial::from_pem("BROKER_CA_CERT", "not a certificate").is_err());
        let default = TrustMaterial::from_optional("BROKER_CA_CERT", None).unwrap();
        assert!(!default.is_custom());
        assert!(default.client_config().is_ok());
    }

    #[tokio::test]
    async fn connect_to_memory_broker() {
        let settings = BrokerSettings {
            url: "memory:".to_string(),
            ca_cert: None,
        };
        let conn = BrokerConnection::connect(&settings, RetryPolicy::none())
            .await
            .unwrap();
        conn.enqueue("q", Some("a"), Map::new()).await.unwrap();
        let claimed = conn.claim("q", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, "a");
        conn.complete(&claimed.token).await.unwrap();
    }
}
