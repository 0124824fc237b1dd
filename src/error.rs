//! Error types for the extraction worker.

use std::time::Duration;

/// Top-level error type for the worker process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid trust material for {key}: {message}")]
    InvalidCertificate { key: String, message: String },
}

/// Queue broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker backend error: {0}")]
    Backend(String),

    #[error("Lease {token} is no longer held")]
    LeaseLost { token: String },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<BrokerError> },
}

impl BrokerError {
    /// Whether the connection layer should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Document store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid update path: {0}")]
    InvalidPath(String),
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Blob store request failed: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised inside an extraction routine.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Unsupported input type {mime_type} for {backend}")]
    UnsupportedInput { backend: String, mime_type: String },

    #[error("Input of {size} bytes exceeds the {max} byte limit")]
    InputTooLarge { size: usize, max: usize },

    #[error("Document has {pages} pages, limit is {max}")]
    TooManyPages { pages: usize, max: usize },

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Partition service failed: {0}")]
    Remote(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-job failures surfaced to the broker.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job payload is missing field {0}")]
    MissingField(String),

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error("Record {0} has no extraction state")]
    MissingExtractionState(String),

    #[error("Unsupported extraction backend: {0}")]
    UnsupportedBackend(String),

    #[error("Record {0} vanished before its extraction could be recorded")]
    RecordVanished(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Integration for backend {0} is unavailable")]
    IntegrationUnavailable(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        Self::Connection(format!("document store: {e}"))
    }
}

impl From<BlobError> for JobError {
    fn from(e: BlobError) -> Self {
        Self::Connection(format!("blob store: {e}"))
    }
}

impl From<BrokerError> for JobError {
    fn from(e: BrokerError) -> Self {
        Self::Connection(format!("broker: {e}"))
    }
}

/// Worker pool lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot {action} while {state}")]
    InvalidState { action: String, state: String },

    #[error("Failed to bind health listener on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Drain deadline of {timeout:?} exceeded, {abandoned} worker(s) aborted")]
    DrainTimeout { timeout: Duration, abandoned: usize },
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
