//! Process-scoped application context.
//!
//! Built once at startup and handed to the lifecycle controller; nothing in
//! the crate reaches for global state.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::blob::{self, BlobStore};
use crate::broker::{BrokerConnection, RetryPolicy};
use crate::config::WorkerConfig;
use crate::error::Error;
use crate::extraction::{ConversionLimits, Converter, ExtractionContext, PartitionClient, PlainTextConverter};
use crate::jobs::{LifecycleController, LifecycleOptions, WorkerOptions, WorkerRegistry, build_registry};
use crate::store::{self, DocumentStore};

pub struct AppContext {
    pub config: WorkerConfig,
    pub broker: BrokerConnection,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub extraction: Arc<ExtractionContext>,
    pub registry: Arc<WorkerRegistry>,
}

impl AppContext {
    /// Open every configured connection.
    pub async fn connect(config: WorkerConfig) -> Result<Self, Error> {
        let broker = BrokerConnection::connect(&config.broker, RetryPolicy::default()).await?;
        let documents = store::connect(&config.documents).await?;
        let blobs = blob::connect(&config.blobs)?;
        Self::assemble(config, broker, documents, blobs)
    }

    /// Wire the context around already-open connections.
    pub fn assemble(
        config: WorkerConfig,
        broker: BrokerConnection,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, Error> {
        let partitioner = config
            .unstructured
            .as_ref()
            .map(PartitionClient::new)
            .transpose()?
            .map(Arc::new);
        if partitioner.is_none() {
            info!("UNSTRUCTURED_API_URL not set, unstructured-api jobs will be dropped");
        }

        let converter: Arc<dyn Converter> = Arc::new(PlainTextConverter::new());
        let extraction = Arc::new(ExtractionContext {
            documents: documents.clone(),
            blobs: blobs.clone(),
            bucket: config.blobs.bucket.clone(),
            converter: Some(converter),
            partitioner,
            limits: ConversionLimits::default(),
        });
        let registry = Arc::new(build_registry(extraction.clone(), WorkerOptions::default()));

        Ok(Self {
            config,
            broker,
            documents,
            blobs,
            extraction,
            registry,
        })
    }

    /// Lifecycle controller for the configured worker names.
    pub fn lifecycle(&self) -> LifecycleController {
        LifecycleController::new(
            self.registry.clone(),
            Arc::new(self.broker.clone()),
            LifecycleOptions {
                run_workers: self.config.run_workers.clone(),
                bind_addr: SocketAddr::from(([0, 0, 0, 0], self.config.port)),
                drain_timeout: self.config.drain_timeout,
            },
        )
    }
}
