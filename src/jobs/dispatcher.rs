//! Extraction job dispatcher.
//!
//! Validates the job payload, loads the referenced `file` record and routes
//! it to the routine for its backend tag. Validation failures happen before
//! any write.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::worker::JobHandler;
use crate::broker::{Job, Lease};
use crate::error::JobError;
use crate::extraction::{ExtractionBackend, ExtractionContext, ExtractionRecord, Routine};
use crate::store::{FILE_COLLECTION, Filter};

pub struct ExtractionDispatcher {
    ctx: Arc<ExtractionContext>,
}

impl ExtractionDispatcher {
    pub fn new(ctx: Arc<ExtractionContext>) -> Self {
        Self { ctx }
    }

    /// Route one job; errors are returned untouched.
    pub async fn dispatch(&self, job: &Job, lease: &Lease) -> Result<(), JobError> {
        let file_id = job
            .str_field("fileId")
            .ok_or_else(|| JobError::MissingField("fileId".to_string()))?;

        let document = self
            .ctx
            .documents
            .find_one(FILE_COLLECTION, &Filter::by_id(file_id))
            .await?
            .ok_or_else(|| JobError::RecordNotFound(file_id.to_string()))?;
        let record = ExtractionRecord::from_document(file_id, document)?;

        let routine = ExtractionBackend::from_tag(&record.backend)
            .and_then(Routine::for_backend)
            .ok_or_else(|| JobError::UnsupportedBackend(record.backend.clone()))?;

        debug!(file_id, backend = %record.backend, "Dispatching extraction");
        routine.process(&record, &self.ctx, lease).await
    }
}

#[async_trait]
impl JobHandler for ExtractionDispatcher {
    fn name(&self) -> &str {
        "extraction"
    }

    async fn handle(&self, job: &Job, lease: &Lease) -> Result<(), JobError> {
        match self.dispatch(job, lease).await {
            // Redelivery would fail the same way until the node is reconfigured.
            Err(JobError::IntegrationUnavailable(backend)) => {
                warn!(
                    file_id = job.str_field("fileId").unwrap_or_default(),
                    %backend,
                    "Extraction integration unavailable, dropping job"
                );
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, Value, json};

    use super::*;
    use crate::blob::{BlobStore, MemoryBlobStore};
    use crate::broker::{Broker, MemoryBroker};
    use crate::extraction::{ConversionLimits, Converter, PlainTextConverter};
    use crate::store::{DocumentStore, MemoryDocumentStore};

    struct Harness {
        dispatcher: ExtractionDispatcher,
        documents: Arc<MemoryDocumentStore>,
        blobs: Arc<MemoryBlobStore>,
        broker: Arc<MemoryBroker>,
    }

    fn harness(converter: bool) -> Harness {
        let documents = Arc::new(MemoryDocumentStore::new("test"));
        let blobs = Arc::new(MemoryBlobStore::new());
        let converter: Option<Arc<dyn Converter>> =
            converter.then(|| Arc::new(PlainTextConverter::new()) as Arc<dyn Converter>);
        let ctx = ExtractionContext {
            documents: documents.clone(),
            blobs: blobs.clone(),
            bucket: "files".into(),
            converter,
            partitioner: None,
            limits: ConversionLimits::default(),
        };
        Harness {
            dispatcher: ExtractionDispatcher::new(Arc::new(ctx)),
            documents,
            blobs,
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    impl Harness {
        async fn claim(&self, payload: Value) -> (Job, Lease) {
            let Value::Object(map) = payload else {
                panic!("payload must be an object");
            };
            self.broker.enqueue("q", None, map).await.unwrap();
            let claimed = self
                .broker
                .claim("q", Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            let lease = Lease::new(claimed.token, self.broker.clone(), Duration::from_secs(30));
            (claimed.job, lease)
        }

        async fn seed(&self, doc: Value) {
            self.documents.insert_one(FILE_COLLECTION, doc).await.unwrap();
        }
    }

    #[tokio::test]
    async fn missing_file_id_touches_nothing() {
        let h = harness(true);
        let (job, lease) = h.claim(Value::Object(Map::new())).await;
        assert!(matches!(
            h.dispatcher.handle(&job, &lease).await,
            Err(JobError::MissingField(f)) if f == "fileId"
        ));
        assert_eq!(h.documents.reads(), 0);
        assert_eq!(h.documents.writes(), 0);
        assert!(h.blobs.keys("files").await.is_empty());
    }

    #[tokio::test]
    async fn absent_record_is_not_found() {
        let h = harness(true);
        let (job, lease) = h.claim(json!({"fileId": "F2"})).await;
        assert!(matches!(
            h.dispatcher.handle(&job, &lease).await,
            Err(JobError::RecordNotFound(id)) if id == "F2"
        ));
        assert_eq!(h.documents.writes(), 0);
    }

    #[tokio::test]
    async fn record_without_extraction_state() {
        let h = harness(true);
        h.seed(json!({"_id": "F1", "storageId": "s1"})).await;
        let (job, lease) = h.claim(json!({"fileId": "F1"})).await;
        assert!(matches!(
            h.dispatcher.handle(&job, &lease).await,
            Err(JobError::MissingExtractionState(_))
        ));
    }

    #[tokio::test]
    async fn unknown_and_foreign_backends_are_unsupported() {
        let h = harness(true);
        h.seed(json!({"_id": "F1", "extraction": {"backend": "tika", "jobId": "J"}})).await;
        h.seed(json!({"_id": "F2", "extraction": {"backend": "wdu", "jobId": "J"}})).await;

        for (file_id, tag) in [("F1", "tika"), ("F2", "wdu")] {
            let (job, lease) = h.claim(json!({"fileId": file_id})).await;
            assert!(matches!(
                h.dispatcher.handle(&job, &lease).await,
                Err(JobError::UnsupportedBackend(t)) if t == tag
            ));
        }
        assert_eq!(h.documents.writes(), 0);
    }

    #[tokio::test]
    async fn unavailable_integration_drops_job() {
        let h = harness(false);
        h.seed(json!({"_id": "F1", "storageId": "s1",
                      "extraction": {"backend": "docling", "jobId": "J"}}))
            .await;
        let (job, lease) = h.claim(json!({"fileId": "F1"})).await;
        assert!(matches!(
            h.dispatcher.dispatch(&job, &lease).await,
            Err(JobError::IntegrationUnavailable(_))
        ));
        h.dispatcher.handle(&job, &lease).await.unwrap();
        assert_eq!(h.documents.writes(), 0);
    }

    #[tokio::test]
    async fn docling_job_completes_once() {
        let h = harness(true);
        h.seed(json!({"_id": "F1", "filename": "a.md", "storageId": "s1",
                      "extraction": {"backend": "docling", "jobId": "J"}}))
            .await;
        h.blobs
            .put("files", "s1", b"# A\n\nBody.".to_vec(), "text/markdown")
            .await
            .unwrap();

        let (job, lease) = h.claim(json!({"fileId": "F1"})).await;
        h.dispatcher.handle(&job, &lease).await.unwrap();
        assert_eq!(h.documents.writes(), 1);

        let stored = h
            .documents
            .find_one(FILE_COLLECTION, &Filter::by_id("F1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["extraction"]["jobId"], Value::Null);

        assert!(matches!(
            h.dispatcher.handle(&job, &lease).await,
            Err(JobError::RecordVanished(_))
        ));
    }
}
