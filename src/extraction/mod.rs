//! Extraction routines — one per backend tag.
//!
//! A routine downloads the uploaded file, produces artifacts in the blob
//! store and, as its last step, issues exactly one conditional update that
//! clears `extraction.jobId` and records the artifact locators.

pub mod converter;
pub mod docling;
pub mod partition;
pub mod unstructured;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobStore;
use crate::broker::Lease;
use crate::error::JobError;
use crate::store::{DocumentStore, FILE_COLLECTION, Filter, Update};

pub use converter::{ConversionLimits, Converter, PlainTextConverter};
pub use partition::PartitionClient;

/// Backend tag stored at `extraction.backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionBackend {
    Docling,
    Wdu,
    UnstructuredOpensource,
    UnstructuredApi,
}

impl ExtractionBackend {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "docling" => Some(Self::Docling),
            "wdu" => Some(Self::Wdu),
            "unstructured-opensource" => Some(Self::UnstructuredOpensource),
            "unstructured-api" => Some(Self::UnstructuredApi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docling => "docling",
            Self::Wdu => "wdu",
            Self::UnstructuredOpensource => "unstructured-opensource",
            Self::UnstructuredApi => "unstructured-api",
        }
    }
}

impl fmt::Display for ExtractionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields of a `file` record an extraction routine reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRecord {
    pub id: String,
    pub filename: Option<String>,
    pub storage_id: Option<String>,
    pub mime_type: Option<String>,
    /// Raw `extraction.backend` value; may be unrecognised.
    pub backend: String,
    /// The whole stored document.
    pub document: Value,
}

impl ExtractionRecord {
    /// Read the extraction view of a loaded record.
    pub fn from_document(id: &str, document: Value) -> Result<Self, JobError> {
        let extraction = document
            .get("extraction")
            .filter(|e| e.is_object())
            .ok_or_else(|| JobError::MissingExtractionState(id.to_string()))?;
        let backend = match extraction.get("backend") {
            Some(Value::String(tag)) => tag.clone(),
            Some(other) => return Err(JobError::UnsupportedBackend(other.to_string())),
            None => return Err(JobError::UnsupportedBackend("<missing>".to_string())),
        };

        let text = |key: &str| document.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            id: id.to_string(),
            filename: text("filename"),
            storage_id: text("storageId"),
            mime_type: text("mimeType"),
            backend,
            document,
        })
    }

    pub fn require_storage_id(&self) -> Result<&str, JobError> {
        self.storage_id
            .as_deref()
            .ok_or_else(|| JobError::MissingField("storageId".to_string()))
    }

    /// Name used for type discrimination; falls back to the storage id.
    pub fn file_name(&self) -> &str {
        self.filename
            .as_deref()
            .or(self.storage_id.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Collaborators an extraction routine works with.
pub struct ExtractionContext {
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    /// Bucket holding both uploads and artifacts.
    pub bucket: String,
    /// Local converter; `None` disables the local backends on this node.
    pub converter: Option<Arc<dyn Converter>>,
    /// Remote partition service; `None` disables `unstructured-api`.
    pub partitioner: Option<Arc<PartitionClient>>,
    pub limits: ConversionLimits,
}

impl ExtractionContext {
    /// Download the record's uploaded file.
    pub(crate) async fn download(&self, storage_id: &str) -> Result<Vec<u8>, JobError> {
        let bytes = self.blobs.get(&self.bucket, storage_id).await?;
        self.limits.check_size(bytes.len())?;
        Ok(bytes)
    }

    pub(crate) fn converter(&self, backend: ExtractionBackend) -> Result<Arc<dyn Converter>, JobError> {
        self.converter
            .clone()
            .ok_or_else(|| JobError::IntegrationUnavailable(backend.to_string()))
    }

    /// The single terminal write of a routine: `$set` on the record, scoped
    /// by its id. A zero modified count fails the job.
    pub(crate) async fn finish(&self, record: &ExtractionRecord, update: Update) -> Result<(), JobError> {
        let result = self
            .documents
            .update_one(FILE_COLLECTION, &Filter::by_id(&record.id), &update)
            .await?;
        if result.modified_count == 0 {
            return Err(JobError::RecordVanished(record.id.clone()));
        }
        Ok(())
    }
}

/// Closed set of extraction routines this node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    Docling,
    /// Carries the tag so the routine can pick local or remote partitioning.
    Unstructured(ExtractionBackend),
}

impl Routine {
    /// Routine for a backend, or `None` when this node does not handle it.
    pub fn for_backend(backend: ExtractionBackend) -> Option<Self> {
        match backend {
            ExtractionBackend::Docling => Some(Self::Docling),
            ExtractionBackend::UnstructuredOpensource | ExtractionBackend::UnstructuredApi => {
                Some(Self::Unstructured(backend))
            }
            ExtractionBackend::Wdu => None,
        }
    }

    pub async fn process(
        &self,
        record: &ExtractionRecord,
        ctx: &ExtractionContext,
        lease: &Lease,
    ) -> Result<(), JobError> {
        match self {
            Self::Docling => docling::process(record, ctx, lease).await,
            Self::Unstructured(backend) => unstructured::process(record, ctx, *backend, lease).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn backend_tags_roundtrip() {
        for tag in ["docling", "wdu", "unstructured-opensource", "unstructured-api"] {
            let backend = ExtractionBackend::from_tag(tag).unwrap();
            assert_eq!(backend.as_str(), tag);
            assert_eq!(serde_json::to_value(backend).unwrap(), json!(tag));
        }
        assert_eq!(ExtractionBackend::from_tag("tika"), None);
    }

    #[test]
    fn wdu_has_no_routine_here() {
        assert_eq!(Routine::for_backend(ExtractionBackend::Wdu), None);
        assert_eq!(
            Routine::for_backend(ExtractionBackend::UnstructuredApi),
            Some(Routine::Unstructured(ExtractionBackend::UnstructuredApi))
        );
    }

    #[test]
    fn record_parsing() {
        let record = ExtractionRecord::from_document(
            "F1",
            json!({"_id": "F1", "storageId": "s1", "mimeType": "text/plain",
                   "extraction": {"backend": "docling", "jobId": "J1"}}),
        )
        .unwrap();
        assert_eq!(record.backend, "docling");
        assert_eq!(record.file_name(), "s1");
        assert_eq!(record.require_storage_id().unwrap(), "s1");

        assert!(matches!(
            ExtractionRecord::from_document("F1", json!({"_id": "F1"})),
            Err(JobError::MissingExtractionState(id)) if id == "F1"
        ));
        assert!(matches!(
            ExtractionRecord::from_document("F1", json!({"_id": "F1", "extraction": null})),
            Err(JobError::MissingExtractionState(_))
        ));
        assert!(matches!(
            ExtractionRecord::from_document("F1", json!({"_id": "F1", "extraction": {"backend": 3}})),
            Err(JobError::UnsupportedBackend(tag)) if tag == "3"
        ));
    }
}
