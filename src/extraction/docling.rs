//! `docling` backend: structured document, markdown and chunks.

use serde_json::Value;
use tracing::{debug, info};

use super::converter::convert_blocking;
use super::{ExtractionBackend, ExtractionContext, ExtractionRecord};
use crate::broker::Lease;
use crate::error::{ExtractionError, JobError};
use crate::store::Update;

const EXTRACTION_DIR: &str = "docling";

/// Artifact keys for one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoclingArtifacts {
    pub document: String,
    pub text: String,
    pub chunks: String,
}

impl DoclingArtifacts {
    pub fn for_storage_id(storage_id: &str) -> Self {
        Self {
            document: format!("{EXTRACTION_DIR}/{storage_id}/document.json"),
            text: format!("{EXTRACTION_DIR}/{storage_id}/text.md"),
            chunks: format!("{EXTRACTION_DIR}/{storage_id}/chunks.json"),
        }
    }
}

pub(super) async fn process(
    record: &ExtractionRecord,
    ctx: &ExtractionContext,
    lease: &Lease,
) -> Result<(), JobError> {
    let storage_id = record.require_storage_id()?;
    let converter = ctx.converter(ExtractionBackend::Docling)?;

    let bytes = ctx.download(storage_id).await?;
    lease.extend().await?;
    let doc = convert_blocking(
        converter,
        record.file_name().to_string(),
        record.mime_type.clone(),
        bytes,
        ctx.limits,
    )
    .await?;
    debug!(file_id = %record.id, pages = doc.pages, elements = doc.elements.len(), "Converted document");

    let artifacts = DoclingArtifacts::for_storage_id(storage_id);
    let document_json = serde_json::to_vec(&doc).map_err(ExtractionError::from)?;
    let chunks_json = serde_json::to_vec(&doc.hierarchical_chunks()).map_err(ExtractionError::from)?;

    ctx.blobs
        .put(&ctx.bucket, &artifacts.document, document_json, "application/json")
        .await?;
    ctx.blobs
        .put(&ctx.bucket, &artifacts.text, doc.to_markdown().into_bytes(), "text/markdown")
        .await?;
    ctx.blobs
        .put(&ctx.bucket, &artifacts.chunks, chunks_json, "application/json")
        .await?;

    let update = Update::new()
        .set("extraction.jobId", Value::Null)
        .set("extraction.documentStorageId", artifacts.document.as_str())
        .set("extraction.chunksStorageId", artifacts.chunks.as_str())
        .set("extraction.textStorageId", artifacts.text.as_str());
    ctx.finish(record, update).await?;

    info!(file_id = %record.id, storage_id, "Docling extraction stored");
    Ok(())
}
