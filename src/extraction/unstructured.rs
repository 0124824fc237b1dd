//! `unstructured-opensource` and `unstructured-api` backends.
//!
//! Both produce one JSON array of title-chunked elements. The open-source
//! flavour partitions with the local converter; the API flavour sends the
//! file to the remote partition service.

use serde_json::Value;
use tracing::{debug, info};

use super::converter::{DEFAULT_CHUNK_CHARACTERS, chunk_by_title, convert_blocking};
use super::partition::PartitionedElement;
use super::{ExtractionBackend, ExtractionContext, ExtractionRecord};
use crate::broker::Lease;
use crate::error::{ExtractionError, JobError};
use crate::store::Update;

const EXTRACTION_DIR: &str = "unstructured";

/// Artifact key for a stored file.
pub fn artifact_key(storage_id: &str) -> String {
    format!("{EXTRACTION_DIR}/{storage_id}.json")
}

pub(super) async fn process(
    record: &ExtractionRecord,
    ctx: &ExtractionContext,
    backend: ExtractionBackend,
    lease: &Lease,
) -> Result<(), JobError> {
    let storage_id = record.require_storage_id()?;
    let file_name = record.file_name().to_string();

    let elements = match backend {
        ExtractionBackend::UnstructuredApi => {
            let client = ctx
                .partitioner
                .clone()
                .ok_or_else(|| JobError::IntegrationUnavailable(backend.to_string()))?;
            let bytes = ctx.download(storage_id).await?;
            lease.extend().await?;
            debug!(file_id = %record.id, url = client.url(), "Partitioning via API");
            client.partition(&file_name, bytes).await?
        }
        _ => {
            let converter = ctx.converter(backend)?;
            let bytes = ctx.download(storage_id).await?;
            lease.extend().await?;
            let doc = convert_blocking(
                converter,
                file_name.clone(),
                record.mime_type.clone(),
                bytes,
                ctx.limits,
            )
            .await?;
            chunk_by_title(&doc.elements, DEFAULT_CHUNK_CHARACTERS)
                .into_iter()
                .map(|chunk| PartitionedElement::from_chunk(chunk, &file_name))
                .collect()
        }
    };

    let key = artifact_key(storage_id);
    let body = serde_json::to_vec(&elements).map_err(ExtractionError::from)?;
    ctx.blobs.put(&ctx.bucket, &key, body, "application/json").await?;

    let update = Update::new()
        .set("extraction.jobId", Value::Null)
        .set("extraction.storageId", key.as_str());
    ctx.finish(record, update).await?;

    info!(file_id = %record.id, storage_id, %backend, elements = elements.len(), "Unstructured extraction stored");
    Ok(())
}
