//! Blob store — uploaded files and extraction artifacts.

pub mod fs;
pub mod http;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::TrustMaterial;
use crate::config::BlobStoreSettings;
use crate::error::{BlobError, ConfigError, Error};

pub use fs::FsBlobStore;
pub use http::HttpBlobStore;
pub use memory::MemoryBlobStore;

/// Object storage keyed by bucket and key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch an object's bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Store an object, replacing any previous content.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError>;
}

/// Connect to the configured blob store.
pub fn connect(settings: &BlobStoreSettings) -> Result<Arc<dyn BlobStore>, Error> {
    let endpoint = settings.endpoint.trim();

    if endpoint == "memory:" || endpoint == "memory://" {
        info!("Using in-memory blob store");
        return Ok(Arc::new(MemoryBlobStore::new()));
    }
    if let Some(root) = endpoint.strip_prefix("file://") {
        info!(root, "Using filesystem blob store");
        return Ok(Arc::new(FsBlobStore::new(PathBuf::from(root))));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        let trust =
            TrustMaterial::from_optional("BLOB_STORE_CA_CERT", settings.ca_cert.as_deref())?;
        let store = HttpBlobStore::new(
            endpoint,
            &settings.access_key_id,
            settings.secret_access_key.clone(),
            &trust,
        )?;
        info!(endpoint, "Using HTTP blob store");
        return Ok(Arc::new(store));
    }

    Err(ConfigError::InvalidValue {
        key: "BLOB_STORE_ENDPOINT".to_string(),
        message: format!("unsupported endpoint {endpoint:?}"),
    }
    .into())
}
