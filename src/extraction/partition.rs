//! Partition service client and the element format it produces.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::converter::{DEFAULT_CHUNK_CHARACTERS, TitledChunk};
use crate::broker::TrustMaterial;
use crate::config::UnstructuredSettings;
use crate::error::{ConfigError, ExtractionError};

/// Header carrying the partition service credential.
const API_KEY_HEADER: &str = "unstructured-api-key";

/// Whole-request bound for one partition call; below the default job lease.
pub const PARTITION_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<usize>,
}

/// One partitioned (and chunked) element, as written to the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub element_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ElementMetadata,
}

impl PartitionedElement {
    pub fn from_chunk(chunk: TitledChunk, filename: &str) -> Self {
        Self {
            kind: "CompositeElement".to_string(),
            element_id: uuid::Uuid::new_v4().simple().to_string(),
            text: chunk.text,
            metadata: ElementMetadata {
                filename: Some(filename.to_string()),
                page_number: Some(chunk.page),
            },
        }
    }
}

/// HTTP client for the remote partition service.
pub struct PartitionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl PartitionClient {
    pub fn new(settings: &UnstructuredSettings) -> Result<Self, ConfigError> {
        Self::with_timeout(settings, PARTITION_TIMEOUT)
    }

    pub fn with_timeout(
        settings: &UnstructuredSettings,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let trust = TrustMaterial::system_default();
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(trust.client_config()?)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "UNSTRUCTURED_API_URL".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Partition and chunk a file remotely.
    pub async fn partition(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<PartitionedElement>, ExtractionError> {
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("files", part)
            .text("chunking_strategy", "by_title")
            .text("max_characters", DEFAULT_CHUNK_CHARACTERS.to_string());

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key.expose_secret());
        }

        debug!(file_name, size, url = %self.url, "Partitioning remotely");
        let resp = request
            .send()
            .await
            .map_err(|e| ExtractionError::Remote(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::Remote(format!("HTTP {status}: {body}")));
        }
        resp.json::<Vec<PartitionedElement>>()
            .await
            .map_err(|e| ExtractionError::Remote(format!("invalid response: {e}")))
    }
}
