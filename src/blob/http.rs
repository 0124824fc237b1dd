//! HTTP object gateway: `GET`/`PUT {endpoint}/{bucket}/{key}` with basic
//! credentials.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use super::BlobStore;
use crate::broker::TrustMaterial;
use crate::error::{BlobError, ConfigError};

/// Whole-request bound; well inside the job lease.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    access_key_id: String,
    secret_access_key: SecretString,
}

impl HttpBlobStore {
    pub fn new(
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: SecretString,
        trust: &TrustMaterial,
    ) -> Result<Self, ConfigError> {
        Self::with_timeout(endpoint, access_key_id, secret_access_key, trust, REQUEST_TIMEOUT)
    }

    /// Like `new`, with a custom per-request timeout.
    pub fn with_timeout(
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: SecretString,
        trust: &TrustMaterial,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(trust.client_config()?)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "BLOB_STORE_ENDPOINT".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key,
        })
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let resp = self
            .client
            .get(self.url(bucket, key))
            .basic_auth(&self.access_key_id, Some(self.secret_access_key.expose_secret()))
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status if status.is_success() => resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| BlobError::Request(e.to_string())),
            status => Err(BlobError::Request(format!("GET {bucket}/{key}: HTTP {status}"))),
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        let resp = self
            .client
            .put(self.url(bucket, key))
            .basic_auth(&self.access_key_id, Some(self.secret_access_key.expose_secret()))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BlobError::Request(format!("PUT {bucket}/{key}: HTTP {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tokio::sync::RwLock;

    use super::*;

    type Objects = Arc<RwLock<HashMap<String, Vec<u8>>>>;

    fn authorized(headers: &HeaderMap) -> bool {
        // base64("key:secret")
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Basic a2V5OnNlY3JldA==")
    }

    async fn get_object(
        State(objects): State<Objects>,
        headers: HeaderMap,
        Path(path): Path<String>,
    ) -> Result<Vec<u8>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        objects
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn put_object(
        State(objects): State<Objects>,
        headers: HeaderMap,
        Path(path): Path<String>,
        body: Bytes,
    ) -> AxumStatus {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED;
        }
        objects.write().await.insert(path, body.to_vec());
        AxumStatus::OK
    }

    async fn start_gateway() -> String {
        let objects: Objects = Arc::new(RwLock::new(HashMap::new()));
        let app = Router::new()
            .route("/{*path}", get(get_object).put(put_object))
            .with_state(objects);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn store(endpoint: &str, secret: &str) -> HttpBlobStore {
        HttpBlobStore::new(
            endpoint,
            "key",
            SecretString::from(secret),
            &TrustMaterial::system_default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_then_get() {
        let endpoint = start_gateway().await;
        let store = store(&endpoint, "secret");
        store
            .put("files", "docling/s1/chunks.json", b"[]".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(store.get("files", "docling/s1/chunks.json").await.unwrap(), b"[]");
        assert!(matches!(
            store.get("files", "missing").await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn hung_gateway_times_out() {
        let app = Router::new().route(
            "/{*path}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = HttpBlobStore::with_timeout(
            &format!("http://127.0.0.1:{port}"),
            "key",
            SecretString::from("secret"),
            &TrustMaterial::system_default(),
            Duration::from_millis(100),
        )
        .unwrap();
        let started = std::time::Instant::now();
        assert!(matches!(
            store.get("files", "s1").await,
            Err(BlobError::Request(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn bad_credentials_fail() {
        let endpoint = start_gateway().await;
        let store = store(&endpoint, "wrong");
        assert!(matches!(
            store.put("files", "a", b"x".to_vec(), "text/plain").await,
            Err(BlobError::Request(_))
        ));
    }
}
