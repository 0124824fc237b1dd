//! Configuration types.
//!
//! Loaded once at startup from the environment and never mutated afterwards.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default health listener port.
const DEFAULT_PORT: u16 = 8080;

/// Queue broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// `memory:` or a libSQL database path.
    pub url: String,
    /// PEM trust material for TLS transports.
    pub ca_cert: Option<String>,
}

/// Document store settings.
#[derive(Debug, Clone)]
pub struct DocumentStoreSettings {
    /// `memory:` or a libSQL database path.
    pub url: String,
    /// Logical database name; namespaces every collection.
    pub database: String,
    pub ca_cert: Option<String>,
}

/// Blob store settings.
#[derive(Debug, Clone)]
pub struct BlobStoreSettings {
    /// `memory:`, `file://<dir>` or `http(s)://host[:port]`.
    pub endpoint: String,
    /// Bucket holding uploaded files and extraction artifacts.
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub ca_cert: Option<String>,
}

/// Remote partition service used by the `unstructured-api` backend.
#[derive(Debug, Clone)]
pub struct UnstructuredSettings {
    pub api_url: String,
    pub api_key: Option<SecretString>,
}

/// Process-wide worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Health listener port.
    pub port: u16,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Queue names this node should consume.
    pub run_workers: Vec<String>,
    pub broker: BrokerSettings,
    pub documents: DocumentStoreSettings,
    pub blobs: BlobStoreSettings,
    /// `None` disables the `unstructured-api` integration.
    pub unstructured: Option<UnstructuredSettings>,
    /// Structured JSON telemetry output.
    pub telemetry_enabled: bool,
    /// Upper bound on the shutdown drain. `None` waits for every in-flight job.
    pub drain_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "PORT".to_string(),
                message: format!("{e}"),
            })?,
            None => DEFAULT_PORT,
        };

        let run_workers = parse_list(&require("RUN_WORKERS")?);
        if run_workers.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "RUN_WORKERS".to_string(),
                message: "no queue names given".to_string(),
            });
        }

        let unstructured = get("UNSTRUCTURED_API_URL").map(|api_url| UnstructuredSettings {
            api_url,
            api_key: get("UNSTRUCTURED_API_KEY").map(SecretString::from),
        });

        let telemetry_enabled = match get("TELEMETRY_DISABLED") {
            Some(raw) => !parse_bool("TELEMETRY_DISABLED", &raw)?,
            None => true,
        };

        let drain_timeout = match get("WORKER_DRAIN_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: "WORKER_DRAIN_TIMEOUT_SECS".to_string(),
                    message: format!("{e}"),
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            port,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            run_workers,
            broker: BrokerSettings {
                url: require("BROKER_URL")?,
                ca_cert: get("BROKER_CA_CERT"),
            },
            documents: DocumentStoreSettings {
                url: require("DOCUMENT_STORE_URL")?,
                database: require("DOCUMENT_STORE_DATABASE")?,
                ca_cert: get("DOCUMENT_STORE_CA_CERT"),
            },
            blobs: BlobStoreSettings {
                endpoint: require("BLOB_STORE_ENDPOINT")?,
                bucket: require("BLOB_STORE_BUCKET")?,
                access_key_id: require("BLOB_STORE_ACCESS_KEY_ID")?,
                secret_access_key: SecretString::from(require("BLOB_STORE_SECRET_ACCESS_KEY")?),
                ca_cert: get("BLOB_STORE_CA_CERT"),
            },
            unstructured,
            telemetry_enabled,
            drain_timeout,
        })
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("RUN_WORKERS", "files:extraction:python, files:extraction:node"),
            ("BROKER_URL", "memory:"),
            ("DOCUMENT_STORE_URL", "memory:"),
            ("DOCUMENT_STORE_DATABASE", "bee"),
            ("BLOB_STORE_ENDPOINT", "memory:"),
            ("BLOB_STORE_BUCKET", "files"),
            ("BLOB_STORE_ACCESS_KEY_ID", "key"),
            ("BLOB_STORE_SECRET_ACCESS_KEY", "secret"),
        ])
    }

    fn load(env: &HashMap<&str, &str>) -> Result<WorkerConfig, ConfigError> {
        WorkerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.run_workers,
            vec!["files:extraction:python", "files:extraction:node"]
        );
        assert!(config.telemetry_enabled);
        assert!(config.drain_timeout.is_none());
        assert!(config.unstructured.is_none());
        assert!(config.broker.ca_cert.is_none());
        assert_eq!(config.blobs.secret_access_key.expose_secret(), "secret");
    }

    #[test]
    fn missing_required_var() {
        let mut env = base_env();
        env.remove("BROKER_URL");
        match load(&env) {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "BROKER_URL"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut env = base_env();
        env.insert("DOCUMENT_STORE_DATABASE", "  ");
        assert!(matches!(load(&env), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn invalid_port() {
        let mut env = base_env();
        env.insert("PORT", "eighty");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn optional_settings() {
        let mut env = base_env();
        env.insert("PORT", "9090");
        env.insert("TELEMETRY_DISABLED", "true");
        env.insert("WORKER_DRAIN_TIMEOUT_SECS", "30");
        env.insert("UNSTRUCTURED_API_URL", "http://unstructured:8000");
        env.insert("UNSTRUCTURED_API_KEY", "k");
        let config = load(&env).unwrap();
        assert_eq!(config.port, 9090);
        assert!(!config.telemetry_enabled);
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(30)));
        let unstructured = config.unstructured.unwrap();
        assert_eq!(unstructured.api_url, "http://unstructured:8000");
        assert_eq!(unstructured.api_key.unwrap().expose_secret(), "k");
    }

    #[test]
    fn rejects_bad_boolean() {
        let mut env = base_env();
        env.insert("TELEMETRY_DISABLED", "maybe");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));
    }
}
