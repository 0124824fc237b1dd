//! Document store — records referenced by extraction jobs.
//!
//! Documents are JSON objects keyed by `_id`. Updates are `$set`-style maps
//! of dotted paths, and `modified_count` only counts documents whose content
//! actually changed, so replaying an update is observable as a no-op.

pub mod libsql_backend;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::broker::TrustMaterial;
use crate::broker::connection::Endpoint;
use crate::config::DocumentStoreSettings;
use crate::error::{Error, StoreError};

pub use libsql_backend::LibSqlDocumentStore;
pub use memory::MemoryDocumentStore;

/// Collection holding uploaded file records.
pub const FILE_COLLECTION: &str = "file";

/// Selects a single document by id, optionally requiring field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub id: String,
    /// Dotted path → required value.
    pub conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conditions: Vec::new(),
        }
    }

    /// Also require `path` to equal `value` (a missing field equals `null`).
    pub fn and_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    /// Whether `doc` satisfies the filter.
    pub fn matches(&self, doc: &Value) -> bool {
        if doc.get("_id").and_then(Value::as_str) != Some(self.id.as_str()) {
            return false;
        }
        self.conditions
            .iter()
            .all(|(path, expected)| get_path(doc, path).unwrap_or(&Value::Null) == expected)
    }
}

/// A `$set` update: each dotted path is assigned its value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    /// Apply to `doc` in place. Returns whether anything changed.
    pub fn apply(&self, doc: &mut Value) -> Result<bool, StoreError> {
        let before = doc.clone();
        for (path, value) in &self.set {
            if path == "_id" {
                return Err(StoreError::InvalidPath("_id is immutable".to_string()));
            }
            set_path(doc, path, value.clone())?;
        }
        Ok(*doc != before)
    }
}

/// Outcome of `update_one`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Read a dotted path.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| node.get(segment))
}

/// Assign a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let Some(last) = segments.pop() else {
        return Err(StoreError::InvalidPath(path.to_string()));
    };

    let mut node = doc;
    for segment in segments {
        let Value::Object(map) = node else {
            return Err(StoreError::InvalidPath(path.to_string()));
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match node {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(StoreError::InvalidPath(path.to_string())),
    }
}

/// Persistent document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document. It must carry a string `_id`.
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError>;

    /// Find the document matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError>;

    /// Apply `update` to the document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult, StoreError>;
}

pub(crate) fn document_id(doc: &Value) -> Result<&str, StoreError> {
    doc.get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidPath("document has no string _id".to_string()))
}

/// Connect to the configured document store.
pub async fn connect(settings: &DocumentStoreSettings) -> Result<Arc<dyn DocumentStore>, Error> {
    let trust = TrustMaterial::from_optional("DOCUMENT_STORE_CA_CERT", settings.ca_cert.as_deref())?;
    if trust.is_custom() {
        warn!("DOCUMENT_STORE_CA_CERT configured for a local document store, ignoring");
    }

    let store: Arc<dyn DocumentStore> =
        match Endpoint::parse("DOCUMENT_STORE_URL", &settings.url)? {
            Endpoint::Memory => {
                info!(database = %settings.database, "Using in-memory document store");
                Arc::new(MemoryDocumentStore::new(&settings.database))
            }
            Endpoint::LibSql(path) => {
                Arc::new(LibSqlDocumentStore::open(&path, &settings.database).await?)
            }
        };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_and_set_nested_paths() {
        let mut doc = json!({"_id": "F1", "extraction": {"backend": "docling", "jobId": "F1"}});
        assert_eq!(get_path(&doc, "extraction.backend"), Some(&json!("docling")));
        assert_eq!(get_path(&doc, "extraction.missing"), None);

        set_path(&mut doc, "extraction.jobId", Value::Null).unwrap();
        set_path(&mut doc, "a.b.c", json!(1)).unwrap();
        assert_eq!(doc["extraction"]["jobId"], Value::Null);
        assert_eq!(doc["a"]["b"]["c"], json!(1));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut doc = json!({"_id": "F1", "name": "x"});
        assert!(matches!(
            set_path(&mut doc, "name.first", json!("y")),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(set_path(&mut doc, "a..b", json!(1)).is_err());
    }

    #[test]
    fn update_reports_changes() {
        let mut doc = json!({"_id": "F1", "extraction": {"jobId": "F1"}});
        let update = Update::new()
            .set("extraction.jobId", Value::Null)
            .set("extraction.storageId", "unstructured/s.json");
        assert!(update.apply(&mut doc).unwrap());
        assert!(!update.apply(&mut doc).unwrap());
    }

    #[test]
    fn id_is_immutable() {
        let mut doc = json!({"_id": "F1"});
        assert!(Update::new().set("_id", "F2").apply(&mut doc).is_err());
    }

    #[test]
    fn filter_conditions() {
        let doc = json!({"_id": "F1", "extraction": {"jobId": "J1"}});
        assert!(Filter::by_id("F1").matches(&doc));
        assert!(!Filter::by_id("F2").matches(&doc));
        assert!(Filter::by_id("F1").and_eq("extraction.jobId", "J1").matches(&doc));
        assert!(!Filter::by_id("F1").and_eq("extraction.jobId", "J2").matches(&doc));
        assert!(Filter::by_id("F1").and_eq("extraction.other", Value::Null).matches(&doc));
    }
}
