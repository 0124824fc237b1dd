//! In-memory document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{DocumentStore, Filter, Update, UpdateResult, document_id};
use crate::error::StoreError;

/// Document store held in process memory, namespaced by database name.
pub struct MemoryDocumentStore {
    database: String,
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            collections: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `find_one` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// `update_one` calls served so far (matched or not).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Remove a document, as a concurrent deletion would.
    pub async fn remove(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let id = document_id(&doc)?.to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc);
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(&filter.id))
            .filter(|doc| filter.matches(doc))
            .cloned())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult, StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut collections = self.collections.write().await;
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(&filter.id))
            .filter(|doc| filter.matches(doc))
        else {
            return Ok(UpdateResult::default());
        };

        // Apply to a copy so a failed path leaves the document untouched.
        let mut updated = doc.clone();
        let changed = update.apply(&mut updated)?;
        if changed {
            *doc = updated;
        }
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(changed),
        })
    }
}
