//! libSQL backend — `DocumentStore` over a single JSON documents table.
//!
//! Updates are read-modify-write guarded by a compare-and-swap on the stored
//! body, so a concurrent writer can never be silently overwritten.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};

use super::{DocumentStore, Filter, Update, UpdateResult, document_id};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    database TEXT NOT NULL,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (database, collection, id)
);
";

/// Attempts at the compare-and-swap before reporting contention.
const MAX_CAS_ATTEMPTS: usize = 5;

/// libSQL document store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlDocumentStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    database: String,
}

fn query_err(op: &str, e: libsql::Error) -> StoreError {
    StoreError::Query(format!("{op}: {e}"))
}

impl LibSqlDocumentStore {
    /// Open (or create) a local database file.
    pub async fn open(path: &Path, database: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db, database).await?;
        info!(path = %path.display(), database, "Document store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(database: &str) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, database).await
    }

    async fn from_database(db: LibSqlDatabase, database: &str) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| query_err("schema", e))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            database: database.to_string(),
        })
    }

    async fn load(&self, collection: &str, id: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT body FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database.as_str(), collection, id],
            )
            .await
            .map_err(|e| query_err("find_one", e))?;
        match rows.next().await.map_err(|e| query_err("find_one", e))? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(|e| query_err("find_one", e))?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for LibSqlDocumentStore {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let id = document_id(&doc)?.to_string();
        let body = serde_json::to_string(&doc)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO documents (database, collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    self.database.as_str(),
                    collection,
                    id,
                    body,
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| query_err("insert_one", e))?;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        let Some(body) = self.load(collection, &filter.id).await? else {
            return Ok(None);
        };
        let doc: Value = serde_json::from_str(&body)?;
        Ok(filter.matches(&doc).then_some(doc))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(body) = self.load(collection, &filter.id).await? else {
                return Ok(UpdateResult::default());
            };
            let mut doc: Value = serde_json::from_str(&body)?;
            if !filter.matches(&doc) {
                return Ok(UpdateResult::default());
            }
            if !update.apply(&mut doc)? {
                return Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: 0,
                });
            }

            let swapped = self
                .conn
                .execute(
                    "UPDATE documents SET body = ?1, updated_at = ?2
                     WHERE database = ?3 AND collection = ?4 AND id = ?5 AND body = ?6",
                    params![
                        serde_json::to_string(&doc)?,
                        chrono::Utc::now().to_rfc3339(),
                        self.database.as_str(),
                        collection,
                        filter.id.as_str(),
                        body
                    ],
                )
                .await
                .map_err(|e| query_err("update_one", e))?;
            if swapped == 1 {
                return Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: 1,
                });
            }
            debug!(collection, id = %filter.id, attempt, "Document changed underneath update, retrying");
        }
        Err(StoreError::Query(format!(
            "update_one: document {} kept changing after {MAX_CAS_ATTEMPTS} attempts",
            filter.id
        )))
    }
}
