//! libSQL broker — durable jobs table with lease-based claims.
//!
//! Claims are a single `UPDATE ... RETURNING` statement, so two workers can
//! never hold the same job. A job whose lease expires (worker crashed mid-job)
//! becomes claimable again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Broker, ClaimedJob, Job, JobOptions, LeaseToken};
use crate::error::BrokerError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    queue TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL,
    lease_token TEXT,
    lease_until INTEGER,
    PRIMARY KEY (queue, id)
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, available_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (lease_token);
";

/// Durable broker backed by a libSQL database.
pub struct LibSqlBroker {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    options: JobOptions,
}

// Primary result codes; libSQL reports extended codes, so mask before comparing.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Another connection holds the database lock.
fn is_locked(e: &libsql::Error) -> bool {
    match e {
        libsql::Error::SqliteFailure(code, _) => {
            matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)
        }
        other => other.to_string().contains("database is locked"),
    }
}

fn backend_err(op: &str, e: libsql::Error) -> BrokerError {
    if is_locked(&e) {
        return BrokerError::Unavailable(format!("{op}: {e}"));
    }
    BrokerError::Backend(format!("{op}: {e}"))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl LibSqlBroker {
    /// Open (or create) a local broker database.
    pub async fn open(path: &Path, options: JobOptions) -> Result<Self, BrokerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| backend_err("open", e))?;
        let broker = Self::from_database(db, options).await?;
        info!(path = %path.display(), "Broker database opened");
        Ok(broker)
    }

    /// In-memory database (for tests).
    pub async fn memory(options: JobOptions) -> Result<Self, BrokerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| backend_err("open", e))?;
        Self::from_database(db, options).await
    }

    async fn from_database(db: LibSqlDatabase, options: JobOptions) -> Result<Self, BrokerError> {
        let conn = db.connect().map_err(|e| backend_err("connect", e))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| backend_err("schema", e))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            options,
        })
    }

    /// Number of unclaimed jobs on `queue`.
    pub async fn waiting(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND lease_token IS NULL",
                params![queue],
            )
            .await
            .map_err(|e| backend_err("waiting", e))?;
        let count = match rows.next().await.map_err(|e| backend_err("waiting", e))? {
            Some(row) => row.get::<i64>(0).map_err(|e| backend_err("waiting", e))?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl Broker for LibSqlBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<String, BrokerError> {
        let id = job_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = serde_json::to_string(&payload)
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO jobs (queue, id, payload, available_at) VALUES (?1, ?2, ?3, ?4)",
                params![queue, id.clone(), body, now_ms()],
            )
            .await
            .map_err(|e| backend_err("enqueue", e))?;
        if inserted == 0 {
            debug!(queue, job_id = %id, "Job already queued, skipping");
        }
        Ok(id)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedJob>, BrokerError> {
        let token = LeaseToken::generate();
        let now = now_ms();
        let mut rows = self
            .conn
            .query(
                "UPDATE jobs SET lease_token = ?1, lease_until = ?2, attempts_made = attempts_made + 1
                 WHERE rowid = (
                     SELECT rowid FROM jobs
                     WHERE queue = ?3
                       AND ((lease_token IS NULL AND available_at <= ?4)
                            OR (lease_token IS NOT NULL AND lease_until < ?4))
                     ORDER BY available_at, rowid
                     LIMIT 1
                 )
                 RETURNING id, payload, attempts_made",
                params![token.as_str(), now + duration_ms(lease), queue, now],
            )
            .await
            .map_err(|e| backend_err("claim", e))?;

        let Some(row) = rows.next().await.map_err(|e| backend_err("claim", e))? else {
            return Ok(None);
        };
        let id = row.get::<String>(0).map_err(|e| backend_err("claim", e))?;
        let body = row.get::<String>(1).map_err(|e| backend_err("claim", e))?;
        let attempts = row.get::<i64>(2).map_err(|e| backend_err("claim", e))?;

        let payload: Map<String, Value> = serde_json::from_str(&body)
            .map_err(|e| BrokerError::InvalidPayload(format!("job {id}: {e}")))?;

        Ok(Some(ClaimedJob {
            job: Job {
                id,
                queue: queue.to_string(),
                payload,
                attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
            },
            token,
        }))
    }

    async fn complete(&self, token: &LeaseToken) -> Result<(), BrokerError> {
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE lease_token = ?1", params![token.as_str()])
            .await
            .map_err(|e| backend_err("complete", e))?;
        if deleted == 0 {
            return Err(BrokerError::LeaseLost {
                token: token.to_string(),
            });
        }
        Ok(())
    }

    async fn fail(&self, token: &LeaseToken, reason: &str) -> Result<(), BrokerError> {
        let mut rows = self
            .conn
            .query(
                "SELECT queue, id, attempts_made FROM jobs WHERE lease_token = ?1",
                params![token.as_str()],
            )
            .await
            .map_err(|e| backend_err("fail", e))?;
        let Some(row) = rows.next().await.map_err(|e| backend_err("fail", e))? else {
            return Err(BrokerError::LeaseLost {
                token: token.to_string(),
            });
        };
        let queue = row.get::<String>(0).map_err(|e| backend_err("fail", e))?;
        let id = row.get::<String>(1).map_err(|e| backend_err("fail", e))?;
        let attempts = row.get::<i64>(2).map_err(|e| backend_err("fail", e))?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);

        if attempts >= self.options.attempts {
            warn!(queue = %queue, job_id = %id, attempts, reason, "Job exhausted its attempts, removing");
            self.conn
                .execute("DELETE FROM jobs WHERE lease_token = ?1", params![token.as_str()])
                .await
                .map_err(|e| backend_err("fail", e))?;
        } else {
            let available_at = now_ms() + duration_ms(self.options.redelivery_delay(attempts));
            self.conn
                .execute(
                    "UPDATE jobs SET lease_token = NULL, lease_until = NULL, available_at = ?1 WHERE lease_token = ?2",
                    params![available_at, token.as_str()],
                )
                .await
                .map_err(|e| backend_err("fail", e))?;
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &LeaseToken, by: Duration) -> Result<(), BrokerError> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET lease_until = ?1 WHERE lease_token = ?2",
                params![now_ms() + duration_ms(by), token.as_str()],
            )
            .await
            .map_err(|e| backend_err("extend_lease", e))?;
        if updated == 0 {
            return Err(BrokerError::LeaseLost {
                token: token.to_string(),
            });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| backend_err("ping", e))?;
        Ok(())
    }
}
