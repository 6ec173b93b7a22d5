//! Document store contract plus PostgreSQL and in-memory implementations.

use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_core::{Fingerprint, Record, StoredDocument};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "docsync-storage";

const MAX_IDENTIFIER_LEN: usize = 63;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid collection name {0:?}: expected an SQL identifier of at most 63 characters")]
    InvalidCollection(String),
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[error("store unreachable during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("store rejected {op}: {source}")]
    Write {
        op: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("malformed stored document: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn transport(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            op,
            source: source.into(),
        }
    }

    pub fn write(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Write {
            op,
            source: source.into(),
        }
    }

    /// Connection-level failures, as opposed to the store refusing a write.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    fn from_sqlx(op: &'static str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::transport(op, err),
            other => Self::write(op, other),
        }
    }
}

/// Key-addressable document collection with an atomic upsert-by-fingerprint.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection(&self) -> &str;

    /// Insert the document when no document carries `fingerprint`, otherwise
    /// replace its `fetched_at` and `data`. Must be a single store operation.
    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        fetched_at: DateTime<Utc>,
        data: &Record,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredDocument>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

pub fn validate_collection_name(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= MAX_IDENTIFIER_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

// SQLSTATE 42P01: the collection table has not been created yet.
fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01"))
}

async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after }),
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub database_url: String,
    /// Overrides the database named in `database_url` when set.
    pub database: Option<String>,
    pub collection: String,
    pub timeout: Duration,
    pub max_connections: u32,
}

impl StoreSettings {
    pub fn new(database_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database: None,
            collection: collection.into(),
            timeout: Duration::from_secs(10),
            max_connections: 4,
        }
    }
}

/// Collection backed by a PostgreSQL table of `(fingerprint, fetched_at, data JSONB)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    collection: String,
    timeout: Duration,
    initialized: OnceCell<()>,
}

impl PgDocumentStore {
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let collection = validate_collection_name(&settings.collection)?.to_string();
        let mut options = PgConnectOptions::from_str(&settings.database_url)
            .map_err(|err| StoreError::Config(format!("parsing database url: {err}")))?;
        if let Some(database) = settings.database.as_deref().filter(|d| !d.is_empty()) {
            options = options.database(database);
        }

        let span = info_span!("store_connect", collection = %collection);
        let pool = with_timeout("connect", settings.timeout, async {
            PgPoolOptions::new()
                .max_connections(settings.max_connections.max(1))
                .acquire_timeout(settings.timeout)
                .connect_with(options)
                .await
                .map_err(|err| StoreError::from_sqlx("connect", err))
        })
        .instrument(span)
        .await?;

        Ok(Self::from_pool(pool, collection, settings.timeout))
    }

    pub fn from_pool(pool: PgPool, collection: String, timeout: Duration) -> Self {
        Self {
            pool,
            collection,
            timeout,
            initialized: OnceCell::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the collection table if it does not exist yet. Runs at most once per handle.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.initialized
            .get_or_try_init(|| async {
                let ddl = format!(
                    r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    fingerprint TEXT PRIMARY KEY,
    fetched_at TIMESTAMPTZ NOT NULL,
    data JSONB NOT NULL
)
"#,
                    table = self.collection
                );
                with_timeout("migrate", self.timeout, async {
                    sqlx::query(&ddl)
                        .execute(&self.pool)
                        .await
                        .map_err(|err| StoreError::from_sqlx("migrate", err))
                })
                .await?;
                debug!(collection = %self.collection, "collection table ready");
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        fetched_at: DateTime<Utc>,
        data: &Record,
    ) -> Result<UpsertOutcome, StoreError> {
        self.ensure_schema().await?;

        let sql = format!(
            r#"
INSERT INTO "{table}" (fingerprint, fetched_at, data)
VALUES ($1, $2, $3)
ON CONFLICT (fingerprint) DO UPDATE
  SET fetched_at = EXCLUDED.fetched_at,
      data = EXCLUDED.data
RETURNING (xmax = 0) AS inserted
"#,
            table = self.collection
        );

        let row = with_timeout("upsert", self.timeout, async {
            sqlx::query(&sql)
                .bind(fingerprint.as_str())
                .bind(fetched_at)
                .bind(Json(data))
                .fetch_one(&self.pool)
                .await
                .map_err(|err| StoreError::from_sqlx("upsert", err))
        })
        .await?;

        let inserted: bool = row
            .try_get("inserted")
            .map_err(|err| StoreError::from_sqlx("upsert", err))?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredDocument>, StoreError> {
        let sql = format!(
            r#"SELECT fingerprint, fetched_at, data FROM "{table}" WHERE fingerprint = $1"#,
            table = self.collection
        );
        let row = with_timeout("get", self.timeout, async {
            match sqlx::query(&sql)
                .bind(fingerprint.as_str())
                .fetch_optional(&self.pool)
                .await
            {
                Err(err) if is_undefined_table(&err) => Ok(None),
                other => other.map_err(|err| StoreError::from_sqlx("get", err)),
            }
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored_fingerprint: String = row
            .try_get("fingerprint")
            .map_err(|err| StoreError::from_sqlx("get", err))?;
        let fetched_at: DateTime<Utc> = row
            .try_get("fetched_at")
            .map_err(|err| StoreError::from_sqlx("get", err))?;
        let Json(data): Json<Record> = row
            .try_get("data")
            .map_err(|err| StoreError::from_sqlx("get", err))?;

        Ok(Some(StoredDocument {
            fingerprint: Fingerprint::parse(&stored_fingerprint)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            fetched_at,
            data,
        }))
    }

    /// Read-only: a collection whose table was never created holds 0 documents.
    async fn count(&self) -> Result<u64, StoreError> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{table}""#, table = self.collection);
        let count: i64 = with_timeout("count", self.timeout, async {
            match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await {
                Err(err) if is_undefined_table(&err) => Ok(0),
                other => other.map_err(|err| StoreError::from_sqlx("count", err)),
            }
        })
        .await?;
        Ok(count.max(0) as u64)
    }
}

/// Process-local collection. Upserts are atomic under a single lock.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collection: String,
    docs: Mutex<BTreeMap<Fingerprint, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn documents(&self) -> Vec<StoredDocument> {
        self.docs.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        fetched_at: DateTime<Utc>,
        data: &Record,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut docs = self.docs.lock().await;
        let previous = docs.insert(
            fingerprint.clone(),
            StoredDocument {
                fingerprint: fingerprint.clone(),
                fetched_at,
                data: data.clone(),
            },
        );
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.docs.lock().await.get(fingerprint).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.docs.lock().await.len() as u64)
    }
}
