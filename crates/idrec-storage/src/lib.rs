//! Persistence for identity reconciliation: the override store, the
//! document store, raw source archives and the HTTP fetcher used by remote
//! directory sources.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idrec_core::{SourceKind, MATCHES_CATEGORY};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "idrec-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed override file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write through a uniquely named sibling temp file and rename it into
/// place, so readers never observe a half-written file.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io(&parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Override store
// ---------------------------------------------------------------------------

/// Result of [`OverrideStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Unchanged,
    Reassigned { previous: String },
}

/// Persisted manual decisions: category -> (directory_email -> cluster_username).
///
/// Loaded once per run, mutated in memory, written back whole. Nothing in
/// here ever removes an entry.
#[derive(Debug, Clone)]
pub struct OverrideStore {
    path: PathBuf,
    categories: BTreeMap<String, BTreeMap<String, String>>,
}

impl OverrideStore {
    /// Empty store bound to `path`, with the required category present.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(MATCHES_CATEGORY.to_string(), BTreeMap::new());
        Self {
            path: path.into(),
            categories,
        }
    }

    /// Reads the persisted file. A missing file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "override file absent, starting empty");
                return Ok(Self::empty(path));
            }
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let categories: BTreeMap<String, BTreeMap<String, String>> = if text.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?
        };
        let mut store = Self { path, categories };
        store
            .categories
            .entry(MATCHES_CATEGORY.to_string())
            .or_default();
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, category: &str, key: &str) -> Option<&str> {
        self.categories
            .get(category)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    pub fn contains_key(&self, category: &str, key: &str) -> bool {
        self.get(category, key).is_some()
    }

    pub fn contains_value(&self, category: &str, value: &str) -> bool {
        !self.keys_for_value(category, value).is_empty()
    }

    /// Every key mapped to `value`, in key order.
    pub fn keys_for_value(&self, category: &str, value: &str) -> Vec<&str> {
        self.categories
            .get(category)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, v)| v.as_str() == value)
                    .map(|(k, _)| k.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn put(
        &mut self,
        category: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> PutOutcome {
        let value = value.into();
        let entries = self.categories.entry(category.to_string()).or_default();
        match entries.insert(key.into(), value.clone()) {
            None => PutOutcome::Inserted,
            Some(previous) if previous == value => PutOutcome::Unchanged,
            Some(previous) => PutOutcome::Reassigned { previous },
        }
    }

    pub fn category(&self, category: &str) -> Option<&BTreeMap<String, String>> {
        self.categories.get(category)
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = serde_json::to_vec_pretty(&self.categories)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Overwrites the persisted file with the full in-memory state.
    pub async fn save(&self) -> Result<(), StoreError> {
        let bytes = self.to_json_bytes()?;
        write_atomically(&self.path, &bytes).await
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Conjunction of equality predicates over dotted JSON paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    predicates: Vec<(String, JsonValue)>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.predicates.push((path.into(), value.into()));
        self
    }

    pub fn predicates(&self) -> &[(String, JsonValue)] {
        &self.predicates
    }

    pub fn matches(&self, document: &JsonValue) -> bool {
        self.predicates.iter().all(|(path, expected)| {
            path.split('.')
                .try_fold(document, |node, segment| node.get(segment))
                .is_some_and(|actual| actual == expected)
        })
    }

    /// The query as a JSONB containment pattern (`body @> pattern`).
    pub fn to_containment(&self) -> JsonValue {
        let mut root = JsonValue::Object(Default::default());
        for (path, expected) in &self.predicates {
            let mut node = &mut root;
            let segments: Vec<&str> = path.split('.').collect();
            for (idx, segment) in segments.iter().enumerate() {
                let JsonValue::Object(map) = node else {
                    break;
                };
                let slot = map
                    .entry(segment.to_string())
                    .or_insert_with(|| JsonValue::Object(Default::default()));
                if idx + 1 == segments.len() {
                    *slot = expected.clone();
                }
                node = slot;
            }
        }
        root
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Full replace of the document stored under `key`.
    async fn upsert(&self, collection: &str, key: &str, document: &JsonValue)
        -> Result<(), StoreError>;

    /// Matching documents, ordered by key.
    async fn find(&self, collection: &str, query: &DocumentQuery)
        -> Result<Vec<JsonValue>, StoreError>;
}

/// Process-local store. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<(String, String), JsonValue>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, collection: &str, key: &str) -> Option<JsonValue> {
        self.documents
            .lock()
            .await
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// Serialized view of a whole collection, for byte-level comparisons.
    pub async fn dump(&self, collection: &str) -> Result<Vec<u8>, StoreError> {
        let docs = self.documents.lock().await;
        let view: BTreeMap<&str, &JsonValue> = docs
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, k), v)| (k.as_str(), v))
            .collect();
        Ok(serde_json::to_vec(&view)?)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        document: &JsonValue,
    ) -> Result<(), StoreError> {
        self.documents
            .lock()
            .await
            .insert((collection.to_string(), key.to_string()), document.clone());
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<JsonValue>, StoreError> {
        Ok(self
            .documents
            .lock()
            .await
            .iter()
            .filter(|((c, _), doc)| c == collection && query.matches(doc))
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// Postgres-backed store: one JSONB row per `(collection, key)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        document: &JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, key, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, key) DO UPDATE
               SET body = EXCLUDED.body
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(Json(document))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body
              FROM documents
             WHERE collection = $1
               AND body @> $2
             ORDER BY key
            "#,
        )
        .bind(collection)
        .bind(Json(query.to_containment()))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(body): Json<JsonValue> = row.try_get("body")?;
            out.push(body);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Raw source archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedSource {
    pub source: SourceKind,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once copies of raw source payloads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        captured_at: DateTime<Utc>,
        source: SourceKind,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d").to_string())
            .join(source.to_string())
            .join(format!("{content_hash}.json"))
    }

    /// Archives one source payload. Identical content captured on the same
    /// day lands on the same path and is written only once.
    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        source: SourceKind,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSource> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(captured_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving {source} payload"))?;
        }

        Ok(ArchivedSource {
            source,
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Authenticated GET with bounded retries on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(concat!("idrec/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, backoff })
    }

    pub async fn fetch_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>, FetchError> {
        self.fetch_with_retries(url, bearer)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let err = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    None
                }
                Err(err) => Some(err),
            };

            if let Some(err) = err {
                let transient = err.is_timeout() || err.is_connect();
                if !transient || attempt >= self.backoff.max_retries {
                    return Err(FetchError::Request(err));
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
