//! Source collaborator contracts and their file/HTTP-backed implementations.
//!
//! Sources only deliver raw rows. Interpreting them is the normalizer's job,
//! except for external-cluster rows, whose small fixed contract is parsed
//! here into [`ExternalAccount`] values.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use idrec_core::{raw_str, AccountKind, ExternalAccount, RawEntry, ReconcileError};
use idrec_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;

pub const CRATE_NAME: &str = "idrec-adapters";

pub const ACCOUNT_USERNAME: &str = "username";
pub const ACCOUNT_EMAIL: &str = "email";
pub const ACCOUNT_NAME: &str = "name";
pub const ACCOUNT_STATUS: &str = "activation_status";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Directory (LDAP-style) identity source.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    fn describe(&self) -> String;
    async fn query(&self) -> Result<Vec<RawEntry>, AdapterError>;
}

/// Supplemental HR/onboarding roster.
#[async_trait]
pub trait RosterSource: Send + Sync {
    fn describe(&self) -> String;
    async fn read(&self) -> Result<Vec<RawEntry>, AdapterError>;
}

/// External-cluster account exports, one data set per [`AccountKind`].
#[async_trait]
pub trait ClusterAccountSource: Send + Sync {
    fn describe(&self) -> String;
    async fn read(&self, kind: AccountKind) -> Result<Vec<RawEntry>, AdapterError>;
}

/// Directory export previously dumped to a JSON array of entries.
#[derive(Debug, Clone)]
pub struct SnapshotDirectory {
    path: PathBuf,
}

impl SnapshotDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DirectorySource for SnapshotDirectory {
    fn describe(&self) -> String {
        format!("directory snapshot {}", self.path.display())
    }

    async fn query(&self) -> Result<Vec<RawEntry>, AdapterError> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        entries_from_json(&text).map_err(|e| {
            AdapterError::Message(format!("parsing {}: {e}", self.path.display()))
        })
    }
}

/// Directory export served over HTTPS as a JSON array, bearer-authenticated.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    endpoint: String,
    token: Option<String>,
    http: HttpFetcher,
}

impl HttpDirectory {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, http: HttpFetcher) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            http,
        }
    }
}

#[async_trait]
impl DirectorySource for HttpDirectory {
    fn describe(&self) -> String {
        format!("directory endpoint {}", self.endpoint)
    }

    async fn query(&self) -> Result<Vec<RawEntry>, AdapterError> {
        let bytes = self
            .http
            .fetch_bytes(&self.endpoint, self.token.as_deref())
            .await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| AdapterError::Message(format!("directory payload is not utf-8: {e}")))?;
        entries_from_json(&text)
            .map_err(|e| AdapterError::Message(format!("parsing directory payload: {e}")))
    }
}

/// Accepts either a bare array of objects or `{"entries": [...]}`.
pub fn entries_from_json(text: &str) -> Result<Vec<RawEntry>, String> {
    let value: JsonValue = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("entries") {
            Some(JsonValue::Array(items)) => items,
            _ => return Err("expected an array of entries".to_string()),
        },
        _ => return Err("expected an array of entries".to_string()),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            JsonValue::Object(map) => Ok(map),
            _ => Err(format!("entry #{idx} is not an object")),
        })
        .collect()
}

/// Reads a headed CSV file into one map per row, keyed by column header.
pub async fn read_csv_rows(path: &Path) -> Result<Vec<RawEntry>, AdapterError> {
    let bytes = fs::read(path).await.map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_csv_rows(path, &bytes)
}

/// `path` only labels errors.
pub fn parse_csv_rows(path: &Path, bytes: &[u8]) -> Result<Vec<RawEntry>, AdapterError> {
    let csv_err = |source| AdapterError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers().map_err(csv_err)?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let row: RawEntry = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), JsonValue::String(v.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Roster export in CSV form.
#[derive(Debug, Clone)]
pub struct CsvRoster {
    path: PathBuf,
}

impl CsvRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RosterSource for CsvRoster {
    fn describe(&self) -> String {
        format!("roster csv {}", self.path.display())
    }

    async fn read(&self) -> Result<Vec<RawEntry>, AdapterError> {
        read_csv_rows(&self.path).await
    }
}

/// `roles` and `members` exports as two CSV files.
#[derive(Debug, Clone)]
pub struct CsvClusterAccounts {
    roles_path: PathBuf,
    members_path: PathBuf,
}

impl CsvClusterAccounts {
    pub fn new(roles_path: impl Into<PathBuf>, members_path: impl Into<PathBuf>) -> Self {
        Self {
            roles_path: roles_path.into(),
            members_path: members_path.into(),
        }
    }
}

#[async_trait]
impl ClusterAccountSource for CsvClusterAccounts {
    fn describe(&self) -> String {
        format!(
            "cluster accounts {} + {}",
            self.roles_path.display(),
            self.members_path.display()
        )
    }

    async fn read(&self, kind: AccountKind) -> Result<Vec<RawEntry>, AdapterError> {
        match kind {
            AccountKind::Role => read_csv_rows(&self.roles_path).await,
            AccountKind::Member => read_csv_rows(&self.members_path).await,
        }
    }
}

/// Fixed in-memory rows; serves as directory or roster source.
#[derive(Debug, Clone, Default)]
pub struct StaticRecords(pub Vec<RawEntry>);

#[async_trait]
impl DirectorySource for StaticRecords {
    fn describe(&self) -> String {
        format!("{} static directory entries", self.0.len())
    }

    async fn query(&self) -> Result<Vec<RawEntry>, AdapterError> {
        Ok(self.0.clone())
    }
}

#[async_trait]
impl RosterSource for StaticRecords {
    fn describe(&self) -> String {
        format!("{} static roster rows", self.0.len())
    }

    async fn read(&self) -> Result<Vec<RawEntry>, AdapterError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticClusterAccounts {
    pub roles: Vec<RawEntry>,
    pub members: Vec<RawEntry>,
}

#[async_trait]
impl ClusterAccountSource for StaticClusterAccounts {
    fn describe(&self) -> String {
        format!(
            "{} static roles + {} static members",
            self.roles.len(),
            self.members.len()
        )
    }

    async fn read(&self, kind: AccountKind) -> Result<Vec<RawEntry>, AdapterError> {
        Ok(match kind {
            AccountKind::Role => self.roles.clone(),
            AccountKind::Member => self.members.clone(),
        })
    }
}

/// Interprets one external-cluster row. Rows without a username are unusable.
pub fn parse_external_account(
    kind: AccountKind,
    index: usize,
    raw: RawEntry,
) -> Result<ExternalAccount, ReconcileError> {
    let Some(username) = raw_str(&raw, ACCOUNT_USERNAME).map(str::to_string) else {
        return Err(ReconcileError::malformed(
            kind.source(),
            index,
            "missing username",
        ));
    };
    let email = raw_str(&raw, ACCOUNT_EMAIL).map(str::to_ascii_lowercase);
    let name = raw_str(&raw, ACCOUNT_NAME).map(str::to_string);
    let active = raw_str(&raw, ACCOUNT_STATUS)
        .map(|status| status.eq_ignore_ascii_case("activated"))
        .unwrap_or(false);
    Ok(ExternalAccount {
        kind,
        username,
        email,
        name,
        active,
        raw,
    })
}
