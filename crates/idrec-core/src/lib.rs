//! Core domain model and error taxonomy for identity reconciliation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "idrec-core";

/// Override category holding `directory_email -> cluster_username` decisions.
pub const MATCHES_CATEGORY: &str = "matches_mila_to_cc_account_username";

/// Opaque key/value payload as delivered by a source.
pub type RawEntry = Map<String, JsonValue>;

/// Which collaborator a record or failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Directory,
    Roster,
    ClusterRoles,
    ClusterMembers,
    Overrides,
    DocumentStore,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Directory => "directory",
            Self::Roster => "roster",
            Self::ClusterRoles => "cluster_roles",
            Self::ClusterMembers => "cluster_members",
            Self::Overrides => "overrides",
            Self::DocumentStore => "document_store",
        };
        f.write_str(label)
    }
}

/// The two disjoint external-cluster record sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Role,
    Member,
}

impl AccountKind {
    pub fn source(self) -> SourceKind {
        match self {
            Self::Role => SourceKind::ClusterRoles,
            Self::Member => SourceKind::ClusterMembers,
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role => f.write_str("role"),
            Self::Member => f.write_str("member"),
        }
    }
}

/// Convenience identity view derived from an underlying descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDescriptor {
    pub email: Option<String>,
    pub username: Option<String>,
    pub active: bool,
}

/// Supervisor/co-supervisor reference after resolution.
///
/// `Known` always names an existing profile key. Anything that could not be
/// tied to a profile is kept verbatim as `Unresolved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PersonRef {
    Known(String),
    Unresolved(String),
}

impl PersonRef {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(value) | Self::Unresolved(value) => value,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// One normalized person, keyed by the directory account email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub key: String,
    pub name: String,
    pub directory: AccountDescriptor,
    pub directory_entry: RawEntry,
    pub supervisor: Option<PersonRef>,
    pub co_supervisor: Option<PersonRef>,
    pub roster: Option<RawEntry>,
    pub membership_type: Option<String>,
    pub cluster_roles: Option<RawEntry>,
    pub cluster_members: Option<RawEntry>,
}

impl Profile {
    /// Directory cluster username, if the entry carried one.
    pub fn directory_username(&self) -> Option<&str> {
        self.directory.username.as_deref()
    }
}

/// One row of the external-cluster `roles` or `members` data set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub kind: AccountKind,
    pub username: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub active: bool,
    pub raw: RawEntry,
}

/// Persisted per-person document. Upserted by `key`.
///
/// Maps are `serde_json::Map` (sorted keys), so serializing the same record
/// twice yields the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: String,
    pub name: String,
    pub directory: AccountDescriptor,
    pub directory_entry: RawEntry,
    pub supervisor: Option<String>,
    pub co_supervisor: Option<String>,
    pub roster: Option<RawEntry>,
    pub membership_type: Option<String>,
    pub cluster_roles: Option<RawEntry>,
    pub cluster_members: Option<RawEntry>,
    pub cluster: Option<AccountDescriptor>,
}

/// Reconciliation conditions. Only `SourceUnavailable` is fatal; the rest
/// are collected into the run report and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum ReconcileError {
    #[error("malformed {origin} record #{index}: {reason}")]
    MalformedRecord {
        origin: SourceKind,
        index: usize,
        reason: String,
    },
    #[error("ambiguous {kind} account {username}: candidates {candidates:?}")]
    AmbiguousMatch {
        kind: AccountKind,
        username: String,
        candidates: Vec<String>,
    },
    #[error("unresolved {field} reference {value:?} on profile {profile}")]
    UnresolvedReference {
        profile: String,
        field: String,
        value: String,
    },
    #[error("{origin} unavailable: {detail}")]
    SourceUnavailable { origin: SourceKind, detail: String },
}

impl ReconcileError {
    pub fn malformed(origin: SourceKind, index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            origin,
            index,
            reason: reason.into(),
        }
    }

    pub fn unavailable(origin: SourceKind, err: impl fmt::Display) -> Self {
        Self::SourceUnavailable {
            origin,
            detail: err.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

/// Reads a string-ish field out of a raw entry. Lists yield their first
/// element, blank strings count as absent.
pub fn raw_str<'a>(entry: &'a RawEntry, key: &str) -> Option<&'a str> {
    let value = match entry.get(key)? {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Reads a boolean that sources deliver either as JSON bool or as text.
pub fn raw_bool(entry: &RawEntry, key: &str) -> Option<bool> {
    match entry.get(key)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
