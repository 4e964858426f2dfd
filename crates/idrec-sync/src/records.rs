//! Profiles + matched accounts -> canonical records, upsert and lookups.

use std::collections::HashMap;

use idrec_core::{
    AccountDescriptor, AccountKind, CanonicalRecord, ExternalAccount, PersonRef, Profile,
};
use idrec_storage::{DocumentQuery, DocumentStore, StoreError};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::matching::AccountMatch;

pub const DEFAULT_COLLECTION: &str = "users";

fn cluster_descriptor(account: &ExternalAccount) -> AccountDescriptor {
    AccountDescriptor {
        email: account.email.clone(),
        username: Some(account.username.clone()),
        active: account.active,
    }
}

/// Attaches each profile's matched accounts. Profiles without a match keep
/// null cluster descriptors; matches naming unknown profiles are ignored.
pub fn merge(profiles: Vec<Profile>, matches: &[AccountMatch]) -> Vec<CanonicalRecord> {
    let mut by_profile: HashMap<&str, (Option<&ExternalAccount>, Option<&ExternalAccount>)> =
        HashMap::new();
    for m in matches {
        let slot = by_profile.entry(m.profile_key.as_str()).or_default();
        match m.account.kind {
            AccountKind::Role => slot.0 = Some(&m.account),
            AccountKind::Member => slot.1 = Some(&m.account),
        }
    }

    profiles
        .into_iter()
        .map(|profile| {
            let (role, member) = by_profile
                .get(profile.key.as_str())
                .copied()
                .unwrap_or_default();
            let cluster = member.or(role).map(cluster_descriptor);
            CanonicalRecord {
                supervisor: profile.supervisor.as_ref().map(|r| r.as_str().to_string()),
                co_supervisor: profile.co_supervisor.as_ref().map(PersonRef::as_str).map(str::to_string),
                cluster_roles: role.map(|a| a.raw.clone()),
                cluster_members: member.map(|a| a.raw.clone()),
                cluster,
                key: profile.key,
                name: profile.name,
                directory: profile.directory,
                directory_entry: profile.directory_entry,
                roster: profile.roster,
                membership_type: profile.membership_type,
            }
        })
        .collect()
}

/// Full replace per record, in the order given.
pub async fn upsert_all(
    store: &dyn DocumentStore,
    collection: &str,
    records: &[CanonicalRecord],
) -> Result<usize, StoreError> {
    for record in records {
        let document = serde_json::to_value(record)?;
        store.upsert(collection, &record.key, &document).await?;
        debug!(key = %record.key, "upserted");
    }
    Ok(records.len())
}

fn decode(documents: Vec<JsonValue>) -> Result<Vec<CanonicalRecord>, StoreError> {
    documents
        .into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
        .collect()
}

pub async fn list_users(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<Vec<CanonicalRecord>, StoreError> {
    decode(store.find(collection, &DocumentQuery::new()).await?)
}

pub async fn find_user_by_key(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
) -> Result<Option<CanonicalRecord>, StoreError> {
    let query = DocumentQuery::new().eq("key", key);
    Ok(decode(store.find(collection, &query).await?)?.into_iter().next())
}

/// Looks the username up in the members data first, then in roles.
pub async fn find_user_by_cluster_username(
    store: &dyn DocumentStore,
    collection: &str,
    username: &str,
) -> Result<Option<CanonicalRecord>, StoreError> {
    for path in ["cluster_members.username", "cluster_roles.username"] {
        let query = DocumentQuery::new().eq(path, username);
        if let Some(record) = decode(store.find(collection, &query).await?)?.into_iter().next() {
            return Ok(Some(record));
        }
    }
    Ok(None)
}
