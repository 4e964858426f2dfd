//! Directory + roster -> one [`Profile`] per directory identity.

use std::collections::{HashMap, HashSet};

use idrec_core::{
    raw_bool, raw_str, AccountDescriptor, PersonRef, Profile, RawEntry, ReconcileError,
    SourceKind,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DIR_MAIL: &str = "mail";
pub const DIR_DISPLAY_NAME: &str = "displayName";
pub const DIR_POSIX_UID: &str = "posixUid";
pub const DIR_UID: &str = "uid";
pub const DIR_SUSPENDED: &str = "suspended";
pub const DIR_SUPERVISOR: &str = "supervisor";
pub const DIR_CO_SUPERVISOR: &str = "co_supervisor";

/// Roster column headers the normalizer reads. Everything else in a row is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterColumns {
    pub email: String,
    /// Preferred display name; replaces the directory `displayName` when set.
    pub display_name: String,
    pub supervisor: String,
    pub co_supervisor: String,
    pub membership_type: String,
}

impl Default for RosterColumns {
    fn default() -> Self {
        Self {
            email: "Mila Email".to_string(),
            display_name: "Display Name".to_string(),
            supervisor: "Supervisor Principal".to_string(),
            co_supervisor: "Co-Supervisor".to_string(),
            membership_type: "Membership Type".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub profiles: Vec<Profile>,
    pub issues: Vec<ReconcileError>,
    /// Roster emails that matched no directory identity.
    pub orphan_roster_rows: Vec<String>,
}

/// Supervisor values collected before resolution; roster wins over directory.
#[derive(Debug, Default)]
struct PendingRefs {
    supervisor: Option<String>,
    co_supervisor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    columns: RosterColumns,
}

impl Normalizer {
    pub fn new(columns: RosterColumns) -> Self {
        Self { columns }
    }

    pub fn normalize(&self, directory: Vec<RawEntry>, roster: Vec<RawEntry>) -> Normalized {
        let mut out = Normalized::default();
        let mut pending = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for (index, entry) in directory.into_iter().enumerate() {
            let Some(key) = raw_str(&entry, DIR_MAIL).map(str::to_ascii_lowercase) else {
                out.issues.push(ReconcileError::malformed(
                    SourceKind::Directory,
                    index,
                    "missing primary email",
                ));
                continue;
            };
            if by_key.contains_key(&key) {
                out.issues.push(ReconcileError::malformed(
                    SourceKind::Directory,
                    index,
                    format!("duplicate primary email {key}"),
                ));
                continue;
            }

            let name = raw_str(&entry, DIR_DISPLAY_NAME).unwrap_or(key.as_str()).to_string();
            let username = raw_str(&entry, DIR_POSIX_UID)
                .or_else(|| raw_str(&entry, DIR_UID))
                .map(str::to_string);
            let active = !raw_bool(&entry, DIR_SUSPENDED).unwrap_or(false);
            pending.push(PendingRefs {
                supervisor: raw_str(&entry, DIR_SUPERVISOR).map(str::to_string),
                co_supervisor: raw_str(&entry, DIR_CO_SUPERVISOR).map(str::to_string),
            });

            by_key.insert(key.clone(), out.profiles.len());
            out.profiles.push(Profile {
                key: key.clone(),
                name,
                directory: AccountDescriptor {
                    email: Some(key),
                    username,
                    active,
                },
                directory_entry: entry,
                supervisor: None,
                co_supervisor: None,
                roster: None,
                membership_type: None,
                cluster_roles: None,
                cluster_members: None,
            });
        }

        for (index, row) in roster.into_iter().enumerate() {
            let Some(email) = raw_str(&row, &self.columns.email).map(str::to_ascii_lowercase)
            else {
                out.issues.push(ReconcileError::malformed(
                    SourceKind::Roster,
                    index,
                    format!("missing {:?} column value", self.columns.email),
                ));
                continue;
            };
            let Some(&slot) = by_key.get(&email) else {
                warn!(email = %email, "roster row matches no directory identity, dropping it");
                out.orphan_roster_rows.push(email);
                continue;
            };
            let profile = &mut out.profiles[slot];
            if profile.roster.is_some() {
                out.issues.push(ReconcileError::malformed(
                    SourceKind::Roster,
                    index,
                    format!("second roster row for {email}"),
                ));
                continue;
            }

            if let Some(value) = raw_str(&row, &self.columns.display_name) {
                profile.name = value.to_string();
            }
            if let Some(value) = raw_str(&row, &self.columns.supervisor) {
                pending[slot].supervisor = Some(value.to_string());
            }
            if let Some(value) = raw_str(&row, &self.columns.co_supervisor) {
                pending[slot].co_supervisor = Some(value.to_string());
            }
            profile.membership_type =
                raw_str(&row, &self.columns.membership_type).map(str::to_string);
            profile.roster = Some(row);
        }

        let resolver = ReferenceResolver::new(&out.profiles);
        let mut resolved = Vec::with_capacity(pending.len());
        for (profile, refs) in out.profiles.iter().zip(pending) {
            let supervisor = refs
                .supervisor
                .map(|v| resolver.resolve(&profile.key, DIR_SUPERVISOR, &v, &mut out.issues));
            let co_supervisor = refs
                .co_supervisor
                .map(|v| resolver.resolve(&profile.key, DIR_CO_SUPERVISOR, &v, &mut out.issues));
            resolved.push((supervisor, co_supervisor));
        }
        for (profile, (supervisor, co_supervisor)) in out.profiles.iter_mut().zip(resolved) {
            profile.supervisor = supervisor;
            profile.co_supervisor = co_supervisor;
        }

        for issue in &out.issues {
            warn!(%issue, "normalization issue");
        }
        out
    }
}

/// Resolves emails and display names against the known profile set.
struct ReferenceResolver<'a> {
    keys: HashSet<&'a str>,
    by_name: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> ReferenceResolver<'a> {
    fn new(profiles: &'a [Profile]) -> Self {
        let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        for p in profiles {
            by_name.entry(p.name.trim()).or_default().push(&p.key);
        }
        Self {
            keys: profiles.iter().map(|p| p.key.as_str()).collect(),
            by_name,
        }
    }

    fn resolve(
        &self,
        profile: &str,
        field: &str,
        value: &str,
        issues: &mut Vec<ReconcileError>,
    ) -> PersonRef {
        let value = value.trim();
        let found = if value.contains('@') {
            let email = value.to_ascii_lowercase();
            self.keys.get(email.as_str()).map(|k| k.to_string())
        } else {
            match self.by_name.get(value).map(Vec::as_slice) {
                Some([only]) => Some(only.to_string()),
                _ => None,
            }
        };

        match found {
            Some(key) => PersonRef::Known(key),
            None => {
                issues.push(ReconcileError::UnresolvedReference {
                    profile: profile.to_string(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
                PersonRef::Unresolved(value.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn entry(value: JsonValue) -> RawEntry {
        value.as_object().cloned().expect("object")
    }

    fn person(i: usize) -> RawEntry {
        entry(json!({
            "mail": [format!("john.smith{i:03}@mila.quebec")],
            "displayName": format!("John Smith{i:03}"),
            "posixUid": format!("smithj{i:03}"),
            "suspended": "false",
        }))
    }

    fn roster_row(email: &str, extra: JsonValue) -> RawEntry {
        let mut row = entry(json!({ "Mila Email": email }));
        row.extend(entry(extra));
        row
    }

    #[test]
    fn entries_without_email_are_rejected_not_fatal() {
        let mut bad = person(1);
        bad.remove("mail");
        let out = Normalizer::default().normalize(vec![person(0), bad, person(2)], vec![]);
        assert_eq!(out.profiles.len(), 2);
        assert!(matches!(
            out.issues.as_slice(),
            [ReconcileError::MalformedRecord {
                origin: SourceKind::Directory,
                index: 1,
                ..
            }]
        ));
    }

    #[test]
    fn directory_fields_become_descriptor() {
        let mut e = person(3);
        e.insert("suspended".into(), json!("true"));
        let out = Normalizer::default().normalize(vec![e], vec![]);
        let p = &out.profiles[0];
        assert_eq!(p.key, "john.smith003@mila.quebec");
        assert_eq!(p.name, "John Smith003");
        assert_eq!(p.directory_username(), Some("smithj003"));
        assert!(!p.directory.active);
    }

    #[test]
    fn roster_supervisor_overrides_directory() {
        let mut student = person(2);
        student.insert("supervisor".into(), json!("john.smith000@mila.quebec"));
        let roster = vec![roster_row(
            "john.smith002@mila.quebec",
            json!({"Supervisor Principal": "john.smith001@mila.quebec"}),
        )];
        let out = Normalizer::default().normalize(vec![person(0), person(1), student], roster);
        assert_eq!(
            out.profiles[2].supervisor,
            Some(PersonRef::Known("john.smith001@mila.quebec".into()))
        );
    }

    #[test]
    fn directory_supervisor_kept_when_roster_silent() {
        let mut student = person(2);
        student.insert("supervisor".into(), json!("super.visor@mila.quebec"));
        let roster = vec![roster_row(
            "john.smith002@mila.quebec",
            json!({"Supervisor Principal": ""}),
        )];
        let out = Normalizer::default().normalize(vec![student], roster);
        assert_eq!(
            out.profiles[0].supervisor,
            Some(PersonRef::Unresolved("super.visor@mila.quebec".into()))
        );
        assert!(out.profiles[0].roster.is_some());
    }

    #[test]
    fn co_supervisor_display_name_resolves_to_unique_profile() {
        let mut student = person(2);
        student.insert("co_supervisor".into(), json!("co.super.visor.ldap@mila.quebec"));
        let roster = vec![roster_row(
            "john.smith002@mila.quebec",
            json!({"Co-Supervisor": "John Smith001"}),
        )];
        let out = Normalizer::default().normalize(vec![person(0), person(1), student], roster);
        assert_eq!(
            out.profiles[2].co_supervisor,
            Some(PersonRef::Known("john.smith001@mila.quebec".into()))
        );
    }

    #[test]
    fn ambiguous_or_unknown_names_stay_raw() {
        let mut twin = person(5);
        twin.insert("displayName".into(), json!("John Smith001"));
        let roster = vec![
            roster_row("john.smith002@mila.quebec", json!({"Co-Supervisor": "John Smith001"})),
            roster_row("john.smith000@mila.quebec", json!({"Co-Supervisor": "Nobody Known"})),
        ];
        let out = Normalizer::default().normalize(
            vec![person(0), person(1), person(2), twin],
            roster,
        );
        assert_eq!(
            out.profiles[2].co_supervisor,
            Some(PersonRef::Unresolved("John Smith001".into()))
        );
        assert_eq!(
            out.profiles[0].co_supervisor,
            Some(PersonRef::Unresolved("Nobody Known".into()))
        );
        let unresolved = out
            .issues
            .iter()
            .filter(|i| matches!(i, ReconcileError::UnresolvedReference { .. }))
            .count();
        assert_eq!(unresolved, 2);
    }

    #[test]
    fn orphan_roster_rows_are_dropped() {
        let roster = vec![roster_row("ghost@mila.quebec", json!({}))];
        let out = Normalizer::default().normalize(vec![person(0)], roster);
        assert_eq!(out.profiles.len(), 1);
        assert!(out.profiles[0].roster.is_none());
        assert_eq!(out.orphan_roster_rows, vec!["ghost@mila.quebec".to_string()]);
    }

    #[test]
    fn membership_type_is_lifted_from_roster() {
        let roster = vec![roster_row(
            "john.smith000@mila.quebec",
            json!({"Membership Type": "Permanent Professor"}),
        )];
        let out = Normalizer::default().normalize(vec![person(0)], roster);
        assert_eq!(
            out.profiles[0].membership_type.as_deref(),
            Some("Permanent Professor")
        );
    }

    #[test]
    fn roster_display_name_replaces_directory_name() {
        let roster = vec![roster_row(
            "john.smith001@mila.quebec",
            json!({"Display Name": "Johnny Smith", "Co-Supervisor": ""}),
        )];
        let mut student = person(2);
        student.insert("co_supervisor".into(), json!("Johnny Smith"));
        let out = Normalizer::default().normalize(vec![person(0), person(1), student], roster);
        assert_eq!(out.profiles[1].name, "Johnny Smith");
        assert_eq!(out.profiles[0].name, "John Smith000");
        // name lookups see the roster name
        assert_eq!(
            out.profiles[2].co_supervisor,
            Some(PersonRef::Known("john.smith001@mila.quebec".into()))
        );
    }

    #[test]
    fn profile_key_is_lowercased_directory_email() {
        let mut e = person(4);
        e.insert("mail".into(), json!(["John.Smith004@Mila.Quebec"]));
        let out = Normalizer::default().normalize(vec![e], vec![]);
        assert_eq!(out.profiles[0].key, "john.smith004@mila.quebec");
        assert_eq!(
            out.profiles[0].directory.email.as_deref(),
            Some("john.smith004@mila.quebec")
        );
    }
}
