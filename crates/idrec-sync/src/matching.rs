//! External-cluster account -> profile matching.
//!
//! Each account runs through an ordered chain of [`MatcherStrategy`]s; the
//! first strategy with an opinion (match or ambiguous) decides. The chain
//! starts with the override store, then the deterministic naming rules:
//!
//! 1. `username`: the cluster username equals the directory cluster username.
//! 2. `email_local_part`: the local part of the cluster email equals either
//!    the directory cluster username or the local part of the directory email.
//!
//! Comparisons are ASCII case-insensitive. Anything else is left unmatched;
//! more than one candidate is ambiguous and also left unmatched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use idrec_core::{AccountKind, ExternalAccount, Profile, ReconcileError, MATCHES_CATEGORY};
use idrec_storage::OverrideStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Override,
    Username,
    EmailLocalPart,
    Interactive,
}

impl MatchMethod {
    pub fn is_heuristic(self) -> bool {
        matches!(self, Self::Username | Self::EmailLocalPart)
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Override => "override",
            Self::Username => "username",
            Self::EmailLocalPart => "email_local_part",
            Self::Interactive => "interactive",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match(String),
    NoMatch,
    Ambiguous(Vec<String>),
    /// An override names a profile that no longer exists.
    Dangling(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountMatch {
    pub profile_key: String,
    pub method: MatchMethod,
    pub account: ExternalAccount,
}

/// Lookup tables over one run's profiles.
pub struct ProfileIndex<'a> {
    keys: HashSet<&'a str>,
    by_username: HashMap<String, BTreeSet<&'a str>>,
    by_email_local: HashMap<String, BTreeSet<&'a str>>,
}

impl<'a> ProfileIndex<'a> {
    pub fn new(profiles: &'a [Profile]) -> Self {
        let mut by_username: HashMap<String, BTreeSet<&str>> = HashMap::new();
        let mut by_email_local: HashMap<String, BTreeSet<&str>> = HashMap::new();
        for p in profiles {
            if let Some(username) = p.directory_username() {
                by_username
                    .entry(username.to_ascii_lowercase())
                    .or_default()
                    .insert(&p.key);
            }
            if let Some(local) = email_local_part(&p.key) {
                by_email_local.entry(local).or_default().insert(&p.key);
            }
        }
        Self {
            keys: profiles.iter().map(|p| p.key.as_str()).collect(),
            by_username,
            by_email_local,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

pub fn email_local_part(email: &str) -> Option<String> {
    let (local, domain) = email.trim().split_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(local.to_ascii_lowercase())
}

fn verdict_from(candidates: BTreeSet<&str>) -> Verdict {
    let mut iter = candidates.iter();
    match (iter.next(), iter.next()) {
        (None, _) => Verdict::NoMatch,
        (Some(only), None) => Verdict::Match(only.to_string()),
        _ => Verdict::Ambiguous(candidates.iter().map(|c| c.to_string()).collect()),
    }
}

pub trait MatcherStrategy: Send + Sync {
    fn method(&self) -> MatchMethod;
    fn evaluate(
        &self,
        account: &ExternalAccount,
        index: &ProfileIndex<'_>,
        overrides: &OverrideStore,
    ) -> Verdict;
}

/// Manual decisions win over everything and are never second-guessed.
pub struct OverrideMatcher;

impl MatcherStrategy for OverrideMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::Override
    }

    fn evaluate(
        &self,
        account: &ExternalAccount,
        index: &ProfileIndex<'_>,
        overrides: &OverrideStore,
    ) -> Verdict {
        let keys = overrides.keys_for_value(MATCHES_CATEGORY, &account.username);
        let Some(&first) = keys.first() else {
            return Verdict::NoMatch;
        };
        // entries for profiles that are gone do not compete with live ones
        let live: Vec<&str> = keys.into_iter().filter(|k| index.contains(k)).collect();
        match live.as_slice() {
            [] => Verdict::Dangling(first.to_string()),
            [key] => Verdict::Match(key.to_string()),
            many => Verdict::Ambiguous(many.iter().map(|k| k.to_string()).collect()),
        }
    }
}

pub struct UsernameMatcher;

impl MatcherStrategy for UsernameMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::Username
    }

    fn evaluate(
        &self,
        account: &ExternalAccount,
        index: &ProfileIndex<'_>,
        _overrides: &OverrideStore,
    ) -> Verdict {
        let username = account.username.to_ascii_lowercase();
        verdict_from(index.by_username.get(&username).cloned().unwrap_or_default())
    }
}

pub struct EmailLocalPartMatcher;

impl MatcherStrategy for EmailLocalPartMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::EmailLocalPart
    }

    fn evaluate(
        &self,
        account: &ExternalAccount,
        index: &ProfileIndex<'_>,
        _overrides: &OverrideStore,
    ) -> Verdict {
        let Some(local) = account.email.as_deref().and_then(email_local_part) else {
            return Verdict::NoMatch;
        };
        let mut candidates = BTreeSet::new();
        for table in [&index.by_username, &index.by_email_local] {
            if let Some(keys) = table.get(&local) {
                candidates.extend(keys.iter().copied());
            }
        }
        verdict_from(candidates)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matches: Vec<AccountMatch>,
    pub unmatched: Vec<ExternalAccount>,
    /// `(directory_email, cluster_username)` pairs added to the override store.
    pub promoted: Vec<(String, String)>,
    pub issues: Vec<ReconcileError>,
}

impl MatchOutcome {
    /// `(kind, profile_key)` pairs already taken in this run.
    pub fn claimed(&self) -> HashSet<(AccountKind, String)> {
        self.matches
            .iter()
            .map(|m| (m.account.kind, m.profile_key.clone()))
            .collect()
    }
}

pub struct MatchingEngine {
    strategies: Vec<Box<dyn MatcherStrategy>>,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(vec![
            Box::new(OverrideMatcher),
            Box::new(UsernameMatcher),
            Box::new(EmailLocalPartMatcher),
        ])
    }
}

impl MatchingEngine {
    pub fn new(strategies: Vec<Box<dyn MatcherStrategy>>) -> Self {
        Self { strategies }
    }

    fn decide(
        &self,
        account: &ExternalAccount,
        index: &ProfileIndex<'_>,
        overrides: &OverrideStore,
    ) -> (MatchMethod, Verdict) {
        for strategy in &self.strategies {
            let verdict = strategy.evaluate(account, index, overrides);
            if verdict != Verdict::NoMatch {
                return (strategy.method(), verdict);
            }
        }
        (MatchMethod::Username, Verdict::NoMatch)
    }

    /// Matches every account in order, promoting heuristic matches into the
    /// override store so later runs resolve them by override.
    pub fn run(
        &self,
        profiles: &[Profile],
        accounts: Vec<ExternalAccount>,
        overrides: &mut OverrideStore,
    ) -> MatchOutcome {
        let index = ProfileIndex::new(profiles);
        let mut outcome = MatchOutcome::default();
        let mut slots: Vec<Option<AccountMatch>> = Vec::new();
        let mut claimed: HashMap<(AccountKind, String), usize> = HashMap::new();

        for account in accounts {
            let (method, verdict) = self.decide(&account, &index, overrides);
            let key = match verdict {
                Verdict::Match(key) => key,
                Verdict::NoMatch => {
                    debug!(kind = %account.kind, username = %account.username, "no match");
                    outcome.unmatched.push(account);
                    continue;
                }
                Verdict::Ambiguous(candidates) => {
                    outcome.issues.push(ReconcileError::AmbiguousMatch {
                        kind: account.kind,
                        username: account.username.clone(),
                        candidates,
                    });
                    outcome.unmatched.push(account);
                    continue;
                }
                Verdict::Dangling(key) => {
                    outcome.issues.push(ReconcileError::UnresolvedReference {
                        profile: key,
                        field: MATCHES_CATEGORY.to_string(),
                        value: account.username.clone(),
                    });
                    outcome.unmatched.push(account);
                    continue;
                }
            };

            let claim = (account.kind, key.clone());
            if let Some(&slot) = claimed.get(&claim) {
                // an override always beats a heuristic claim, whatever the row order
                let displace = method == MatchMethod::Override
                    && slots[slot]
                        .as_ref()
                        .is_some_and(|held| held.method != MatchMethod::Override);
                if !displace {
                    warn!(
                        kind = %account.kind,
                        username = %account.username,
                        profile = %key,
                        "profile already holds a {} account this run, leaving unmatched",
                        account.kind
                    );
                    outcome.unmatched.push(account);
                    continue;
                }
                if let Some(held) = slots[slot].take() {
                    warn!(
                        profile = %key,
                        displaced = %held.account.username,
                        username = %account.username,
                        "override displaces heuristic match"
                    );
                    outcome.unmatched.push(held.account);
                }
            }

            if method.is_heuristic() {
                self.promote(&key, &account, overrides, &mut outcome.promoted);
            }
            claimed.insert(claim, slots.len());
            slots.push(Some(AccountMatch {
                profile_key: key,
                method,
                account,
            }));
        }
        outcome.matches = slots.into_iter().flatten().collect();

        for issue in &outcome.issues {
            warn!(%issue, "matching issue");
        }
        outcome
    }

    /// Promotion only fills gaps: an existing entry for the profile is never
    /// overwritten by a heuristic.
    fn promote(
        &self,
        key: &str,
        account: &ExternalAccount,
        overrides: &mut OverrideStore,
        promoted: &mut Vec<(String, String)>,
    ) {
        if overrides.contains_key(MATCHES_CATEGORY, key)
            || overrides.contains_value(MATCHES_CATEGORY, &account.username)
        {
            return;
        }
        overrides.put(MATCHES_CATEGORY, key, account.username.clone());
        info!(profile = %key, username = %account.username, "promoted heuristic match to override");
        promoted.push((key.to_string(), account.username.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idrec_core::{AccountDescriptor, RawEntry};

    fn profile(key: &str, username: Option<&str>) -> Profile {
        Profile {
            key: key.to_string(),
            name: key.to_string(),
            directory: AccountDescriptor {
                email: Some(key.to_string()),
                username: username.map(str::to_string),
                active: true,
            },
            directory_entry: RawEntry::new(),
            supervisor: None,
            co_supervisor: None,
            roster: None,
            membership_type: None,
            cluster_roles: None,
            cluster_members: None,
        }
    }

    fn account(kind: AccountKind, username: &str, email: Option<&str>) -> ExternalAccount {
        ExternalAccount {
            kind,
            username: username.to_string(),
            email: email.map(str::to_string),
            name: None,
            active: true,
            raw: RawEntry::new(),
        }
    }

    fn profiles() -> Vec<Profile> {
        vec![
            profile("john.smith000@mila.quebec", Some("john.smith000")),
            profile("john.smith001@mila.quebec", Some("john.smith001")),
            profile("jane.doe@mila.quebec", Some("doej")),
        ]
    }

    #[test]
    fn username_rule_matches_and_promotes() {
        let mut store = OverrideStore::empty("unused.json");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Member, "John.Smith000", Some("js000@yahoo.ca"))],
            &mut store,
        );
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].method, MatchMethod::Username);
        assert_eq!(out.matches[0].profile_key, "john.smith000@mila.quebec");
        assert_eq!(
            store.get(MATCHES_CATEGORY, "john.smith000@mila.quebec"),
            Some("John.Smith000")
        );
        assert_eq!(out.promoted.len(), 1);
    }

    #[test]
    fn email_local_part_rule_uses_directory_email_or_username() {
        let mut store = OverrideStore::empty("unused.json");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![
                account(AccountKind::Role, "jd-cc", Some("jane.doe@gmail.com")),
                account(AccountKind::Member, "jd-cc", Some("doej@outlook.com")),
            ],
            &mut store,
        );
        assert_eq!(out.matches.len(), 2);
        assert!(out
            .matches
            .iter()
            .all(|m| m.profile_key == "jane.doe@mila.quebec"));
        // second record resolved through the override promoted by the first
        assert_eq!(out.matches[0].method, MatchMethod::EmailLocalPart);
        assert_eq!(out.matches[1].method, MatchMethod::Override);
    }

    #[test]
    fn override_wins_over_heuristic() {
        let mut store = OverrideStore::empty("unused.json");
        store.put(MATCHES_CATEGORY, "jane.doe@mila.quebec", "john.smith001");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Member, "john.smith001", None)],
            &mut store,
        );
        assert_eq!(out.matches[0].profile_key, "jane.doe@mila.quebec");
        assert_eq!(out.matches[0].method, MatchMethod::Override);
        assert!(out.promoted.is_empty());
    }

    #[test]
    fn ambiguous_heuristic_is_left_unmatched() {
        let mut ps = profiles();
        ps.push(profile("other@mila.quebec", Some("john.smith001")));
        let mut store = OverrideStore::empty("unused.json");
        let out = MatchingEngine::default().run(
            &ps,
            vec![account(AccountKind::Role, "john.smith001", None)],
            &mut store,
        );
        assert!(out.matches.is_empty());
        assert_eq!(out.unmatched.len(), 1);
        assert!(matches!(
            out.issues.as_slice(),
            [ReconcileError::AmbiguousMatch { candidates, .. }] if candidates.len() == 2
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn dangling_override_does_not_fall_through() {
        let mut store = OverrideStore::empty("unused.json");
        store.put(MATCHES_CATEGORY, "gone@mila.quebec", "john.smith000");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Member, "john.smith000", None)],
            &mut store,
        );
        assert!(out.matches.is_empty());
        assert_eq!(out.unmatched.len(), 1);
    }

    #[test]
    fn promotion_never_overwrites_existing_profile_entry() {
        let mut store = OverrideStore::empty("unused.json");
        store.put(MATCHES_CATEGORY, "john.smith000@mila.quebec", "legacy-name");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Role, "john.smith000", None)],
            &mut store,
        );
        assert_eq!(out.matches.len(), 1);
        assert!(out.promoted.is_empty());
        assert_eq!(
            store.get(MATCHES_CATEGORY, "john.smith000@mila.quebec"),
            Some("legacy-name")
        );
    }

    #[test]
    fn second_account_of_same_kind_for_profile_stays_unmatched() {
        let mut store = OverrideStore::empty("unused.json");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![
                account(AccountKind::Member, "doej", None),
                account(AccountKind::Member, "other", Some("doej@gmail.com")),
            ],
            &mut store,
        );
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.unmatched.len(), 1);
        assert_eq!(out.unmatched[0].username, "other");
    }

    #[test]
    fn stranger_without_counterpart_is_unmatched() {
        let mut store = OverrideStore::empty("unused.json");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Member, "stranger.person", Some("ms@hotmail.com"))],
            &mut store,
        );
        assert!(out.matches.is_empty());
        assert_eq!(out.unmatched[0].username, "stranger.person");
        assert!(out.issues.is_empty());
    }

    #[test]
    fn override_displaces_earlier_heuristic_claim() {
        let ps = vec![
            profile("a@mila.quebec", Some("alice")),
            profile("b@mila.quebec", None),
        ];
        let mut store = OverrideStore::empty("unused.json");
        store.put(MATCHES_CATEGORY, "a@mila.quebec", "alice2");
        let out = MatchingEngine::default().run(
            &ps,
            vec![
                account(AccountKind::Member, "alice", None),
                account(AccountKind::Member, "alice2", None),
            ],
            &mut store,
        );
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].account.username, "alice2");
        assert_eq!(out.matches[0].profile_key, "a@mila.quebec");
        assert_eq!(out.matches[0].method, MatchMethod::Override);
        assert_eq!(out.unmatched.len(), 1);
        assert_eq!(out.unmatched[0].username, "alice");
        assert_eq!(store.get(MATCHES_CATEGORY, "a@mila.quebec"), Some("alice2"));
    }

    #[test]
    fn stale_override_key_does_not_shadow_live_one() {
        let mut store = OverrideStore::empty("unused.json");
        store.put(MATCHES_CATEGORY, "gone@mila.quebec", "stranger.person");
        store.put(MATCHES_CATEGORY, "jane.doe@mila.quebec", "stranger.person");
        let out = MatchingEngine::default().run(
            &profiles(),
            vec![account(AccountKind::Member, "stranger.person", Some("ms@hotmail.com"))],
            &mut store,
        );
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].profile_key, "jane.doe@mila.quebec");
        assert_eq!(out.matches[0].method, MatchMethod::Override);
        assert!(out.issues.is_empty());
    }
}
