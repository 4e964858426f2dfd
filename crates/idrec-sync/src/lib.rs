//! Reconciliation run orchestration: configuration, the per-run pipeline and
//! run reports.

pub mod matching;
pub mod normalize;
pub mod prompt;
pub mod records;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use idrec_adapters::{
    parse_external_account, ClusterAccountSource, CsvClusterAccounts, CsvRoster,
    DirectorySource, HttpDirectory, RosterSource, SnapshotDirectory,
};
use idrec_core::{AccountKind, ExternalAccount, RawEntry, ReconcileError, SourceKind};
use idrec_storage::{
    ArtifactStore, BackoffPolicy, DocumentStore, HttpFetcher, MemoryDocumentStore,
    OverrideStore, PgDocumentStore,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use matching::{AccountMatch, MatchMethod, MatchOutcome, MatchingEngine};
pub use normalize::{Normalized, Normalizer, RosterColumns};
pub use prompt::{InteractiveResolver, Operator, OperatorIo, PromptOutcome};
pub use records::{
    find_user_by_cluster_username, find_user_by_key, list_users, merge, upsert_all,
    DEFAULT_COLLECTION,
};

pub const CRATE_NAME: &str = "idrec-sync";

pub const DEFAULT_CONFIG_PATH: &str = "idrec.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// JSON export of directory entries. Takes precedence over `endpoint`.
    pub snapshot: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            snapshot: None,
            endpoint: None,
            token: None,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub database_url: Option<String>,
    pub directory: DirectoryConfig,
    pub roster_path: Option<PathBuf>,
    pub roster_columns: RosterColumns,
    pub roles_path: PathBuf,
    pub members_path: PathBuf,
    pub overrides_path: PathBuf,
    pub collection: String,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub candidate_limit: usize,
    pub web_port: u16,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            directory: DirectoryConfig::default(),
            roster_path: None,
            roster_columns: RosterColumns::default(),
            roles_path: PathBuf::from("data/cluster_roles.csv"),
            members_path: PathBuf::from("data/cluster_members.csv"),
            overrides_path: PathBuf::from("data/overrides.json"),
            collection: DEFAULT_COLLECTION.to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            candidate_limit: 10,
            web_port: 8000,
        }
    }
}

impl ReconcileConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing reconcile config")
    }

    /// Reads the YAML file (explicit path, else `IDREC_CONFIG`, else
    /// `idrec.yaml`) and applies environment overrides. Only an explicitly
    /// named file has to exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("IDREC_CONFIG").ok().map(PathBuf::from);
        let required = explicit.is_some() || env_path.is_some();
        let path = explicit
            .map(Path::to_path_buf)
            .or(env_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_yaml_str(&text)
                .with_context(|| format!("loading {}", path.display()))?,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("IDREC_OVERRIDES_PATH") {
            self.overrides_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("IDREC_ROSTER_PATH") {
            self.roster_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("IDREC_DIRECTORY_SNAPSHOT") {
            self.directory.snapshot = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("IDREC_DIRECTORY_ENDPOINT") {
            self.directory.endpoint = Some(v);
        }
        if let Some(v) = lookup("IDREC_DIRECTORY_TOKEN") {
            self.directory.token = Some(v);
        }
        if let Some(v) = lookup("IDREC_ROLES_PATH") {
            self.roles_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("IDREC_MEMBERS_PATH") {
            self.members_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("IDREC_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("IDREC_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("IDREC_WEB_PORT") {
            match v.parse() {
                Ok(port) => self.web_port = port,
                Err(_) => warn!(value = %v, "ignoring invalid IDREC_WEB_PORT"),
            }
        }
    }

    pub fn sources(&self) -> Result<Sources> {
        let directory: Box<dyn DirectorySource> =
            match (&self.directory.snapshot, &self.directory.endpoint) {
                (Some(path), _) => Box::new(SnapshotDirectory::new(path)),
                (None, Some(endpoint)) => {
                    let http = HttpFetcher::new(
                        Duration::from_secs(self.directory.timeout_secs),
                        BackoffPolicy::default(),
                    )?;
                    Box::new(HttpDirectory::new(
                        endpoint.clone(),
                        self.directory.token.clone(),
                        http,
                    ))
                }
                (None, None) => anyhow::bail!(
                    "no directory source configured (set directory.snapshot or directory.endpoint)"
                ),
            };
        let roster = self
            .roster_path
            .as_ref()
            .map(|path| Box::new(CsvRoster::new(path)) as Box<dyn RosterSource>);
        Ok(Sources {
            directory,
            roster,
            cluster: Box::new(CsvClusterAccounts::new(&self.roles_path, &self.members_path)),
        })
    }

    /// Postgres when `database_url` is set, otherwise a process-local store.
    pub async fn document_store(&self) -> Result<Arc<dyn DocumentStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgDocumentStore::connect(url)
                    .await
                    .context("connecting to document store")?;
                Ok(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory document store; nothing will persist");
                Ok(Arc::new(MemoryDocumentStore::new()))
            }
        }
    }
}

pub struct Sources {
    pub directory: Box<dyn DirectorySource>,
    pub roster: Option<Box<dyn RosterSource>>,
    pub cluster: Box<dyn ClusterAccountSource>,
}

/// Raw payloads of one run, exactly as delivered.
struct Loaded {
    directory: Vec<RawEntry>,
    roster: Vec<RawEntry>,
    roles: Vec<RawEntry>,
    members: Vec<RawEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub directory_email: String,
    pub cluster_username: String,
}

impl From<(String, String)> for OverrideEntry {
    fn from((directory_email, cluster_username): (String, String)) -> Self {
        Self {
            directory_email,
            cluster_username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedAccount {
    pub kind: AccountKind,
    pub username: String,
    pub email: Option<String>,
}

impl From<&ExternalAccount> for UnmatchedAccount {
    fn from(account: &ExternalAccount) -> Self {
        Self {
            kind: account.kind,
            username: account.username.clone(),
            email: account.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub profiles: usize,
    pub accounts: usize,
    pub matches_by_method: BTreeMap<String, usize>,
    pub promoted: Vec<OverrideEntry>,
    pub interactive: Vec<OverrideEntry>,
    pub prompt_cancelled: bool,
    pub unmatched: Vec<UnmatchedAccount>,
    pub issues: Vec<ReconcileError>,
    pub upserted: usize,
    pub archived_sources: Vec<String>,
    pub reports_dir: Option<String>,
}

pub struct ReconcilePipeline {
    sources: Sources,
    store: Arc<dyn DocumentStore>,
    collection: String,
    overrides_path: PathBuf,
    normalizer: Normalizer,
    engine: MatchingEngine,
    resolver: InteractiveResolver,
    artifacts: Option<ArtifactStore>,
    reports_dir: Option<PathBuf>,
}

impl ReconcilePipeline {
    pub fn new(sources: Sources, store: Arc<dyn DocumentStore>, overrides_path: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            store,
            collection: DEFAULT_COLLECTION.to_string(),
            overrides_path: overrides_path.into(),
            normalizer: Normalizer::default(),
            engine: MatchingEngine::default(),
            resolver: InteractiveResolver::default(),
            artifacts: None,
            reports_dir: None,
        }
    }

    pub fn from_config(
        config: &ReconcileConfig,
        sources: Sources,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self::new(sources, store, config.overrides_path.clone())
            .with_collection(config.collection.clone())
            .with_normalizer(Normalizer::new(config.roster_columns.clone()))
            .with_resolver(InteractiveResolver::new(config.candidate_limit))
            .with_artifacts(ArtifactStore::new(config.artifacts_dir.clone()))
            .with_reports_dir(config.reports_dir.clone())
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_engine(mut self, engine: MatchingEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_resolver(mut self, resolver: InteractiveResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// One reconciliation run. With an operator, unmatched accounts go
    /// through the interactive workflow; without one they stay unmatched.
    ///
    /// A `SourceUnavailable` failure aborts before the override store is
    /// saved and before anything is upserted.
    pub async fn run_once(&self, operator: Option<&mut dyn OperatorIo>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, operator)
            .instrument(info_span!("reconcile", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        operator: Option<&mut dyn OperatorIo>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let loaded = self.load_sources().await?;
        let archived_sources = self.archive_sources(started_at, &loaded).await?;

        let mut overrides = OverrideStore::load(&self.overrides_path)
            .await
            .map_err(|err| ReconcileError::unavailable(SourceKind::Overrides, err))?;
        let overrides_before = overrides.len();

        let Normalized {
            profiles,
            mut issues,
            orphan_roster_rows,
        } = self.normalizer.normalize(loaded.directory, loaded.roster);
        info!(
            profiles = profiles.len(),
            orphan_roster_rows = orphan_roster_rows.len(),
            "normalized"
        );

        let mut accounts = Vec::new();
        for (kind, rows) in [
            (AccountKind::Role, loaded.roles),
            (AccountKind::Member, loaded.members),
        ] {
            for (index, raw) in rows.into_iter().enumerate() {
                match parse_external_account(kind, index, raw) {
                    Ok(account) => accounts.push(account),
                    Err(issue) => {
                        warn!(%issue, "skipping cluster account");
                        issues.push(issue);
                    }
                }
            }
        }
        let account_count = accounts.len();

        let mut outcome = self.engine.run(&profiles, accounts, &mut overrides);
        issues.append(&mut outcome.issues);
        let mut matches = outcome.matches;
        let mut unmatched = outcome.unmatched;
        let mut interactive = Vec::new();
        let mut prompt_cancelled = false;

        if let Some(operator) = operator {
            if !unmatched.is_empty() {
                let claimed = matches
                    .iter()
                    .map(|m| (m.account.kind, m.profile_key.clone()))
                    .collect();
                let prompted = self.resolver.resolve(
                    unmatched,
                    &profiles,
                    claimed,
                    &mut overrides,
                    operator,
                );
                matches.extend(prompted.matches);
                unmatched = prompted.unmatched;
                interactive = prompted.new_overrides;
                prompt_cancelled = prompted.cancelled;
            }
        }

        overrides.save().await.context("saving override store")?;
        info!(
            before = overrides_before,
            after = overrides.len(),
            path = %self.overrides_path.display(),
            "override store saved"
        );

        let profile_count = profiles.len();
        let mut matches_by_method: BTreeMap<String, usize> = BTreeMap::new();
        for m in &matches {
            *matches_by_method.entry(m.method.to_string()).or_default() += 1;
        }

        let records = merge(profiles, &matches);
        let upserted = upsert_all(self.store.as_ref(), &self.collection, &records)
            .await
            .map_err(|err| ReconcileError::unavailable(SourceKind::DocumentStore, err))?;
        info!(upserted, unmatched = unmatched.len(), issues = issues.len(), "reconciled");

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            profiles: profile_count,
            accounts: account_count,
            matches_by_method,
            promoted: outcome.promoted.into_iter().map(OverrideEntry::from).collect(),
            interactive: interactive.into_iter().map(OverrideEntry::from).collect(),
            prompt_cancelled,
            unmatched: unmatched.iter().map(UnmatchedAccount::from).collect(),
            issues,
            upserted,
            archived_sources,
            reports_dir: None,
        };
        if let Some(root) = &self.reports_dir {
            let dir = write_reports(root, &summary).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }
        Ok(summary)
    }

    async fn load_sources(&self) -> Result<Loaded> {
        let directory = self
            .sources
            .directory
            .query()
            .await
            .map_err(|err| ReconcileError::unavailable(SourceKind::Directory, err))?;
        info!(source = %self.sources.directory.describe(), entries = directory.len(), "directory loaded");

        let roster = match &self.sources.roster {
            Some(source) => {
                let rows = source
                    .read()
                    .await
                    .map_err(|err| ReconcileError::unavailable(SourceKind::Roster, err))?;
                info!(source = %source.describe(), rows = rows.len(), "roster loaded");
                rows
            }
            None => Vec::new(),
        };

        let roles = self
            .sources
            .cluster
            .read(AccountKind::Role)
            .await
            .map_err(|err| ReconcileError::unavailable(SourceKind::ClusterRoles, err))?;
        let members = self
            .sources
            .cluster
            .read(AccountKind::Member)
            .await
            .map_err(|err| ReconcileError::unavailable(SourceKind::ClusterMembers, err))?;
        info!(
            source = %self.sources.cluster.describe(),
            roles = roles.len(),
            members = members.len(),
            "cluster accounts loaded"
        );

        Ok(Loaded {
            directory,
            roster,
            roles,
            members,
        })
    }

    async fn archive_sources(
        &self,
        captured_at: DateTime<Utc>,
        loaded: &Loaded,
    ) -> Result<Vec<String>> {
        let Some(artifacts) = &self.artifacts else {
            return Ok(Vec::new());
        };
        let mut paths = Vec::new();
        for (source, rows) in [
            (SourceKind::Directory, &loaded.directory),
            (SourceKind::Roster, &loaded.roster),
            (SourceKind::ClusterRoles, &loaded.roles),
            (SourceKind::ClusterMembers, &loaded.members),
        ] {
            let bytes = serde_json::to_vec_pretty(rows)
                .with_context(|| format!("serializing {source} payload"))?;
            let archived = artifacts.archive(captured_at, source, &bytes).await?;
            if archived.deduplicated {
                info!(%source, path = %archived.relative_path.display(), "raw payload unchanged");
            }
            paths.push(archived.relative_path.display().to_string());
        }
        Ok(paths)
    }
}

async fn write_reports(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("reconcile_brief.md"), render_brief(summary))
        .await
        .context("writing reconcile_brief.md")?;
    Ok(reports_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let bullets = |lines: Vec<String>| {
        if lines.is_empty() {
            "- none".to_string()
        } else {
            lines.join("\n")
        }
    };
    format!(
        "# Reconcile Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Profiles: {}\n- Cluster accounts: {}\n- Upserted: {}\n- Prompt cancelled: {}\n\n## Matches\n{}\n\n## New Overrides\n{}\n\n## Unmatched\n{}\n\n## Issues\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.profiles,
        summary.accounts,
        summary.upserted,
        summary.prompt_cancelled,
        bullets(
            summary
                .matches_by_method
                .iter()
                .map(|(method, n)| format!("- {method}: {n}"))
                .collect()
        ),
        bullets(
            summary
                .promoted
                .iter()
                .map(|e| (e, "promoted"))
                .chain(summary.interactive.iter().map(|e| (e, "interactive")))
                .map(|(e, how)| format!("- {} -> {} ({how})", e.directory_email, e.cluster_username))
                .collect()
        ),
        bullets(
            summary
                .unmatched
                .iter()
                .map(|u| format!("- {} `{}`", u.kind, u.username))
                .collect()
        ),
        bullets(summary.issues.iter().map(|i| format!("- {i}")).collect()),
    )
}

/// Builds everything from configuration and runs once. `interactive` wires
/// the prompt to stdin/stdout.
pub async fn run_from_config(config: &ReconcileConfig, interactive: bool) -> Result<RunSummary> {
    let sources = config.sources()?;
    let store = config.document_store().await?;
    let pipeline = ReconcilePipeline::from_config(config, sources, store);
    if interactive {
        let mut operator = Operator::stdio();
        let operator: &mut dyn OperatorIo = &mut operator;
        pipeline.run_once(Some(operator)).await
    } else {
        pipeline.run_once(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = ReconcileConfig::from_yaml_str(
            "directory:\n  snapshot: ldap.json\nroster_columns:\n  email: Email\ncandidate_limit: 5\n",
        )
        .expect("config");
        assert_eq!(config.directory.snapshot, Some(PathBuf::from("ldap.json")));
        assert_eq!(config.directory.timeout_secs, 20);
        assert_eq!(config.roster_columns.email, "Email");
        assert_eq!(config.roster_columns.supervisor, "Supervisor Principal");
        assert_eq!(config.candidate_limit, 5);
        assert_eq!(config.collection, "users");
    }

    #[test]
    fn env_overrides_yaml_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://idrec@localhost/idrec"),
            ("IDREC_OVERRIDES_PATH", "/tmp/o.json"),
            ("IDREC_WEB_PORT", "not-a-port"),
            ("IDREC_MEMBERS_PATH", "m.csv"),
        ]);
        let mut config = ReconcileConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://idrec@localhost/idrec"));
        assert_eq!(config.overrides_path, PathBuf::from("/tmp/o.json"));
        assert_eq!(config.members_path, PathBuf::from("m.csv"));
        assert_eq!(config.web_port, 8000);
    }

    #[test]
    fn sources_require_a_directory() {
        let config = ReconcileConfig::default();
        assert!(config.sources().is_err());
    }

    #[test]
    fn brief_lists_unmatched_accounts() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            profiles: 1,
            accounts: 1,
            matches_by_method: BTreeMap::new(),
            promoted: Vec::new(),
            interactive: Vec::new(),
            prompt_cancelled: false,
            unmatched: vec![UnmatchedAccount {
                kind: AccountKind::Member,
                username: "stranger.person".into(),
                email: None,
            }],
            issues: Vec::new(),
            upserted: 1,
            archived_sources: Vec::new(),
            reports_dir: None,
        };
        let brief = render_brief(&summary);
        assert!(brief.contains("- member `stranger.person`"));
        assert!(brief.contains("## Issues\n- none"));
    }

    #[test]
    fn run_summary_issues_survive_json() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            profiles: 2,
            accounts: 1,
            matches_by_method: BTreeMap::new(),
            promoted: Vec::new(),
            interactive: Vec::new(),
            prompt_cancelled: false,
            unmatched: Vec::new(),
            issues: vec![
                ReconcileError::AmbiguousMatch {
                    kind: AccountKind::Role,
                    username: "john.smith001".into(),
                    candidates: vec!["a@mila.quebec".into(), "b@mila.quebec".into()],
                },
                ReconcileError::malformed(SourceKind::Roster, 3, "missing email"),
            ],
            upserted: 2,
            archived_sources: Vec::new(),
            reports_dir: None,
        };

        let value = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(value["issues"][0]["condition"], "ambiguous_match");
        assert_eq!(value["issues"][0]["kind"], "role");
        let back: RunSummary = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.issues, summary.issues);
    }
}
