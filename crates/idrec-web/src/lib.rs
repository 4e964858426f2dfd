//! Read-only JSON API over reconciled user records and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use idrec_storage::DocumentStore;
use idrec_sync::{
    find_user_by_cluster_username, find_user_by_key, list_users, ReconcileConfig, RunSummary,
};
use serde_json::json;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "idrec-web";

const RUN_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub collection: String,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            reports_dir: reports_dir.into(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/users", get(users_handler))
        .route("/users/{key}", get(user_handler))
        .route(
            "/users/by-cluster-username/{username}",
            get(user_by_cluster_username_handler),
        )
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_config(config: &ReconcileConfig) -> anyhow::Result<()> {
    let store = config.document_store().await?;
    let state = AppState::new(store, config.collection.clone(), config.reports_dir.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

async fn users_handler(State(state): State<Arc<AppState>>) -> Response {
    match list_users(state.store.as_ref(), &state.collection).await {
        Ok(users) => Json(users).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    match find_user_by_key(state.store.as_ref(), &state.collection, &key).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => not_found(format!("no user with key {key}")),
        Err(err) => server_error(err.into()),
    }
}

async fn user_by_cluster_username_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(username): AxumPath<String>,
) -> Response {
    match find_user_by_cluster_username(state.store.as_ref(), &state.collection, &username).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => not_found(format!("no user with cluster username {username}")),
        Err(err) => server_error(err.into()),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.reports_dir, RUN_LIMIT).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

/// Newest first. Directories without a readable summary are skipped.
async fn load_runs(reports_dir: &Path, limit: usize) -> anyhow::Result<Vec<RunSummary>> {
    let mut entries = match fs::read_dir(reports_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut runs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path().join("run_summary.json");
        let Ok(bytes) = fs::read(&path).await else {
            continue;
        };
        match serde_json::from_slice::<RunSummary>(&bytes) {
            Ok(run) => runs.push(run),
            Err(err) => warn!(path = %path.display(), error = %err, "unreadable run summary"),
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use idrec_core::{AccountDescriptor, CanonicalRecord, RawEntry};
    use idrec_storage::MemoryDocumentStore;
    use idrec_sync::{upsert_all, DEFAULT_COLLECTION};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn record(key: &str, member: Option<&str>) -> CanonicalRecord {
        let members: Option<RawEntry> = member.map(|username| {
            json!({"username": username})
                .as_object()
                .cloned()
                .unwrap()
        });
        CanonicalRecord {
            key: key.to_string(),
            name: key.to_string(),
            directory: AccountDescriptor {
                email: Some(key.to_string()),
                username: None,
                active: true,
            },
            directory_entry: RawEntry::new(),
            supervisor: None,
            co_supervisor: None,
            roster: None,
            membership_type: None,
            cluster_roles: None,
            cluster: member.map(|username| AccountDescriptor {
                email: None,
                username: Some(username.to_string()),
                active: true,
            }),
            cluster_members: members,
        }
    }

    async fn state(reports_dir: &Path) -> AppState {
        let store = Arc::new(MemoryDocumentStore::new());
        upsert_all(
            store.as_ref(),
            DEFAULT_COLLECTION,
            &[
                record("john.smith001@mila.quebec", Some("john.smith001")),
                record("john.smith006@mila.quebec", Some("stranger.person")),
                record("john.smith007@mila.quebec", None),
            ],
        )
        .await
        .unwrap();
        AppState::new(store, DEFAULT_COLLECTION, reports_dir)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(app(state(dir.path()).await), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn users_are_listed_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(app(state(dir.path()).await), "/users").await;
        assert_eq!(status, StatusCode::OK);
        let keys: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["key"].as_str().unwrap())
            .collect();
        assert_eq!(
            keys,
            ["john.smith001@mila.quebec", "john.smith006@mila.quebec", "john.smith007@mila.quebec"]
        );
    }

    #[tokio::test]
    async fn user_lookups_by_key_and_cluster_username() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = get_json(app.clone(), "/users/john.smith007@mila.quebec").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cluster"], JsonValue::Null);

        let (status, body) =
            get_json(app.clone(), "/users/by-cluster-username/stranger.person").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "john.smith006@mila.quebec");

        let (status, _) = get_json(app.clone(), "/users/nobody@mila.quebec").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app, "/users/by-cluster-username/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn runs_are_empty_without_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) =
            get_json(app(state(&dir.path().join("missing")).await), "/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    fn write_summary(reports_dir: &Path, run: &str, run_id: &str, started_at: &str) {
        let dir = reports_dir.join(run);
        std::fs::create_dir_all(&dir).unwrap();
        let summary = json!({
            "run_id": run_id,
            "started_at": started_at,
            "finished_at": started_at,
            "profiles": 3,
            "accounts": 2,
            "matches_by_method": {"username": 1},
            "promoted": [],
            "interactive": [],
            "prompt_cancelled": false,
            "unmatched": [],
            "issues": [],
            "upserted": 3,
            "archived_sources": [],
            "reports_dir": null,
        });
        std::fs::write(dir.join("run_summary.json"), summary.to_string()).unwrap();
    }

    #[tokio::test]
    async fn runs_are_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let older = "6f1d2c3b-0000-4000-8000-000000000001";
        let newer = "6f1d2c3b-0000-4000-8000-000000000002";
        write_summary(dir.path(), "run-a", newer, "2024-05-02T10:00:00Z");
        write_summary(dir.path(), "run-b", older, "2024-05-01T10:00:00Z");
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let (status, body) = get_json(app(state(dir.path()).await), "/runs").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["run_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, [newer, older]);

        let runs = load_runs(dir.path(), 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id.to_string(), newer);
    }
}
