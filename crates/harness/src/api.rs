//! HTTP API surface: create/get/cancel a run, list its events, and
//! download its artifacts. Built on `axum`'s `Router`/`State`/extractor
//! idiom, the same way `queue.rs` drives the `tokio` runtime underneath it.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use harness_types::{Event, EventKind, EventLevel, Run, RunStatus, WorkOrder, WritebackSpec};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::queue::JobQueue;
use crate::store::RunStore;
use crate::validators;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub queue: Arc<dyn JobQueue>,
    pub artifacts_root: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/events", get(list_events))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/artifacts/{name}", get(download_artifact))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready when the run store is reachable: a trivial lookup against a
/// nil-UUID run, which always returns `Ok(None)` on a healthy store and
/// `Err` only if the backing filesystem is unavailable.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get(Uuid::nil()) {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("store unreachable: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub repo_url: String,
    pub repo_ref: String,
    pub work_order: WorkOrder,
    #[serde(default)]
    pub work_order_body: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub writeback: WritebackSpec,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: Uuid,
    pub status: RunStatus,
    pub repo_url: String,
    pub repo_ref: String,
    pub git_sha: Option<String>,
    pub iteration: u32,
    pub result_summary: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl From<&Run> for RunResponse {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            status: run.status,
            repo_url: run.repo_url.clone(),
            repo_ref: run.repo_ref.clone(),
            git_sha: run.git_sha.clone(),
            iteration: run.iteration,
            result_summary: run.result_summary.clone(),
            error: run.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, axum::Json(ApiError { error: msg.into() })).into_response()
}

async fn create_run(State(state): State<AppState>, axum::Json(req): axum::Json<CreateRunRequest>) -> Response {
    if let Err(e) = validators::validate_repo_url(&req.repo_url) {
        return bad_request(e.to_string());
    }
    if let Err(e) = validators::validate_ref(&req.repo_ref) {
        return bad_request(e.to_string());
    }

    if let Some(key) = &req.idempotency_key {
        match state.store.find_by_idempotency_key(key) {
            Ok(Some(existing)) => return (StatusCode::OK, axum::Json(RunResponse::from(&existing))).into_response(),
            Ok(None) => {}
            Err(e) => return internal_error(e),
        }
    }

    let id = Uuid::now_v7();
    let work_order_body = req.work_order_body.clone().unwrap_or_else(|| {
        serde_json::to_string(&req.work_order).unwrap_or_default()
    });
    let run = Run {
        id,
        status: RunStatus::Pending,
        created_at: chrono::Utc::now(),
        started_at: None,
        finished_at: None,
        idempotency_key: req.idempotency_key,
        repo_url: req.repo_url,
        repo_ref: req.repo_ref,
        git_sha: None,
        work_order: req.work_order,
        work_order_body,
        params: req.params,
        writeback: req.writeback,
        iteration: 0,
        queue_job_id: None,
        result_summary: None,
        error: None,
        artifact_root: state.artifacts_root.join("factory").join(id.to_string()),
    };

    let created = match state.store.create(run) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("failed to create run: {e}")),
    };

    if let Err(e) = append_event(&state, id, EventLevel::Info, EventKind::RunCreated, serde_json::json!({})) {
        return internal_error(e);
    }

    if let Err(e) = state.queue.submit(id) {
        warn!(run_id = %id, error = %e, "failed to enqueue run");
        return internal_error(e);
    }

    (StatusCode::CREATED, axum::Json(RunResponse::from(&created))).into_response()
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id) {
        Ok(Some(run)) => (StatusCode::OK, axum::Json(RunResponse::from(&run))).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal_error(e),
    }
}

async fn list_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    }
    match state.store.list_events(id) {
        Ok(events) => (StatusCode::OK, axum::Json(events)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let run = match state.store.get(id) {
        Ok(Some(r)) => r,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };

    if crate::store::is_terminal(run.status) {
        return (StatusCode::OK, axum::Json(RunResponse::from(&run))).into_response();
    }

    let mut run = run;
    run.status = RunStatus::Canceled;
    run.finished_at = Some(chrono::Utc::now());
    if let Err(e) = state.store.update(&run) {
        return internal_error(e);
    }
    if let Err(e) = append_event(&state, id, EventLevel::Info, EventKind::Canceled, serde_json::json!({})) {
        return internal_error(e);
    }

    (StatusCode::OK, axum::Json(RunResponse::from(&run))).into_response()
}

async fn download_artifact(State(state): State<AppState>, Path((id, name)): Path<(Uuid, String)>) -> Response {
    let artifacts = match state.store.list_artifacts(id) {
        Ok(a) => a,
        Err(e) => return internal_error(e),
    };
    let Some(artifact) = artifacts.into_iter().find(|a| a.name == name) else {
        return not_found();
    };
    match std::fs::read(&artifact.path) {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", artifact.content_type.clone())],
            bytes,
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn append_event(
    state: &AppState,
    run_id: Uuid,
    level: EventLevel,
    kind: EventKind,
    payload: serde_json::Value,
) -> anyhow::Result<Event> {
    state.store.append_event(Event {
        id: 0,
        run_id,
        ts: chrono::Utc::now(),
        level,
        kind,
        iteration: None,
        payload,
    })
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, axum::Json(ApiError { error: "not found".to_string() })).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ApiError { error: validators::sanitize(&e.to_string()) }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileRunStore;
    use axum::body::Body;
    use axum::http::Request;
    use harness_types::CommandSpec;
    use tower::ServiceExt;

    struct NoopQueue;
    impl JobQueue for NoopQueue {
        fn submit(&self, _run_id: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn sample_work_order() -> WorkOrder {
        WorkOrder {
            id: "WO-01".to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: vec!["a.txt".to_string()],
            forbidden: vec![],
            acceptance_commands: vec![CommandSpec { command: "true".to_string(), shell: false, timeout_sec: 10 }],
            context_files: vec![],
            preconditions: vec![],
            postconditions: vec![],
            verify_exempt: false,
            notes: None,
            env: Default::default(),
        }
    }

    fn test_state() -> (AppState, tempfile::TempDir) {
        let td = tempfile::tempdir().unwrap();
        let store = Arc::new(FileRunStore::open(td.path().join("store")).unwrap());
        let state = AppState {
            store,
            queue: Arc::new(NoopQueue),
            artifacts_root: td.path().join("artifacts"),
        };
        (state, td)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (state, _td) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_returns_ok_for_healthy_store() {
        let (state, _td) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_rejects_invalid_repo_url() {
        let (state, _td) = test_state();
        let app = router(state);
        let body = serde_json::json!({
            "repo_url": "not-a-url",
            "repo_ref": "main",
            "work_order": sample_work_order(),
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_then_get_run_roundtrips() {
        let (state, _td) = test_state();
        let app = router(state);
        let body = serde_json::json!({
            "repo_url": "https://github.com/acme/widgets",
            "repo_ref": "main",
            "work_order": sample_work_order(),
        });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let created: RunResponse = serde_json::from_slice(&bytes).unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_run_returns_404_for_unknown_id() {
        let (state, _td) = test_state();
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}", Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_run_transitions_pending_to_canceled() {
        let (state, _td) = test_state();
        let app = router(state);
        let body = serde_json::json!({
            "repo_url": "https://github.com/acme/widgets",
            "repo_ref": "main",
            "work_order": sample_work_order(),
        });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let created: RunResponse = serde_json::from_slice(&bytes).unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/runs/{}/cancel", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let canceled: RunResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(canceled.status, RunStatus::Canceled);
    }
}
