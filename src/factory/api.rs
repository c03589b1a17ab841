use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::agent::CodingAgent;
use super::code_jobs::{CodeJobCoordinator, SubmitCodeJob};
use super::db::DbHandle;
use super::gateway::SimilarityIndex;
use super::git::RepoDriver;
use super::models::GameSpecDetail;
use super::spec_jobs::{CreateSpecJob, SpecJobCoordinator, SpecJobOutcome};
use super::state::StateTracker;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

/// Maximum number of specs returned by `GET /api/specs`.
const SPEC_LIST_LIMIT: i64 = 50;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub tracker: StateTracker,
    pub spec_jobs: SpecJobCoordinator,
    pub code_jobs: Arc<CodeJobCoordinator>,
    pub index: Arc<dyn SimilarityIndex>,
    pub repo: Arc<dyn RepoDriver>,
    pub agent: Arc<dyn CodingAgent>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SetStateRequest {
    pub state: String,
    pub detail: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        let message = err.to_string();
        match err {
            FactoryError::InvalidInput(_) | FactoryError::Configuration(_) => {
                ApiError::BadRequest(message)
            }
            FactoryError::NotFound { .. } => ApiError::NotFound(message),
            FactoryError::Conflict(_) | FactoryError::InvalidTransition { .. } => {
                ApiError::Conflict(message)
            }
            FactoryError::Upstream { .. } => ApiError::BadGateway(message),
            FactoryError::QueueFull => ApiError::Unavailable(message),
            FactoryError::Database(_) | FactoryError::Other(_) => {
                tracing::error!(error = %message, "Request failed");
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/spec-jobs", post(create_spec_job))
        .route("/api/spec-jobs/{id}", get(get_spec_job))
        .route("/api/specs", get(list_specs))
        .route("/api/specs/{id}", get(get_spec).delete(delete_spec))
        .route("/api/specs/{id}/devin-task", post(create_devin_task))
        .route("/api/specs/{id}/state-logs", get(get_state_logs))
        .route("/api/specs/{id}/state", put(set_spec_state))
        .route("/api/specs/{id}/code-job", get(get_latest_code_job))
        .route("/api/specs/{id}/retry-code", post(retry_code_job))
        .route("/api/code-jobs", post(submit_code_job))
        .route("/api/code-jobs/{id}", get(get_code_job))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_spec_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateSpecJob>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.spec_jobs.create(req).await?;
    let status = match outcome {
        SpecJobOutcome::Completed { .. } => StatusCode::CREATED,
        SpecJobOutcome::Duplicate { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn get_spec_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.spec_jobs.get(&id).await?))
}

async fn list_specs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let specs = state
        .db
        .call(|db| db.list_game_specs(SPEC_LIST_LIMIT))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(specs))
}

async fn get_spec(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let found = state
        .db
        .call(move |db| {
            let Some(spec) = db.get_game_spec(&lookup)? else {
                return Ok(None);
            };
            let logs = db.get_state_logs(&lookup)?;
            Ok(Some((spec, logs)))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let (spec, state_logs) =
        found.ok_or_else(|| ApiError::NotFound(format!("Game spec {} not found", id)))?;

    let devin_session_url = spec
        .devin_session_id
        .as_deref()
        .map(|sid| state.agent.session_url(sid));
    Ok(Json(GameSpecDetail {
        spec,
        state_logs,
        devin_session_url,
    }))
}

async fn delete_spec(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let spec = state
        .db
        .call(move |db| db.get_game_spec(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Game spec {} not found", id)))?;

    let fenced = id.clone();
    if let Some(job_id) = state
        .db
        .call(move |db| db.fence_code_jobs_for_delete(&fenced, "cancelled: game spec deleted"))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        return Err(ApiError::Conflict(format!(
            "Game spec {} has code job {} in progress",
            id, job_id
        )));
    }

    state.index.delete(&id).await?;

    let git_cleanup = if state.repo.is_configured() {
        match state.repo.remove_game_folders(&spec.id, &spec.title).await {
            Ok(()) => "success",
            Err(e) => {
                tracing::warn!(spec_id = %id, error = %e, "Failed to remove game folder");
                "failed"
            }
        }
    } else {
        "skipped"
    };

    let target = id.clone();
    state
        .db
        .call(move |db| db.delete_game_spec(&target))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(spec_id = %id, git_cleanup, "Game spec deleted");
    broadcast_message(&state.ws_tx, &WsMessage::SpecDeleted { spec_id: id.clone() });

    let mut body = serde_json::json!({
        "message": "Spec deleted successfully",
        "id": id,
        "git_cleanup": git_cleanup,
    });
    if git_cleanup == "failed" {
        body["git_cleanup_warning"] = "Git folder may still exist in repository".into();
    }
    Ok(Json(body))
}

async fn create_devin_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let spec = state
        .db
        .call(move |db| db.get_game_spec(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Game spec {} not found", id)))?;

    if !state.repo.is_configured() {
        return Err(ApiError::BadRequest(
            "Git repository not configured. Coding agent tasks require git integration.".into(),
        ));
    }

    let session = state.agent.create_session(&spec.id, &spec.title).await?;

    let (spec_id, session_id) = (spec.id.clone(), session.session_id.clone());
    if let Err(e) = state
        .db
        .call(move |db| db.set_devin_session_id(&spec_id, &session_id))
        .await
    {
        tracing::warn!(spec_id = %spec.id, error = %e, "Failed to store coding agent session id");
    }

    Ok(Json(serde_json::json!({
        "message": "Coding agent task created successfully",
        "spec_id": spec.id,
        "game_title": spec.title,
        "session_id": session.session_id,
        "session_url": state.agent.session_url(&session.session_id),
        "repository": state.repo.browse_url(&spec.id),
    })))
}

async fn get_state_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let state_logs = state.tracker.history(&id).await?;
    Ok(Json(serde_json::json!({
        "spec_id": id,
        "state_logs": state_logs,
    })))
}

async fn set_spec_state(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SetStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .tracker
        .transition(&id, &req.state, req.detail.as_deref())
        .await?;
    Ok(Json(record))
}

async fn submit_code_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitCodeJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.code_jobs.submit(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"job_id": job.id, "status": job.status})),
    ))
}

async fn get_code_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.code_jobs.get(&id).await?))
}

async fn get_latest_code_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.code_jobs.latest_for_spec(&id).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok(Json(serde_json::json!({"status": "not_started"})).into_response()),
    }
}

async fn retry_code_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.code_jobs.retry_for_spec(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"job_id": job.id, "status": job.status})),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, WorkerConfig};
    use crate::factory::db::FactoryDb;
    use crate::factory::models::SimilarSpec;
    use crate::factory::test_support::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: SharedState,
        index: Arc<MockIndex>,
        repo: Arc<MockRepo>,
        _rx: tokio::sync::mpsc::Receiver<String>,
    }

    fn test_app_with(generator: MockGenerator, index: MockIndex, repo: MockRepo) -> TestApp {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let (ws_tx, _) = broadcast::channel(16);
        let tracker = StateTracker::new(db.clone(), ws_tx.clone());
        let index = Arc::new(index);
        let repo = Arc::new(repo);
        let agent = Arc::new(MockAgent::ok());
        let (code_jobs, rx) = CodeJobCoordinator::new(
            db.clone(),
            tracker.clone(),
            repo.clone(),
            agent.clone(),
            ws_tx.clone(),
            WorkerConfig::default(),
            CancellationToken::new(),
        );
        let spec_jobs = SpecJobCoordinator::new(
            db.clone(),
            Arc::new(generator),
            index.clone(),
            code_jobs.clone(),
            ws_tx.clone(),
            &GatewayConfig::default(),
        );
        let state = Arc::new(AppState {
            db,
            ws_tx,
            tracker,
            spec_jobs,
            code_jobs,
            index: index.clone(),
            repo: repo.clone(),
            agent,
        });
        TestApp {
            router: api_router().with_state(state.clone()),
            state,
            index,
            repo,
            _rx: rx,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::default(),
            MockRepo::configured(),
        )
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        router.clone().oneshot(request).await.unwrap()
    }

    async fn create_spec(app: &TestApp) -> String {
        let response = send(
            &app.router,
            "POST",
            "/api/spec-jobs",
            Some(json!({"brief": "dodge falling blocks"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = body_json(response.into_body()).await;
        body["result_spec_id"].as_str().unwrap().to_string()
    }

    // 1. Health check
    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = send(&app.router, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    // 2. Create spec job (novel)
    #[tokio::test]
    async fn test_create_spec_job_completed() {
        let app = test_app();
        let response = send(
            &app.router,
            "POST",
            "/api/spec-jobs",
            Some(json!({"brief": "dodge falling blocks", "constraints": {"max_duration": 60}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "COMPLETED");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let response = send(&app.router, "GET", &format!("/api/spec-jobs/{}", job_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let job: Value = body_json(response.into_body()).await;
        assert_eq!(job["status"], "COMPLETED");
        assert_eq!(job["result_spec_id"], body["result_spec_id"]);
        assert!(job.get("duplicate_list").is_none());
    }

    // 3. Create spec job (duplicate)
    #[tokio::test]
    async fn test_create_spec_job_duplicate() {
        let app = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::with_hits(vec![SimilarSpec {
                id: "A".into(),
                title: "Block Dodger".into(),
                score: 0.93,
            }]),
            MockRepo::configured(),
        );
        let response = send(&app.router, "POST", "/api/spec-jobs", Some(json!({"brief": "dodge"}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "DUPLICATE");
        assert_eq!(body["duplicate_list"][0]["id"], "A");
        assert_eq!(body["duplicate_list"][0]["score"], 0.93);
    }

    // 4. Validation and upstream errors
    #[tokio::test]
    async fn test_create_spec_job_errors() {
        let app = test_app();
        let response = send(&app.router, "POST", "/api/spec-jobs", Some(json!({"brief": ""}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("brief"));

        let failing = test_app_with(MockGenerator::failing(), MockIndex::default(), MockRepo::configured());
        let response = send(&failing.router, "POST", "/api/spec-jobs", Some(json!({"brief": "x"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = send(&app.router, "GET", "/api/spec-jobs/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // 5. Hash collision
    #[tokio::test]
    async fn test_identical_spec_is_conflict() {
        let app = test_app();
        create_spec(&app).await;
        let response = send(&app.router, "POST", "/api/spec-jobs", Some(json!({"brief": "again"}))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    // 6. List and fetch specs
    #[tokio::test]
    async fn test_list_and_get_spec() {
        let app = test_app();
        let spec_id = create_spec(&app).await;

        let response = send(&app.router, "GET", "/api/specs", None).await;
        let specs: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0]["id"], spec_id.as_str());
        assert_eq!(specs[0]["state"], "creating");

        let response = send(&app.router, "GET", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let spec: Value = body_json(response.into_body()).await;
        assert_eq!(spec["title"], "Dodge Rush");
        assert_eq!(spec["spec_json"]["genre"], "arcade");
        assert_eq!(spec["state_logs"][0]["state_after"], "creating");
        assert!(spec.get("devin_session_url").is_none());

        let response = send(&app.router, "GET", "/api/specs/missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // 7. State transitions over HTTP
    #[tokio::test]
    async fn test_set_spec_state() {
        let app = test_app();
        let spec_id = create_spec(&app).await;
        let uri = format!("/api/specs/{}/state", spec_id);

        let response = send(&app.router, "PUT", &uri, Some(json!({"state": "code_generated"}))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&app.router, "PUT", &uri, Some(json!({"state": "bogus"}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app.router,
            "PUT",
            &uri,
            Some(json!({"state": "git_initing", "detail": "manual"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let record: Value = body_json(response.into_body()).await;
        assert_eq!(record["state_before"], "creating");
        assert_eq!(record["state_after"], "git_initing");

        let response = send(&app.router, "GET", &format!("/api/specs/{}/state-logs", spec_id), None).await;
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["state_logs"].as_array().unwrap().len(), 2);
    }

    // 8. Code job lifecycle
    #[tokio::test]
    async fn test_code_job_endpoints() {
        let app = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::default(),
            MockRepo::configured(),
        );
        let spec_id = app
            .state
            .db
            .call(|db| {
                db.insert_game_spec(&crate::factory::models::NewGameSpec {
                    id: "s1".into(),
                    title: "T".into(),
                    brief: "b".into(),
                    spec_markdown: String::new(),
                    spec_json: json!({}),
                    spec_hash: "h".into(),
                })
            })
            .await
            .unwrap()
            .unwrap()
            .id;

        let response = send(&app.router, "GET", &format!("/api/specs/{}/code-job", spec_id), None).await;
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body, json!({"status": "not_started"}));

        let response = send(&app.router, "POST", "/api/code-jobs", Some(json!({"game_spec_id": spec_id}))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "queued");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let response = send(&app.router, "GET", &format!("/api/code-jobs/{}", job_id), None).await;
        let job: Value = body_json(response.into_body()).await;
        assert_eq!(job["job_id"], job_id.as_str());
        assert_eq!(job["progress"], 0);

        let response = send(&app.router, "POST", &format!("/api/specs/{}/retry-code", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        app.state.code_jobs.run_job(&job_id).await;
        let response = send(&app.router, "POST", &format!("/api/specs/{}/retry-code", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let retry: Value = body_json(response.into_body()).await;
        assert_ne!(retry["job_id"], job_id.as_str());

        let response = send(&app.router, "GET", &format!("/api/specs/{}/code-job", spec_id), None).await;
        let latest: Value = body_json(response.into_body()).await;
        assert_eq!(latest["job_id"], retry["job_id"]);

        let response = send(&app.router, "POST", "/api/code-jobs", Some(json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app.router, "GET", "/api/code-jobs/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // 9. Manual coding agent task
    #[tokio::test]
    async fn test_create_devin_task() {
        let app = test_app();
        let spec_id = create_spec(&app).await;

        let response = send(&app.router, "POST", &format!("/api/specs/{}/devin-task", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["session_id"], format!("sess-{}", spec_id));
        assert_eq!(
            body["repository"],
            format!("https://github.com/acme/games/tree/main/{}", spec_id)
        );

        let response = send(&app.router, "GET", &format!("/api/specs/{}", spec_id), None).await;
        let spec: Value = body_json(response.into_body()).await;
        assert_eq!(
            spec["devin_session_url"],
            format!("https://app.devin.ai/sessions/sess-{}", spec_id)
        );
    }

    #[tokio::test]
    async fn test_devin_task_requires_git() {
        let app = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::default(),
            MockRepo::unconfigured(),
        );
        let spec_id = create_spec(&app).await;
        let response = send(&app.router, "POST", &format!("/api/specs/{}/devin-task", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // 10. Delete spec with cascaded cleanup
    #[tokio::test]
    async fn test_delete_spec() {
        let app = test_app();
        let spec_id = create_spec(&app).await;

        let response = send(&app.router, "DELETE", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["git_cleanup"], "success");
        assert_eq!(body["id"], spec_id.as_str());

        assert_eq!(*app.index.deletes.lock().unwrap(), vec![spec_id.clone()]);
        assert!(app.repo.calls().contains(&format!("remove:{}", spec_id)));

        let response = send(&app.router, "GET", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&app.router, "DELETE", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_spec_git_cleanup_variants() {
        let unconfigured = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::default(),
            MockRepo::unconfigured(),
        );
        let spec_id = create_spec(&unconfigured).await;
        let response = send(&unconfigured.router, "DELETE", &format!("/api/specs/{}", spec_id), None).await;
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["git_cleanup"], "skipped");

        let failing = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex::default(),
            MockRepo {
                fail_remove: true,
                ..MockRepo::configured()
            },
        );
        let spec_id = create_spec(&failing).await;
        let response = send(&failing.router, "DELETE", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["git_cleanup"], "failed");
        assert!(body["git_cleanup_warning"].is_string());
    }

    #[tokio::test]
    async fn test_delete_spec_rejected_while_code_job_runs() {
        let app = test_app();
        app.state
            .db
            .call(|db| {
                db.insert_game_spec(&crate::factory::models::NewGameSpec {
                    id: "s1".into(),
                    title: "T".into(),
                    brief: "b".into(),
                    spec_markdown: String::new(),
                    spec_json: json!({}),
                    spec_hash: "h".into(),
                })?;
                db.create_code_job("c1", "s1", &json!({}), None)?;
                db.claim_code_job("c1", &[])
            })
            .await
            .unwrap();

        let response = send(&app.router, "DELETE", "/api/specs/s1", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(app.index.deletes.lock().unwrap().is_empty());
        assert!(!app.repo.calls().contains(&"remove:s1".to_string()));

        let response = send(&app.router, "GET", "/api/specs/s1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&app.router, "GET", "/api/code-jobs/c1", None).await;
        let job: Value = body_json(response.into_body()).await;
        assert_eq!(job["status"], "processing");
    }

    #[tokio::test]
    async fn test_delete_spec_vector_failure_keeps_spec() {
        let app = test_app_with(
            MockGenerator::returning("Dodge Rush", sample_spec_json()),
            MockIndex {
                fail_delete: true,
                ..MockIndex::default()
            },
            MockRepo::configured(),
        );
        let spec_id = create_spec(&app).await;
        let response = send(&app.router, "DELETE", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = send(&app.router, "GET", &format!("/api/specs/{}", spec_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
