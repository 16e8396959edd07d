use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use ferrite_sandbox::{sandbox_health, ExecRequest, HostPathAdapter, SandboxError};
use ferrite_store::{SandboxExecRecord, StoreError};
use ferrite_types::{RunCreate, RunStatus};

use crate::skills::skill_to_api;
use crate::AppState;

pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn detail(status: StatusCode, message: &str) -> Self {
        Self::new(status, json!({"detail": message}))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => {
                ApiError::detail(StatusCode::NOT_FOUND, &format!("{what} not found"))
            }
            StoreError::Conflict(message) => ApiError::detail(StatusCode::BAD_REQUEST, &message),
            other => ApiError::detail(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);
    Router::new()
        .route("/health", get(health))
        .route("/conversations", post(create_conversation))
        .route("/conversations/{id}/runs", get(list_conversation_runs))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/internal/runs/{id}/emit-message", post(emit_run_message))
        .route("/skills", get(list_skills))
        .route("/skills/{id}/invoke", post(invoke_skill))
        .route("/sandbox/health", get(get_sandbox_health))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/memory/facts", get(list_facts).post(create_fact))
        .route("/agent/turn", post(agent_turn))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Debug, Deserialize)]
struct CreateConversationInput {
    title: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(input): Json<CreateConversationInput>,
) -> Result<Json<Value>, ApiError> {
    let conversation = state
        .store
        .create_conversation(input.title.as_deref())
        .await?;
    Ok(Json(json!({"conversation": conversation})))
}

/// Runs are created `queued` with the current effective settings embedded
/// as `settings_snapshot`, so later settings changes do not alter the
/// execution of already-queued work.
async fn create_run(
    State(state): State<AppState>,
    Json(mut input): Json<RunCreate>,
) -> Result<Json<Value>, ApiError> {
    if let Some(map) = input.input.as_object_mut() {
        if !map.contains_key("settings_snapshot") {
            map.insert("settings_snapshot".to_string(), state.settings.clone());
        }
    }
    let run = state.store.create_run(input).await?;
    Ok(Json(json!({"run": run})))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .store
        .get_run(&id)
        .await?
        .ok_or_else(|| ApiError::detail(StatusCode::NOT_FOUND, "Run not found"))?;
    Ok(Json(json!({"run": run})))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(RunStatus::parse(raw).ok_or_else(|| {
            ApiError::detail(StatusCode::BAD_REQUEST, &format!("Invalid status: {raw}"))
        })?),
    };
    let runs = state
        .store
        .list_runs(status, query.limit, query.offset)
        .await?;
    Ok(Json(json!({
        "items": runs,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

async fn list_conversation_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state
        .store
        .list_runs_by_conversation(&id, query.limit, query.offset)
        .await?;
    Ok(Json(json!({
        "items": runs,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct CancelRunInput {
    cancel_reason: Option<String>,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<CancelRunInput>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .store
        .cancel_run(&id, input.cancel_reason.as_deref())
        .await?;
    Ok(Json(json!({"run": run})))
}

async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_run(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::detail(StatusCode::NOT_FOUND, "Run not found"))
    }
}

/// Idempotent: turns one terminal run into at most one chat message.
/// Child runs are skipped so orchestrator sub-steps don't duplicate turns.
async fn emit_run_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let run = state
        .store
        .get_run(&id)
        .await?
        .ok_or_else(|| ApiError::detail(StatusCode::NOT_FOUND, "Run not found"))?;
    state.store.emit_run_message(&run).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_skills(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let skills = state.skills.list_skills();
    if skills.is_empty() && !state.skills.is_configured() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"detail": {
                "code": "SKILLS_NOT_CONFIGURED",
                "message": "Skills root not configured. Set SKILLS_ROOT or REPO_ROOT to a directory with skill manifests.",
            }}),
        ));
    }
    Ok(Json(Value::Array(skills.iter().map(skill_to_api).collect())))
}

fn sandbox_error_response(err: SandboxError) -> ApiError {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    ApiError::new(status, json!({"error_reason": err.to_reason()}))
}

async fn invoke_skill(
    State(state): State<AppState>,
    Path(skill_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !state.skills.is_configured() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"detail": {"code": "SKILLS_NOT_CONFIGURED", "message": "Skills root not configured."}}),
        ));
    }
    let manifest = state
        .skills
        .get_skill(&skill_id)
        .ok_or_else(|| ApiError::detail(StatusCode::NOT_FOUND, "Skill not found"))?;
    let project_id = body
        .get("project_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"detail": {"code": "INVALID_INPUT", "message": "project_id is required"}}),
            )
        })?;

    let (exec_kind, command, args) = match skill_id.as_str() {
        "shell.run" => {
            if manifest.entrypoint() != "bash" {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    json!({"detail": {"code": "INVALID_MANIFEST", "message": "shell.run runtime.entrypoint must be bash"}}),
                ));
            }
            let script = body
                .get("script")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        json!({"detail": {"code": "INVALID_INPUT", "message": "shell.run requires script"}}),
                    )
                })?;
            (
                "shell",
                "bash".to_string(),
                vec!["-lc".to_string(), script.to_string()],
            )
        }
        "python.run" => {
            if manifest.entrypoint() != "python" {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    json!({"detail": {"code": "INVALID_MANIFEST", "message": "python.run runtime.entrypoint must be python"}}),
                ));
            }
            let code = body.get("code").and_then(|v| v.as_str()).map(str::trim);
            let script_path = body
                .get("script_path")
                .and_then(|v| v.as_str())
                .map(str::trim);
            match (code.filter(|c| !c.is_empty()), script_path) {
                (Some(code), _) => (
                    "python",
                    "python".to_string(),
                    vec!["-c".to_string(), code.to_string()],
                ),
                (None, Some(path)) if !path.is_empty() => {
                    let normalized = path.replace('\\', "/");
                    let trimmed = normalized.trim_start_matches('/');
                    if trimmed.is_empty() || trimmed.split('/').any(|part| part == "..") {
                        return Err(ApiError::new(
                            StatusCode::BAD_REQUEST,
                            json!({"detail": {"code": "INVALID_INPUT", "message": "script_path must not traverse or be absolute"}}),
                        ));
                    }
                    (
                        "python",
                        "python".to_string(),
                        vec![format!("/workspace/inputs/{trimmed}")],
                    )
                }
                _ => {
                    return Err(ApiError::new(
                        StatusCode::BAD_REQUEST,
                        json!({"detail": {"code": "INVALID_INPUT", "message": "python.run requires code or script_path"}}),
                    ));
                }
            }
        }
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                json!({"detail": {"code": "UNSUPPORTED_SKILL", "message": format!("skill {skill_id} has no exec mapping")}}),
            ));
        }
    };

    let mut policy_overrides = serde_json::Map::new();
    if let Some(timeout_ms) = body.get("timeout_ms").and_then(|v| v.as_u64()) {
        policy_overrides.insert("timeout_ms".to_string(), json!(timeout_ms));
    }
    let request = ExecRequest {
        project_id: project_id.to_string(),
        skill_id: Some(skill_id.clone()),
        exec_kind: exec_kind.to_string(),
        command,
        args,
        cwd: "work".to_string(),
        env: None,
        inputs: Vec::new(),
        manifest_limits: Some(manifest.limits.clone()),
        policy_overrides: if policy_overrides.is_empty() {
            None
        } else {
            Some(Value::Object(policy_overrides))
        },
        task_id: body
            .get("task_id")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        conversation_id: body
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
    };

    let response = state
        .sandbox
        .exec(request)
        .await
        .map_err(sandbox_error_response)?;

    let mut out = serde_json::to_value(&response).unwrap_or(Value::Null);
    // Previews of the captured streams, for chat replies and observations
    let adapter = HostPathAdapter::from_settings(&state.settings);
    if let Ok(artifacts_native) = adapter.host_path_native(&[response.artifacts_dir.as_str()]) {
        for (key, file) in [
            ("stdout_preview", &response.stdout_path),
            ("stderr_preview", &response.stderr_path),
        ] {
            if let Ok(content) = tokio::fs::read_to_string(artifacts_native.join(file)).await {
                let preview: String = content.chars().take(2000).collect();
                out[key] = json!(preview);
            }
        }
    }

    let record = SandboxExecRecord {
        exec_id: response.exec_id.clone(),
        project_id: project_id.to_string(),
        skill_id: Some(skill_id),
        conversation_id: body
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        status: serde_json::to_value(response.status)
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_else(|| "FAILED".to_string()),
        exit_code: response.exit_code.map(i64::from),
        policy_snapshot: state
            .settings
            .pointer("/sandbox/policy")
            .cloned()
            .unwrap_or(Value::Null),
        artifacts_path: response.artifacts_dir.clone(),
        stdout_truncated: response.stdout_truncated,
        stderr_truncated: response.stderr_truncated,
        duration_ms: None,
        created_at: chrono::Utc::now(),
    };
    if let Err(err) = state.store.record_sandbox_exec(&record).await {
        tracing::warn!(error = %err, "failed to record sandbox exec");
    }

    Ok(Json(out))
}

async fn get_sandbox_health(State(state): State<AppState>) -> Json<Value> {
    Json(sandbox_health(&state.settings))
}

#[derive(Debug, Deserialize)]
struct ListFactsQuery {
    scope: Option<String>,
    status: Option<String>,
    session_id: Option<String>,
}

async fn list_facts(
    State(state): State<AppState>,
    Query(query): Query<ListFactsQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(facts) = state.facts.as_ref() else {
        return Err(ApiError::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "memory store not configured",
        ));
    };
    let listed = facts
        .list_facts(
            query.scope.as_deref().unwrap_or("global"),
            query.status.as_deref().unwrap_or("active"),
            query.session_id.as_deref(),
        )
        .await
        .map_err(|err| ApiError::detail(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))?;
    Ok(Json(serde_json::to_value(listed).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct CreateFactInput {
    key: String,
    value: Value,
    #[serde(default = "default_scope")]
    scope: String,
    session_id: Option<String>,
}

fn default_scope() -> String {
    "global".to_string()
}

async fn create_fact(
    State(state): State<AppState>,
    Json(input): Json<CreateFactInput>,
) -> Result<Json<Value>, ApiError> {
    let Some(facts) = state.facts.as_ref() else {
        return Err(ApiError::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "memory store not configured",
        ));
    };
    if input.key.trim().is_empty() {
        return Err(ApiError::detail(StatusCode::BAD_REQUEST, "key is required"));
    }
    let fact = facts
        .insert_fact(
            input.key.trim(),
            &input.value,
            &input.scope,
            input.session_id.as_deref(),
        )
        .await
        .map_err(|err| ApiError::detail(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))?;
    Ok(Json(serde_json::to_value(fact).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct AgentTurnInput {
    conversation_id: String,
    user_message: String,
}

/// One orchestrated user turn over the direct async loop (cross-process
/// callers use this; the worker drives the same loop in-process).
async fn agent_turn(
    State(state): State<AppState>,
    Json(input): Json<AgentTurnInput>,
) -> Result<Json<Value>, ApiError> {
    let enabled = state
        .settings
        .pointer("/agent_loop/enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if !enabled {
        return Err(ApiError::detail(
            StatusCode::BAD_REQUEST,
            "agent loop is disabled by settings",
        ));
    }
    if !state.store.conversation_exists(&input.conversation_id).await? {
        return Err(ApiError::detail(StatusCode::NOT_FOUND, "Conversation not found"));
    }
    state
        .store
        .append_message(&input.conversation_id, "user", &input.user_message, None)
        .await?;
    let history: Vec<ferrite_providers::ChatMessage> = state
        .store
        .list_recent_messages(&input.conversation_id, 20)
        .await?
        .iter()
        .map(|m| ferrite_providers::ChatMessage::new(&m.role, m.content.clone()))
        .collect();
    let recent_runs: Vec<Value> = state
        .store
        .list_runs_by_conversation(&input.conversation_id, Some(5), None)
        .await?
        .iter()
        .map(|r| json!({"id": r.id, "type": r.run_type, "status": r.status}))
        .collect();
    let allowed: Vec<String> = state
        .settings
        .pointer("/agent_loop/allowed_run_types")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_else(|| vec!["run_code_snippet".to_string()]);
    let timeout = state
        .settings
        .pointer("/agent_loop/decision_timeout_seconds")
        .and_then(|v| v.as_u64())
        .unwrap_or(30);
    let system_cap = state
        .settings
        .pointer("/agent_loop/max_steps")
        .and_then(|v| v.as_u64())
        .unwrap_or(3) as usize;

    let decider = ferrite_orchestrator::LlmDecider::new(
        state.llm.clone(),
        allowed,
        std::time::Duration::from_secs(timeout),
    );
    let (reply, run_ids) = ferrite_orchestrator::run_code_snippet_loop(
        &state.store,
        &decider,
        &input.conversation_id,
        &input.user_message,
        &history,
        &recent_runs,
        None,
        None,
        system_cap,
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(60),
    )
    .await
    .map_err(|err| ApiError::detail(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))?;

    let reply = reply.unwrap_or_else(|| "任务已完成".to_string());
    state
        .store
        .append_message(&input.conversation_id, "assistant", &reply, None)
        .await?;
    Ok(Json(json!({"reply": reply, "run_ids": run_ids})))
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let effective = state.store.effective_settings().await?;
    Ok(Json(effective))
}

/// Writes only the DB layer; defaults and env always re-merge on read.
async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !body.is_object() {
        return Err(ApiError::detail(
            StatusCode::BAD_REQUEST,
            "settings body must be an object",
        ));
    }
    state.store.put_settings(&body).await?;
    let effective = state.store.effective_settings().await?;
    Ok(Json(effective))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SkillService;
    use axum::body::Body;
    use axum::http::Request;
    use ferrite_sandbox::SandboxRunner;
    use ferrite_store::Store;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let store = Store::open_in_memory().await.unwrap();
        let settings = store.effective_settings().await.unwrap();
        let facts = ferrite_memory::FactsStore::open_in_memory().await.unwrap();
        AppState {
            store,
            facts: Some(Arc::new(facts)),
            skills: Arc::new(SkillService::new(None)),
            sandbox: Arc::new(SandboxRunner::new(settings.clone())),
            llm: Arc::new(ferrite_providers::StubLlm),
            settings,
        }
    }

    async fn request_json(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn create_cancel_observe_sleep_run() {
        let state = test_state().await;
        let router = build_router(state);

        let (status, created) = request_json(
            &router,
            "POST",
            "/runs",
            Some(json!({"type": "sleep", "input": {"seconds": 60}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["run"]["status"], "queued");
        assert_eq!(created["run"]["attempt"], 0);
        // settings snapshot embedded at creation
        assert!(created["run"]["input"]["settings_snapshot"].is_object());
        let id = created["run"]["id"].as_str().unwrap().to_string();

        let (status, canceled) =
            request_json(&router, "POST", &format!("/runs/{id}/cancel"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["run"]["status"], "canceled");
        assert_eq!(canceled["run"]["canceled_by"], "user");

        let (status, fetched) = request_json(&router, "GET", &format!("/runs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["run"]["status"], "canceled");
        assert_eq!(fetched["run"]["attempt"], 0);
        assert!(fetched["run"]["output"].is_null());

        // second cancel: terminal, so 400
        let (status, _) =
            request_json(&router, "POST", &format!("/runs/{id}/cancel"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_lookup_and_listing_errors() {
        let state = test_state().await;
        let router = build_router(state);

        let (status, _) = request_json(&router, "GET", "/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = request_json(&router, "GET", "/runs?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = request_json(&router, "GET", "/runs?status=queued", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["items"].as_array().unwrap().is_empty());

        let (status, _) = request_json(&router, "DELETE", "/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_run_validates_conversation_and_parent() {
        let state = test_state().await;
        let router = build_router(state);

        let (status, _) = request_json(
            &router,
            "POST",
            "/runs",
            Some(json!({"type": "sleep", "input": {}, "conversation_id": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = request_json(
            &router,
            "POST",
            "/runs",
            Some(json!({"type": "sleep", "input": {}, "parent_run_id": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, conv) =
            request_json(&router, "POST", "/conversations", Some(json!({"title": "t"}))).await;
        let conv_id = conv["conversation"]["id"].as_str().unwrap().to_string();
        let (status, created) = request_json(
            &router,
            "POST",
            "/runs",
            Some(json!({"type": "sleep", "input": {}, "conversation_id": conv_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["run"]["conversation_id"], conv_id.as_str());
    }

    #[tokio::test]
    async fn listing_sorts_by_updated_desc() {
        let state = test_state().await;
        let router = build_router(state.clone());
        let mut ids = Vec::new();
        for i in 0..3 {
            let (_, created) = request_json(
                &router,
                "POST",
                "/runs",
                Some(json!({"type": "sleep", "input": {"n": i}})),
            )
            .await;
            ids.push(created["run"]["id"].as_str().unwrap().to_string());
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let (_, body) = request_json(&router, "GET", "/runs?limit=2", None).await;
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], ids[2].as_str());
        assert_eq!(items[1]["id"], ids[1].as_str());
    }

    #[tokio::test]
    async fn emit_message_requires_terminal_state() {
        let state = test_state().await;
        let router = build_router(state.clone());
        let (_, conv) = request_json(&router, "POST", "/conversations", Some(json!({}))).await;
        let conv_id = conv["conversation"]["id"].as_str().unwrap().to_string();
        let (_, created) = request_json(
            &router,
            "POST",
            "/runs",
            Some(json!({"type": "sleep", "input": {}, "conversation_id": conv_id})),
        )
        .await;
        let id = created["run"]["id"].as_str().unwrap().to_string();

        let (status, _) = request_json(
            &router,
            "POST",
            &format!("/internal/runs/{id}/emit-message"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // drive to terminal then emit twice; both 204
        state.store.claim_next("w", 60).await.unwrap();
        state
            .store
            .complete_success(&id, &json!({"ok": true, "result": {"reply": "done"}}))
            .await
            .unwrap();
        for _ in 0..2 {
            let (status, _) = request_json(
                &router,
                "POST",
                &format!("/internal/runs/{id}/emit-message"),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let messages = state.store.list_recent_messages(&conv_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);

        let (status, _) =
            request_json(&router, "POST", "/internal/runs/ghost/emit-message", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn skills_api_503_when_unconfigured() {
        let state = test_state().await;
        let router = build_router(state);
        let (status, body) = request_json(&router, "GET", "/skills", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"]["code"], "SKILLS_NOT_CONFIGURED");

        let (status, _) = request_json(
            &router,
            "POST",
            "/skills/shell.run/invoke",
            Some(json!({"project_id": "p1", "script": "echo 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    fn write_manifest(root: &std::path::Path, id: &str, entrypoint: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            json!({
                "id": id,
                "name": id,
                "runtime": {"kind": "docker", "entrypoint": entrypoint},
                "permissions": {"net": {"mode": "none"}},
                "limits": {"timeout_ms": 30000},
            })
            .to_string(),
        )
        .unwrap();
    }

    async fn state_with_skills() -> (AppState, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "shell.run", "bash");
        write_manifest(tmp.path(), "python.run", "python");
        let store = Store::open_in_memory().await.unwrap();
        let settings = store.effective_settings().await.unwrap();
        let state = AppState {
            store,
            facts: None,
            skills: Arc::new(SkillService::new(Some(tmp.path().to_path_buf()))),
            sandbox: Arc::new(SandboxRunner::new(settings.clone())),
            llm: Arc::new(ferrite_providers::StubLlm),
            settings,
        };
        (state, tmp)
    }

    #[tokio::test]
    async fn skills_listing_and_invoke_validation() {
        let (state, _tmp) = state_with_skills().await;
        let router = build_router(state);

        let (status, body) = request_json(&router, "GET", "/skills", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["python.run", "shell.run"]);

        // unknown skill
        let (status, _) = request_json(
            &router,
            "POST",
            "/skills/node.run/invoke",
            Some(json!({"project_id": "p1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // missing project_id
        let (status, body) = request_json(
            &router,
            "POST",
            "/skills/shell.run/invoke",
            Some(json!({"script": "echo 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"]["code"], "INVALID_INPUT");

        // missing script
        let (status, _) = request_json(
            &router,
            "POST",
            "/skills/shell.run/invoke",
            Some(json!({"project_id": "p1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // python script_path traversal
        let (status, body) = request_json(
            &router,
            "POST",
            "/skills/python.run/invoke",
            Some(json!({"project_id": "p1", "script_path": "../escape.py"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn sandbox_health_reports_shape() {
        let state = test_state().await;
        let router = build_router(state);
        let (status, body) = request_json(&router, "GET", "/sandbox/health", None).await;
        assert_eq!(status, StatusCode::OK);
        for key in ["runtime_mode", "docker_cli_path", "platform", "writable_check"] {
            assert!(body.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn memory_facts_round_trip_and_snapshot_consistency() {
        let state = test_state().await;
        let router = build_router(state);
        let (status, _) = request_json(
            &router,
            "POST",
            "/memory/facts",
            Some(json!({"key": "likes", "value": "cats"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = request_json(
            &router,
            "POST",
            "/memory/facts",
            Some(json!({"key": "language", "value": "zh-CN", "scope": "session", "session_id": "c1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, listed) =
            request_json(&router, "GET", "/memory/facts?scope=global&status=active", None).await;
        assert_eq!(status, StatusCode::OK);
        let facts: Vec<ferrite_types::Fact> = serde_json::from_value(listed).unwrap();
        assert_eq!(facts.len(), 1);
        // snapshot id over the HTTP-shaped facts matches the store-side
        // computation for the same set
        let id = ferrite_memory::compute_facts_snapshot_id(&facts);
        assert_eq!(id.len(), 64);

        let (status, _) = request_json(
            &router,
            "POST",
            "/memory/facts",
            Some(json!({"key": " ", "value": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_turn_replies_for_reply_only_decisions() {
        let state = test_state().await;
        let router = build_router(state.clone());
        let (_, conv) = request_json(&router, "POST", "/conversations", Some(json!({}))).await;
        let conv_id = conv["conversation"]["id"].as_str().unwrap().to_string();

        let (status, body) = request_json(
            &router,
            "POST",
            "/agent/turn",
            Some(json!({"conversation_id": conv_id, "user_message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["reply"].as_str().is_some());
        assert!(body["run_ids"].as_array().unwrap().is_empty());
        // both turns landed in the conversation
        let messages = state.store.list_recent_messages(&conv_id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");

        let (status, _) = request_json(
            &router,
            "POST",
            "/agent/turn",
            Some(json!({"conversation_id": "ghost", "user_message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_merge_layers_via_api() {
        let state = test_state().await;
        let router = build_router(state);
        let (status, effective) = request_json(&router, "GET", "/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(effective["web"]["search"]["backend"], "stub");

        let (status, updated) = request_json(
            &router,
            "PUT",
            "/settings",
            Some(json!({"web": {"search": {"backend": "ddg_html"}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["web"]["search"]["backend"], "ddg_html");
        // defaults still present after merge
        assert_eq!(updated["web"]["fetch"]["timeout_ms"], 15000);

        let (status, _) =
            request_json(&router, "PUT", "/settings", Some(json!("not an object"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
