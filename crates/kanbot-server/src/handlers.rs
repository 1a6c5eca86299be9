//! HTTP handlers for the task board and its admin endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use kanbot_core::{NewTask, TaskId, TaskStatus};
use kanbot_engine::{EngineError, Reconciler, SpawnOrchestrator};
use kanbot_store::{ActivityAction, ActivityRepo, CommentRepo, Database, StoreError, TaskRepo};
use kanbot_telemetry::{LogQuery, TelemetryGuard};

/// Shared state available to all handlers.
pub struct HandlerState {
    pub db: Database,
    pub tasks: TaskRepo,
    pub comments: CommentRepo,
    pub activity: ActivityRepo,
    pub orchestrator: Arc<SpawnOrchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        orchestrator: Arc<SpawnOrchestrator>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            tasks: TaskRepo::new(db.clone()),
            comments: CommentRepo::new(db.clone()),
            activity: ActivityRepo::new(db.clone()),
            db,
            orchestrator,
            reconciler,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

type AppState = State<Arc<HandlerState>>;

/// Error body: `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            other => {
                error!(error = %other, "store error");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = json!({ "error": { "code": code, "message": message } });
        (status, Json(body)).into_response()
    }
}

// ── Health ──

/// 503 only when the store is down; an unreachable gateway is `degraded`.
pub async fn health(State(state): AppState) -> impl IntoResponse {
    let db_ok = state.db.ping();
    let gateway = state.orchestrator.gateway();
    let gateway_ok = gateway.health_check().await;

    let status = match (db_ok, gateway_ok) {
        (true, true) => "healthy",
        (true, false) => "degraded",
        (false, _) => "unhealthy",
    };
    let http_status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": status,
            "components": {
                "database": if db_ok { "ok" } else { "error" },
                "gateway": if gateway_ok { "ok" } else { "unreachable" },
                "gatewayName": gateway.name(),
            },
        })),
    )
}

// ── Tasks ──

pub async fn create_task(
    State(state): AppState,
    Json(body): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.insert(&body)?;
    state
        .activity
        .record(task.id, ActivityAction::Created, None, None)?;
    info!(task_id = task.id.get(), assignee = %task.assignee, "task created");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksParams {
    pub status: Option<TaskStatus>,
}

pub async fn list_tasks(
    State(state): AppState,
    Query(params): Query<ListTasksParams>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.tasks.list(params.status.as_ref())?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): AppState,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tasks.get(TaskId::new(id))?))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: TaskStatus,
}

/// Store the new status, then let the orchestrator react. The response
/// carries the task as it stands after the reaction.
pub async fn update_status(
    State(state): AppState,
    Path(id): Path<i64>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = TaskId::new(id);
    let old = state.tasks.set_status(id, &body.status)?;
    if old != body.status {
        state.activity.record(
            id,
            ActivityAction::StatusChanged,
            None,
            Some(json!({ "from": old, "to": body.status })),
        )?;
    }

    let outcome = state
        .orchestrator
        .on_status_changed(id, &old, &body.status)
        .await?;
    let task = state.tasks.get(id)?;
    Ok(Json(json!({ "task": task, "outcome": outcome })))
}

// ── Comments ──

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    pub author: String,
    pub content: String,
}

pub async fn add_comment(
    State(state): AppState,
    Path(id): Path<i64>,
    Json(body): Json<CommentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = TaskId::new(id);
    let comment = state.comments.add(id, &body.author, &body.content)?;
    state.activity.record(
        id,
        ActivityAction::Commented,
        None,
        Some(json!({ "commentId": comment.id, "author": comment.author })),
    )?;

    let outcome = state
        .orchestrator
        .on_comment_created(id, &comment.content)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "comment": comment, "outcome": outcome })),
    ))
}

pub async fn list_comments(
    State(state): AppState,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let id = TaskId::new(id);
    state.tasks.get(id)?;
    Ok(Json(state.comments.list(id)?))
}

pub async fn list_activity(
    State(state): AppState,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let id = TaskId::new(id);
    state.tasks.get(id)?;
    Ok(Json(state.activity.list(id)?))
}

// ── Admin ──

pub async fn reconcile(State(state): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reconciler.run()?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsParams {
    pub level: Option<String>,
    pub target: Option<String>,
    pub task_id: Option<i64>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Persisted warn+ logs, newest first. Empty when the SQLite sink is off.
pub async fn logs(
    State(state): AppState,
    Query(params): Query<LogsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return Ok(Json(json!({ "logs": [], "totalCount": 0, "enabled": false })));
    };

    let query = LogQuery {
        level: params.level,
        target: params.target,
        task_id: params.task_id,
        since: params.since,
        limit: params.limit,
    };
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    let total: Value = sink.count().map(Value::from).unwrap_or(Value::Null);

    Ok(Json(json!({
        "logs": records,
        "totalCount": total,
        "enabled": true,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound("task 9".into()).into();
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
        assert_eq!(message, "task 9 not found");
    }

    #[test]
    fn other_store_errors_map_to_500() {
        let err: ApiError = StoreError::CorruptRow {
            table: "tasks",
            column: "spawn_state",
            detail: "unknown spawn state: running".into(),
        }
        .into();
        assert_eq!(err.parts().0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_body_accepts_board_labels() {
        let body: StatusBody = serde_json::from_str(r#"{"status":"In Progress"}"#).unwrap();
        assert_eq!(body.status, TaskStatus::InProgress);
    }
}
