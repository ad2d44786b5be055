//! REST endpoints
//!
//! | Method | Path                         | Result                      |
//! |--------|------------------------------|-----------------------------|
//! | POST   | /crawls                      | 202 + job summary           |
//! | POST   | /tasks/{type}                | 201 + `{taskId}`            |
//! | GET    | /tasks                       | 200 + rows                  |
//! | GET    | /tasks/{id}                  | 200 + row, 404 otherwise    |
//! | DELETE | /tasks/{id}                  | 204                         |
//! | POST   | /tasks/{id}/pause,resume,stop| 202 + row                   |
//! | GET    | /tasks/{id}/problems, ...    | 200 + telemetry rows        |
//! | POST   | /place-hubs/guess            | 200 + report                |
//! | GET    | /status                      | 200 + counts                |
//! | GET    | /events                      | SSE stream                  |

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::domain::CrawlOptions;
use crate::facade::{self, Deps, FacadeError, TaskListOptions};
use crate::tasks::PlaceHubGuessOptions;

use super::sse;

/// Domain error mapped onto an HTTP response
pub struct ApiError(FacadeError);

impl From<FacadeError> for ApiError {
    fn from(e: FacadeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FacadeError::InvalidCrawlOptions(_) | FacadeError::UnknownTaskType(_) => StatusCode::BAD_REQUEST,
            FacadeError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            FacadeError::CrawlAlreadyRunning { .. }
            | FacadeError::DomainNotReady(_)
            | FacadeError::Precondition(_) => StatusCode::CONFLICT,
            FacadeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FacadeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(serde::Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    200
}

pub fn router(deps: Deps) -> Router {
    Router::new()
        .route("/crawls", post(start_crawl))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{key}", post(create_task).get(get_task).delete(delete_task))
        .route("/tasks/{key}/pause", post(pause_task))
        .route("/tasks/{key}/resume", post(resume_task))
        .route("/tasks/{key}/stop", post(stop_task))
        .route("/tasks/{key}/problems", get(task_problems))
        .route("/tasks/{key}/milestones", get(task_milestones))
        .route("/tasks/{key}/queue-events", get(task_queue_events))
        .route("/tasks/{key}/planner-stages", get(task_planner_stages))
        .route("/place-hubs/guess", post(guess_place_hubs))
        .route("/status", get(daemon_status))
        .route("/events", get(sse::events))
        .with_state(deps)
}

async fn start_crawl(
    State(deps): State<Deps>,
    Json(options): Json<CrawlOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let started = facade::start_crawl(options, &deps).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn create_task(
    State(deps): State<Deps>,
    Path(task_type): Path<String>,
    Json(config): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let row = facade::start_background_task(&task_type, config, &deps).await?;
    Ok((StatusCode::CREATED, Json(json!({ "taskId": row.id }))))
}

async fn list_tasks(
    State(deps): State<Deps>,
    Query(options): Query<TaskListOptions>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::list_tasks(options, &deps).await?))
}

async fn get_task(State(deps): State<Deps>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::get_task(&id, &deps).await?))
}

async fn delete_task(State(deps): State<Deps>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    facade::delete_task(&id, &deps).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_task(State(deps): State<Deps>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let row = facade::pause_task(&id, &deps).await?;
    Ok((StatusCode::ACCEPTED, Json(row)))
}

async fn resume_task(State(deps): State<Deps>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let row = facade::resume_task(&id, &deps).await?;
    Ok((StatusCode::ACCEPTED, Json(row)))
}

async fn stop_task(State(deps): State<Deps>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let row = facade::cancel_task(&id, &deps).await?;
    Ok((StatusCode::ACCEPTED, Json(row)))
}

async fn task_problems(
    State(deps): State<Deps>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::task_problems(&id, query.limit, &deps).await?))
}

async fn task_milestones(
    State(deps): State<Deps>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::task_milestones(&id, query.limit, &deps).await?))
}

async fn task_queue_events(
    State(deps): State<Deps>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::task_queue_events(&id, query.limit, &deps).await?))
}

async fn task_planner_stages(
    State(deps): State<Deps>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::task_planner_stages(&id, query.limit, &deps).await?))
}

async fn guess_place_hubs(
    State(deps): State<Deps>,
    Json(options): Json<PlaceHubGuessOptions>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::guess_place_hubs(options, &deps).await?))
}

async fn daemon_status(State(deps): State<Deps>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(facade::daemon_status(&deps).await?))
}
