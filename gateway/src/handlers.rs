use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use common::{
    CancelTaskResponse, CreateTaskRequest, MonitorMetrics, Task, TaskOutputs, UploadResponse,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::GatewayError;

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/tasks/:id/input/:name", put(upload_input))
        .route("/api/v1/tasks/:id/output", get(get_outputs))
        .route("/api/v1/monitor", get(monitor_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

fn status_for(e: &GatewayError) -> StatusCode {
    match e {
        GatewayError::TaskNotFound(_)
        | GatewayError::ApplicationNotFound(_)
        | GatewayError::InfrastructureNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::BadParameter(_) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(io) if io.kind() == std::io::ErrorKind::InvalidInput => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::TaskTerminal(_) | GatewayError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        GatewayError::QueueFull { .. } | GatewayError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: GatewayError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!("error atendiendo request: {}", e);
    }
    (status, e.to_string())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_task(
    State(engine): State<Engine>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Task> {
    let task = engine.create_task(req).map_err(api_error)?;
    info!("POST /tasks -> {}", task.id);
    Ok(Json(task))
}

async fn get_task(State(engine): State<Engine>, Path(id): Path<String>) -> ApiResult<Task> {
    engine.task(&id).map(Json).map_err(api_error)
}

async fn cancel_task(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> ApiResult<CancelTaskResponse> {
    let task = engine.cancel(&id).map_err(api_error)?;
    Ok(Json(CancelTaskResponse {
        id: task.id,
        state: task.state,
    }))
}

async fn upload_input(
    State(engine): State<Engine>,
    Path((id, name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<UploadResponse> {
    let task = engine
        .upload_input(&id, &name, &mut body.as_ref())
        .map_err(api_error)?;
    info!("entrada {} de la tarea {} recibida ({} bytes)", name, id, body.len());
    Ok(Json(UploadResponse {
        id: task.id,
        file: name,
        state: task.state,
    }))
}

async fn get_outputs(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> ApiResult<TaskOutputs> {
    engine.outputs(&id).map(Json).map_err(api_error)
}

async fn monitor_metrics(State(engine): State<Engine>) -> Json<MonitorMetrics> {
    Json(engine.metrics())
}
