use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{ErrorKind, HubError};
use crate::scheduler::{Scheduler, TargetSpec};
use crate::series::{Metrics, Window};
use crate::tasks::queue::TaskFilter;
use crate::tasks::{TaskOptions, TaskState};

const GROUP_TOKEN_HEADER: &str = "x-group-token";

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
struct Message {
    msg: String,
}

#[derive(Serialize)]
struct RegisteredResponse {
    id: Uuid,
}

#[derive(Serialize)]
struct TargetRegisteredResponse {
    id: Uuid,
    tasks_created: usize,
}

#[derive(Deserialize)]
struct RegisterMachineRequest {
    name: String,
}

#[derive(Deserialize)]
struct RegisterTargetRequest {
    #[serde(flatten)]
    spec: TargetSpec,
    #[serde(default)]
    oneshot: bool,
    #[serde(default = "default_threads")]
    threads: u8,
    #[serde(default)]
    probe_ipv6: bool,
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    machine_id: Uuid,
    target_id: Uuid,
    #[serde(default)]
    oneshot: bool,
    #[serde(default)]
    ipv6: bool,
    #[serde(default = "default_threads")]
    threads: u8,
}

fn default_threads() -> u8 {
    1
}

#[derive(Deserialize)]
struct ListTasksQuery {
    machine_id: Option<Uuid>,
    target_id: Option<Uuid>,
    state: Option<String>,
}

#[derive(Deserialize)]
struct SeriesQuery {
    window: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/machines", post(register_machine_handler))
        .route("/api/machines", get(list_machines_handler))
        .route("/api/machines/:id/heartbeat", post(heartbeat_handler))
        .route("/api/targets", post(register_target_handler))
        .route("/api/targets", get(list_targets_handler))
        .route("/api/targets/:id", get(get_target_handler))
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks/:id/result", post(submit_result_handler))
        .route("/api/tasks/:id/stop", post(stop_task_handler))
        .route("/api/tasks/:id/series", get(fetch_series_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the JSON API until the shutdown token fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

fn error_response(err: HubError) -> (StatusCode, Json<Message>) {
    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InvalidValue => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(Message { msg: err.to_string() }))
}

fn group_token(headers: &HeaderMap) -> Result<String, (StatusCode, Json<Message>)> {
    headers
        .get(GROUP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(Message {
                    msg: "Missing group token".to_string(),
                }),
            )
        })
}

/// Source address: first X-Forwarded-For entry when present, else the
/// socket peer.
fn source_addr(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

async fn register_machine_handler(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<RegisterMachineRequest>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let addr = source_addr(&headers, peer);
    match state
        .scheduler
        .register_machine(&group, &payload.name, addr, Utc::now())
        .await
    {
        Ok(id) => (StatusCode::CREATED, Json(RegisteredResponse { id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler.heartbeat(id, Utc::now()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(Message {
                msg: "ok".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_machines_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let machines = state.scheduler.list_machines(&group, Utc::now()).await;
    Json(machines).into_response()
}

async fn register_target_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterTargetRequest>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let options = TaskOptions {
        oneshot: payload.oneshot,
        ipv6: payload.probe_ipv6,
        threads: payload.threads,
    };
    match state
        .scheduler
        .register_target(&group, payload.spec, options, Utc::now())
        .await
    {
        Ok((id, tasks_created)) => (
            StatusCode::CREATED,
            Json(TargetRegisteredResponse { id, tasks_created }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_targets_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let targets = state.scheduler.list_targets(&group).await;
    Json(targets).into_response()
}

async fn get_target_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    match state.scheduler.get_target(id, &group).await {
        Ok(target) => Json(target).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn submit_task_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let options = TaskOptions {
        oneshot: payload.oneshot,
        ipv6: payload.ipv6,
        threads: payload.threads,
    };
    match state
        .scheduler
        .submit_single(
            &group,
            payload.machine_id,
            payload.target_id,
            options,
            Utc::now(),
        )
        .await
    {
        Ok(id) => (StatusCode::CREATED, Json(RegisteredResponse { id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn submit_result_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(metrics): Json<Metrics>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    match state
        .scheduler
        .submit_result(id, &group, metrics, Utc::now())
        .await
    {
        Ok(next_state) => (
            StatusCode::OK,
            Json(Message {
                msg: next_state.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_task_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    match state.scheduler.stop_task(id, &group, Utc::now()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(Message {
                msg: "ok".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_tasks_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let state_filter = match query.state.as_deref().map(str::parse::<TaskState>) {
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return error_response(e).into_response(),
        None => None,
    };
    let filter = TaskFilter {
        machine_id: query.machine_id,
        target_id: query.target_id,
        state: state_filter,
    };
    let tasks = state.scheduler.list_tasks(&group, filter).await;
    Json(tasks).into_response()
}

async fn fetch_series_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<SeriesQuery>,
) -> impl IntoResponse {
    let group = match group_token(&headers) {
        Ok(group) => group,
        Err(e) => return e.into_response(),
    };
    let window: Window = match query.window.parse() {
        Ok(window) => window,
        Err(e) => return error_response(e).into_response(),
    };
    match state
        .scheduler
        .fetch_series(id, &group, window, Utc::now())
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
