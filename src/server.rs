//! Thin HTTP/WebSocket surface over the control plane.
//!
//! Routers here hold no logic: every handler delegates to [`BuildService`]
//! or subscribes a WebSocket sink to the broadcaster. Auth sits in front of
//! this router in deployment; it is not this crate's concern.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::control::{BuildService, ResumeRequest, StartBuildRequest};
use crate::errors::BuildError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BuildService>,
}

pub fn router(service: Arc<BuildService>) -> Router {
    Router::new()
        .route("/api/builds", post(start_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/cancel", post(cancel_build))
        .route("/api/builds/{id}/resume", post(resume_build))
        .route("/api/builds/{id}/interject", post(interject))
        .route("/api/builds/{id}/logs", get(get_logs))
        .route("/api/builds/{id}/summary", get(get_summary))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(AppState { service })
}

/// Structured error body: kind + message, no internal detail.
struct ApiError(BuildError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BuildError::NotFound(_) => StatusCode::NOT_FOUND,
            BuildError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BuildError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "kind": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        Self(err)
    }
}

async fn start_build(
    State(state): State<AppState>,
    Json(req): Json<StartBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let build_id = state.service.start_build(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "build_id": build_id }))))
}

#[derive(Deserialize)]
struct CancelQuery {
    #[serde(default)]
    force: bool,
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.cancel_build(&id, query.force).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn resume_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.resume_build(&id, req).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct InterjectBody {
    message: String,
}

async fn interject(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<InterjectBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.interject(&id, body.message).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state.service.status(&id)?;
    Ok(Json(build))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    after_ts: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_log_limit")]
    limit: u32,
}

fn default_log_limit() -> u32 {
    500
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.service.logs(&id, query.after_ts, query.limit)?;
    Ok(Json(logs))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.service.summary(&id)?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct WsQuery {
    user_id: i64,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(socket, state, query.user_id))
}

/// Pump broadcaster events into the socket until either side closes. The
/// broadcaster owns heartbeats and eviction; this task just forwards.
async fn observe(mut socket: WebSocket, state: AppState, user_id: i64) {
    let broadcaster = state.service.runtime().broadcaster.clone();
    let (sink_id, mut rx) = broadcaster.subscribe(user_id).await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    // Evicted or broadcaster gone.
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Clients only listen; ignore anything they send.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    broadcaster.unsubscribe(user_id, sink_id).await;
    let _ = socket.send(Message::Close(None)).await;
}
