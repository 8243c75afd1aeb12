//! HTTP handlers for route management and streaming.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Serialize;
use tracing::{error, info};

use crate::frame::multipart::STREAM_CONTENT_TYPE;
use crate::route::{CreateRouteRequest, PublicRoute};

use super::error::{ApiError, ApiResult};
use super::session_id::SessionId;
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub routes: usize,
    pub active_streams: usize,
}

/// Acknowledgement for destructive operations.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<u64>,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let routes = state.registry.list_all().await?.len();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        routes,
        active_streams: state.relay.active_streams(),
    }))
}

/// Bind the fallback session to its upstream the first time it is used.
async fn ensure_fallback(state: &AppState, session_id: &str) -> ApiResult<()> {
    if state.session.is_fallback(session_id) {
        state
            .registry
            .ensure(session_id, &state.session.fallback_upstream_uri)
            .await?;
    }
    Ok(())
}

/// List every route as `[session_id, upstream_uri]` pairs.
pub async fn list_routes(State(state): State<AppState>) -> ApiResult<Json<Vec<(String, String)>>> {
    let routes = state.registry.list_all().await?;
    Ok(Json(routes.into_iter().map(|r| r.into_pair()).collect()))
}

/// Remove every route.
pub async fn clear_routes(State(state): State<AppState>) -> ApiResult<Json<MessageResponse>> {
    let removed = state.registry.clear().await?;
    Ok(Json(MessageResponse {
        message: "Routes cleared".to_string(),
        removed: Some(removed),
    }))
}

/// Feed descriptor for the caller's session.
pub async fn get_route(
    State(state): State<AppState>,
    session: SessionId,
) -> ApiResult<Json<PublicRoute>> {
    ensure_fallback(&state, &session.id).await?;
    let route = state.registry.lookup_public(&session.id).await?;
    Ok(Json(route))
}

/// Register the caller's session against the upstream named in the body.
pub async fn create_route(
    State(state): State<AppState>,
    session: SessionId,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<PublicRoute>)> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::bad_request("request body is required"));
    }

    let request: CreateRouteRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid_body(format!("expected {{\"uri\": \"...\"}}: {}", e)))?;

    let uri = request.uri.trim();
    if uri.is_empty() {
        return Err(ApiError::bad_request("uri is required"));
    }

    state.registry.register(&session.id, uri).await?;
    let route = state.registry.lookup_public(&session.id).await?;
    Ok((StatusCode::CREATED, Json(route)))
}

/// Remove the caller's route.
pub async fn delete_route(
    State(state): State<AppState>,
    session: SessionId,
) -> ApiResult<Json<MessageResponse>> {
    state.registry.delete(&session.id).await?;
    Ok(Json(MessageResponse {
        message: format!("Route for session '{}' removed", session.id),
        removed: None,
    }))
}

/// Stream JPEG frames for a session as `multipart/x-mixed-replace`.
pub async fn image_streaming_feed(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    ensure_fallback(&state, &session_id).await?;
    if !state.registry.contains(&session_id).await? {
        return Err(ApiError::not_found(format!(
            "no route for session '{}'",
            session_id
        )));
    }

    info!(session_id = %session_id, "Opening image stream");
    let parts = state.relay.open(&session_id);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(parts))
        .map_err(|e| {
            error!("Failed to build stream response: {:?}", e);
            ApiError::internal("failed to build stream response")
        })
}
