//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;

use super::handlers;
use super::state::AppState;

/// Create the application router.
///
/// Route endpoints live under `/{application_name}/{api_version}`; `/health`
/// sits at the root.
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let cors = build_cors_layer(server);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api = Router::new()
        .route(
            "/routes",
            get(handlers::list_routes).delete(handlers::clear_routes),
        )
        .route(
            "/route",
            post(handlers::create_route)
                .get(handlers::get_route)
                .delete(handlers::delete_route),
        )
        .route(
            "/image_streaming_feed/{session_id}",
            get(handlers::image_streaming_feed),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest(&server.base_path(), api)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

fn build_cors_layer(server: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
    ];

    if server.cors_origins.is_empty() {
        if server.debug {
            tracing::warn!("CORS: No origins configured in debug mode, allowing any origin");
            return CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(methods)
                .allow_headers(headers);
        }

        // Same-origin pages and `<img>` feeds need no CORS headers.
        tracing::info!("CORS: No origins configured, denying cross-origin requests");
        return deny_all();
    }

    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        deny_all()
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}

/// Never emits `Access-Control-Allow-Origin`, whatever the request origin.
fn deny_all() -> CorsLayer {
    CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| false))
}
