//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{Method, Request, Response, header};
use imgstream::api::{self, AppState};
use imgstream::config::{ServerConfig, SessionConfig};
use imgstream::frame::{FetchError, FrameSource};
use imgstream::route::RouteRegistry;
use imgstream::stream::StreamSettings;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const BASE: &str = "/image-streaming-service/v1";
pub const PUBLIC_BASE: &str = "http://localhost:8385/image-streaming-service/v1";

/// Upstreams answering from per-URI scripts. Unknown or exhausted URIs time out.
#[derive(Default)]
pub struct ScriptedUpstreams {
    scripts: Mutex<HashMap<String, VecDeque<Result<Bytes, FetchError>>>>,
}

impl ScriptedUpstreams {
    pub fn script(&self, uri: &str, responses: Vec<Result<Bytes, FetchError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(uri.to_string(), responses.into());
    }
}

#[async_trait]
impl FrameSource for ScriptedUpstreams {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(uri)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(FetchError::Transient("timed out".to_string())))
    }
}

pub fn frame(data: &'static [u8]) -> Result<Bytes, FetchError> {
    Ok(Bytes::from_static(data))
}

pub fn unreachable() -> Result<Bytes, FetchError> {
    Err(FetchError::Unreachable("connection refused".to_string()))
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub upstreams: Arc<ScriptedUpstreams>,
    pub shutdown: CancellationToken,
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        session: Option<&str>,
        body: Body,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", BASE, path));
        if let Some(session) = session {
            builder = builder.header(header::COOKIE, format!("HBP={}", session));
        }

        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }
}

/// Create a test application with an in-memory registry and scripted upstreams.
pub async fn test_app() -> TestApp {
    test_app_with_server(ServerConfig::default()).await
}

/// Same as [`test_app`], with custom server settings (CORS, debug).
pub async fn test_app_with_server(server: ServerConfig) -> TestApp {
    let registry = RouteRegistry::in_memory(server.public_base_url());
    let upstreams = Arc::new(ScriptedUpstreams::default());
    let shutdown = CancellationToken::new();

    let settings = StreamSettings {
        tick_interval: Duration::from_millis(5),
        write_timeout: Duration::from_secs(1),
        channel_capacity: 8,
    };

    let state = AppState::new(
        registry,
        upstreams.clone(),
        settings,
        SessionConfig::default(),
        shutdown.clone(),
    );
    let router = api::create_router(state.clone(), &server);

    TestApp {
        router,
        state,
        upstreams,
        shutdown,
    }
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
