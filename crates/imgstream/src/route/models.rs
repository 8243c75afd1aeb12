//! Route data models.

use serde::{Deserialize, Serialize};

/// A session bound to its upstream frame source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Route {
    pub session_id: String,
    pub upstream_uri: String,
}

impl Route {
    pub fn new(session_id: impl Into<String>, upstream_uri: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            upstream_uri: upstream_uri.into(),
        }
    }

    /// `(session_id, upstream_uri)` pair as listed by the routes endpoint.
    pub fn into_pair(self) -> (String, String) {
        (self.session_id, self.upstream_uri)
    }
}

/// Client-facing route descriptor. Carries the feed URL, never the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRoute {
    pub uri: String,
}

/// Body of a route registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRouteRequest {
    pub uri: String,
}
