//! Session route registry.

use std::sync::Arc;

use tracing::{debug, info};

use super::error::{RouteError, RouteResult};
use super::models::{PublicRoute, Route};
use super::store::{MemoryRouteStore, RouteStore};

/// Path segment clients stream from, relative to the public base URL.
pub const FEED_PATH: &str = "image_streaming_feed";

/// Registry of session → upstream bindings.
///
/// Constructed once per process around a backing store. Cloning is cheap and
/// shares the store.
#[derive(Clone)]
pub struct RouteRegistry {
    store: Arc<dyn RouteStore>,
    public_base_url: Arc<str>,
}

impl RouteRegistry {
    /// Create a registry over `store`. Feed URLs are built under `public_base_url`.
    pub fn new(store: Arc<dyn RouteStore>, public_base_url: impl AsRef<str>) -> Self {
        Self {
            store,
            public_base_url: public_base_url.as_ref().trim_end_matches('/').into(),
        }
    }

    /// Registry backed by process memory.
    pub fn in_memory(public_base_url: impl AsRef<str>) -> Self {
        Self::new(Arc::new(MemoryRouteStore::new()), public_base_url)
    }

    /// Bind `session_id` to `upstream_uri`, replacing any previous binding.
    pub async fn register(&self, session_id: &str, upstream_uri: &str) -> RouteResult<()> {
        self.store.put(session_id, upstream_uri).await?;
        info!(session_id, upstream_uri, "Route registered");
        Ok(())
    }

    /// Bind `session_id` only if it has no route yet. Returns whether a route was created.
    pub async fn ensure(&self, session_id: &str, upstream_uri: &str) -> RouteResult<bool> {
        let created = self.store.put_if_absent(session_id, upstream_uri).await?;
        if created {
            info!(session_id, upstream_uri, "Route self-registered");
        }
        Ok(created)
    }

    /// Client-facing descriptor for a registered session.
    pub async fn lookup_public(&self, session_id: &str) -> RouteResult<PublicRoute> {
        if self.store.get(session_id).await?.is_none() {
            return Err(RouteError::NotFound(session_id.to_string()));
        }

        let route = PublicRoute {
            uri: self.feed_url(session_id),
        };
        debug!(session_id, uri = %route.uri, "Resolved public route");
        Ok(route)
    }

    /// Upstream address for a session. Only the streaming loop should need this.
    pub async fn lookup_target(&self, session_id: &str) -> RouteResult<String> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| RouteError::NotFound(session_id.to_string()))
    }

    pub async fn contains(&self, session_id: &str) -> RouteResult<bool> {
        Ok(self.store.get(session_id).await?.is_some())
    }

    /// Snapshot of all routes, ordered by session id.
    pub async fn list_all(&self) -> RouteResult<Vec<Route>> {
        Ok(self.store.list().await?)
    }

    /// Remove the route for `session_id`, returning the upstream it pointed at.
    pub async fn delete(&self, session_id: &str) -> RouteResult<String> {
        match self.store.remove(session_id).await? {
            Some(uri) => {
                info!(session_id, upstream_uri = %uri, "Route removed");
                Ok(uri)
            }
            None => Err(RouteError::NotFound(session_id.to_string())),
        }
    }

    /// Remove the route only while it still points at `upstream_uri`.
    ///
    /// Used on upstream failure so a route re-registered elsewhere in the
    /// meantime is left alone.
    pub async fn delete_if_target(&self, session_id: &str, upstream_uri: &str) -> RouteResult<bool> {
        let removed = self.store.remove_if_target(session_id, upstream_uri).await?;
        if removed {
            info!(session_id, upstream_uri, "Route deregistered");
        }
        Ok(removed)
    }

    /// Remove every route.
    pub async fn clear(&self) -> RouteResult<u64> {
        let removed = self.store.clear().await?;
        info!(removed, "Routes cleared");
        Ok(removed)
    }

    /// Canonical feed URL for a session.
    pub fn feed_url(&self, session_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url,
            FEED_PATH,
            urlencoding::encode(session_id)
        )
    }
}
