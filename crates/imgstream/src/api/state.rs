//! Application state shared across handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AppConfig, SessionConfig, StorageBackend};
use crate::db::Database;
use crate::frame::{FrameSource, HttpFrameSource};
use crate::route::{MemoryRouteStore, RouteRegistry, RouteStore, SqliteRouteStore};
use crate::stream::{StreamRelay, StreamSettings};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RouteRegistry,
    pub relay: Arc<StreamRelay>,
    pub session: Arc<SessionConfig>,
}

impl AppState {
    pub fn new(
        registry: RouteRegistry,
        source: Arc<dyn FrameSource>,
        settings: StreamSettings,
        session: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let relay = StreamRelay::new(registry.clone(), source, settings, shutdown);
        Self {
            registry,
            relay: Arc::new(relay),
            session: Arc::new(session),
        }
    }

    /// Build the route store, frame source and relay described by `config`.
    pub async fn from_config(config: &AppConfig, shutdown: CancellationToken) -> Result<Self> {
        let store: Arc<dyn RouteStore> = match config.storage.backend {
            StorageBackend::Sqlite => {
                let path = config.storage.resolved_database_path()?;
                let db = Database::new(&path).await?;
                info!("Route store: sqlite at {}", path.display());
                Arc::new(SqliteRouteStore::new(db.pool().clone()))
            }
            StorageBackend::Memory => {
                info!("Route store: in-memory");
                Arc::new(MemoryRouteStore::new())
            }
        };

        let registry = RouteRegistry::new(store, config.server.public_base_url());
        let source = HttpFrameSource::new(config.stream.frame_timeout())
            .context("creating frame source")?;

        Ok(Self::new(
            registry,
            Arc::new(source),
            StreamSettings::from_config(&config.stream),
            config.session.clone(),
            shutdown,
        ))
    }
}
