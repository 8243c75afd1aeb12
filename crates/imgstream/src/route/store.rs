//! Route storage backends.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlx::SqlitePool;

use super::models::Route;

/// Key-value contract for session → upstream bindings.
///
/// Writes to the same session are last-write-wins; different sessions never
/// contend beyond what the backing store itself serializes.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Insert or replace the binding for `session_id`.
    async fn put(&self, session_id: &str, upstream_uri: &str) -> Result<()>;

    /// Insert the binding only if the session has none. Returns whether it was inserted.
    async fn put_if_absent(&self, session_id: &str, upstream_uri: &str) -> Result<bool>;

    async fn get(&self, session_id: &str) -> Result<Option<String>>;

    /// Remove the binding, returning the upstream it pointed at.
    async fn remove(&self, session_id: &str) -> Result<Option<String>>;

    /// Remove the binding only while it still points at `upstream_uri`.
    async fn remove_if_target(&self, session_id: &str, upstream_uri: &str) -> Result<bool>;

    /// All bindings, ordered by session id.
    async fn list(&self) -> Result<Vec<Route>>;

    /// Remove every binding. Returns how many were removed.
    async fn clear(&self) -> Result<u64>;
}

/// Routes held in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRouteStore {
    routes: DashMap<String, String>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn put(&self, session_id: &str, upstream_uri: &str) -> Result<()> {
        self.routes
            .insert(session_id.to_string(), upstream_uri.to_string());
        Ok(())
    }

    async fn put_if_absent(&self, session_id: &str, upstream_uri: &str) -> Result<bool> {
        match self.routes.entry(session_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(upstream_uri.to_string());
                Ok(true)
            }
        }
    }

    async fn get(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.routes.get(session_id).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.routes.remove(session_id).map(|(_, uri)| uri))
    }

    async fn remove_if_target(&self, session_id: &str, upstream_uri: &str) -> Result<bool> {
        Ok(self
            .routes
            .remove_if(session_id, |_, current| current == upstream_uri)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<Route>> {
        let mut routes: Vec<Route> = self
            .routes
            .iter()
            .map(|entry| Route::new(entry.key().clone(), entry.value().clone()))
            .collect();
        routes.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(routes)
    }

    async fn clear(&self) -> Result<u64> {
        let count = self.routes.len() as u64;
        self.routes.clear();
        Ok(count)
    }
}

/// Routes persisted in the `routes` SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteRouteStore {
    pool: SqlitePool,
}

impl SqliteRouteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteStore for SqliteRouteStore {
    async fn put(&self, session_id: &str, upstream_uri: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO routes (session_id, upstream_uri)
            VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE
            SET upstream_uri = excluded.upstream_uri, updated_at = datetime('now')
            "#,
        )
        .bind(session_id)
        .bind(upstream_uri)
        .execute(&self.pool)
        .await
        .context("upserting route")?;

        Ok(())
    }

    async fn put_if_absent(&self, session_id: &str, upstream_uri: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO routes (session_id, upstream_uri)
            VALUES (?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(upstream_uri)
        .execute(&self.pool)
        .await
        .context("inserting route")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, session_id: &str) -> Result<Option<String>> {
        let uri = sqlx::query_scalar::<_, String>(
            "SELECT upstream_uri FROM routes WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching route")?;

        Ok(uri)
    }

    async fn remove(&self, session_id: &str) -> Result<Option<String>> {
        let uri = sqlx::query_scalar::<_, String>(
            "DELETE FROM routes WHERE session_id = ? RETURNING upstream_uri",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("deleting route")?;

        Ok(uri)
    }

    async fn remove_if_target(&self, session_id: &str, upstream_uri: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM routes WHERE session_id = ? AND upstream_uri = ?")
            .bind(session_id)
            .bind(upstream_uri)
            .execute(&self.pool)
            .await
            .context("deleting route by target")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Route>> {
        let routes = sqlx::query_as::<_, Route>(
            "SELECT session_id, upstream_uri FROM routes ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing routes")?;

        Ok(routes)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM routes")
            .execute(&self.pool)
            .await
            .context("clearing routes")?;

        Ok(result.rows_affected())
    }
}
