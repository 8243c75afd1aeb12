//! Route registry errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Route not found for session {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RouteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
